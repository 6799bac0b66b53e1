// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The contract between the core and a wire protocol module. The core never
//! parses bytes itself: it fills a DCB's read queue and hands control to the
//! protocol, which parses messages and pushes them down the session's
//! routing chain.

use crate::error::CoreError;
use crate::session::Session;
use crate::worker::Worker;

use buffer::BufferChain;
use net::Token;

use std::rc::Rc;

/// A loadable protocol implementation. One instance serves every listener
/// configured with it; per-connection state lives in the protocol sessions
/// it creates.
pub trait ProtocolModule: Send + Sync {
    /// Module name, as referenced from listener configuration.
    fn name(&self) -> &'static str;

    /// Allocate the client side protocol for a freshly accepted connection.
    fn create_client_protocol(&self, session: &Rc<Session>) -> Box<dyn ClientProtocol>;

    /// Allocate the backend side protocol for a connection to a server.
    /// Protocols which do not speak to backends return `None` and routers
    /// on top of them cannot connect endpoints.
    fn create_backend_protocol(&self, _session: &Rc<Session>) -> Option<Box<dyn BackendProtocol>> {
        None
    }

    /// A short wire-level message telling a flooding host that access is
    /// temporarily suspended. Written to the raw socket before it is closed.
    fn reject(&self, _host: &str) -> Vec<u8> {
        Vec::new()
    }
}

/// Client-facing protocol session. All methods run on the worker owning the
/// DCB; `read_ready` is never re-entered for the same DCB and is only called
/// with a non-empty read queue or a pending triggered event.
pub trait ClientProtocol {
    /// Called exactly once after the DCB has been registered, before any
    /// `read_ready`. Returning false closes the connection.
    fn init_connection(&mut self, worker: &mut Worker, token: Token) -> bool;

    /// Called right before the DCB itself is closed.
    fn finish_connection(&mut self, worker: &mut Worker, token: Token);

    /// Consume the read queue, parse messages and forward them through the
    /// session's routing chain. Partial data may be left in the read queue;
    /// the core calls again when more data arrives.
    fn read_ready(&mut self, worker: &mut Worker, token: Token) -> Result<(), CoreError>;

    /// Frame an outbound reply and append it to the DCB write queue.
    fn write(&mut self, worker: &mut Worker, token: Token, data: BufferChain) -> bool;

    /// The peer hung up. Returning `Ok` lets the core close the DCB.
    fn hangup(&mut self, worker: &mut Worker, token: Token) -> Result<(), CoreError>;

    /// Compose a server-side "too many connections" message.
    fn connlimit(&mut self, worker: &mut Worker, token: Token, limit: usize);
}

/// Backend-facing protocol session.
pub trait BackendProtocol {
    /// Called once after the backend DCB has been registered. Drives the
    /// backend handshake; queued writes stay on the delay queue until
    /// `established` turns true.
    fn init_connection(&mut self, worker: &mut Worker, token: Token) -> bool;

    fn finish_connection(&mut self, worker: &mut Worker, token: Token);

    /// Parse backend bytes and deliver replies up the session chain.
    fn read_ready(&mut self, worker: &mut Worker, token: Token) -> Result<(), CoreError>;

    /// Frame a routed query for the wire. Implementations append to the
    /// delay queue while the connection is still being established.
    fn write(&mut self, worker: &mut Worker, token: Token, data: BufferChain) -> bool;

    /// The backend hung up. Returning `Ok` lets the core close the DCB.
    fn hangup(&mut self, worker: &mut Worker, token: Token) -> Result<(), CoreError>;

    /// Take a pooled connection into use for a new session. Returning false
    /// means the connection cannot be reused and should be closed.
    fn reuse_connection(
        &mut self,
        _worker: &mut Worker,
        _token: Token,
        _session: &Rc<Session>,
    ) -> bool {
        false
    }

    /// True only after the full backend handshake has completed.
    fn established(&self) -> bool;
}
