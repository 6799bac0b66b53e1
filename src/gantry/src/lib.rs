// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The connection-and-session substrate of the gantry database proxy.
//!
//! Every protocol and router sits on top of four pieces: the per-worker
//! event loop ([`worker::Worker`]), the descriptor control block
//! ([`dcb::Dcb`]) wrapping one non-blocking socket, the [`listener::Listener`]
//! producing client connections, and the [`session::Session`] binding one
//! client to a router and its backend endpoints.
//!
//! Workers are plain OS threads, each owning a mio poll instance. A DCB and
//! the session it belongs to are pinned to one worker for their entire
//! lifetime; all cross-worker communication happens by posting tasks.

#[macro_use]
extern crate log;

pub mod dcb;
mod error;
pub mod listener;
pub mod process;
pub mod protocol;
pub mod router;
pub mod session;
pub mod worker;

pub use buffer::{Buf, BufferChain};
pub use error::CoreError;

use net::Token;

/// Token reserved for the per-worker waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Upper bound on connections accepted in one readiness event so a busy
/// listener cannot starve the rest of the worker.
pub(crate) const ACCEPT_BATCH: usize = 128;
