// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A router that pins every session to its service's first target. The
//! simplest useful terminal stage of the pipeline; anything smarter (load
//! balancing, read/write splitting, fan-out) replaces this module without
//! the core noticing.

use buffer::BufferChain;
use gantry::router::{Endpoint, Flow, Reply, ReplyRoute, RouterModule, RouterSession};
use gantry::session::Session;
use gantry::worker::Worker;
use gantry::CoreError;
use net::Token;

use std::rc::Rc;

#[derive(Default)]
pub struct PassthroughRouter;

impl RouterModule for PassthroughRouter {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn new_session(
        &self,
        _session: &Rc<Session>,
        endpoints: Vec<Endpoint>,
    ) -> Option<Box<dyn RouterSession>> {
        if endpoints.is_empty() {
            error!("passthrough router requires at least one target");
            return None;
        }
        Some(Box::new(PassthroughSession { endpoints }))
    }
}

pub struct PassthroughSession {
    endpoints: Vec<Endpoint>,
}

impl PassthroughSession {
    fn backend(&self) -> &Endpoint {
        &self.endpoints[0]
    }
}

impl RouterSession for PassthroughSession {
    fn connect(&mut self, worker: &mut Worker, _session: &Rc<Session>) -> Result<(), CoreError> {
        self.backend().connect(worker)
    }

    fn route_query(
        &mut self,
        worker: &mut Worker,
        _session: &Rc<Session>,
        data: BufferChain,
    ) -> Result<(), CoreError> {
        if self.backend().route_query(worker, data) {
            Ok(())
        } else {
            Err(CoreError::Router(format!(
                "no open connection to '{}'",
                self.backend().target()
            )))
        }
    }

    fn client_reply(
        &mut self,
        _worker: &mut Worker,
        _session: &Rc<Session>,
        data: BufferChain,
        _route: &mut ReplyRoute,
        _reply: &Reply,
    ) -> Result<Flow, CoreError> {
        Ok(Flow::Forward(data))
    }

    fn handle_error(
        &mut self,
        worker: &mut Worker,
        _session: &Rc<Session>,
        problem: Token,
        _error: Option<BufferChain>,
        _reply: &Reply,
    ) -> bool {
        for endpoint in &self.endpoints {
            if endpoint.token() == Some(problem) {
                endpoint.close(worker);
            }
        }
        // a single backend leaves nothing to fail over to
        false
    }

    fn close(&mut self, worker: &mut Worker, _session: &Rc<Session>) {
        for endpoint in &self.endpoints {
            endpoint.close(worker);
        }
    }
}
