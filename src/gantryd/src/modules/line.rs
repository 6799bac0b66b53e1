// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A newline-delimited text protocol. Each client line is one statement;
//! each backend line is one complete reply. Small enough to read in one
//! sitting, yet it exercises the whole substrate: sessions, routing,
//! backend delay queues and connection rejection.

use buffer::{Buf, BufferChain};
use gantry::dcb::DrainMode;
use gantry::protocol::{BackendProtocol, ClientProtocol, ProtocolModule};
use gantry::router::Reply;
use gantry::session::Session;
use gantry::worker::Worker;
use gantry::CoreError;
use net::Token;

use std::rc::Rc;

/// Split complete lines (including the trailing newline) off the front of
/// the chain, leaving any partial line behind.
fn split_complete_lines(data: &mut BufferChain) -> Option<BufferChain> {
    let bytes = data.make_contiguous();
    let last_newline = bytes.iter().rposition(|b| *b == b'\n')?;
    let mut complete = data.take_all();
    let partial = complete.split_off(last_newline + 1);
    *data = partial;
    Some(complete)
}

/// Iterate the individual lines of a chain of complete lines.
fn lines(complete: &mut BufferChain) -> Vec<BufferChain> {
    let mut out = Vec::new();
    loop {
        let bytes = complete.make_contiguous();
        let Some(newline) = bytes.iter().position(|b| *b == b'\n') else {
            break;
        };
        let mut line = complete.take_all();
        let rest = line.split_off(newline + 1);
        *complete = rest;
        out.push(line);
    }
    out
}

#[derive(Default)]
pub struct LineProtocol;

impl ProtocolModule for LineProtocol {
    fn name(&self) -> &'static str {
        "line"
    }

    fn create_client_protocol(&self, session: &Rc<Session>) -> Box<dyn ClientProtocol> {
        Box::new(LineClient {
            session: session.clone(),
        })
    }

    fn create_backend_protocol(&self, session: &Rc<Session>) -> Option<Box<dyn BackendProtocol>> {
        Some(Box::new(LineBackend {
            session: session.clone(),
        }))
    }

    fn reject(&self, _host: &str) -> Vec<u8> {
        b"ERROR access temporarily suspended\n".to_vec()
    }
}

pub struct LineClient {
    session: Rc<Session>,
}

impl ClientProtocol for LineClient {
    fn init_connection(&mut self, worker: &mut Worker, _token: Token) -> bool {
        // no authentication handshake; the session starts immediately
        self.session.start(worker)
    }

    fn finish_connection(&mut self, _worker: &mut Worker, _token: Token) {}

    fn read_ready(&mut self, worker: &mut Worker, token: Token) -> Result<(), CoreError> {
        let mut pending = match worker.dcb_mut(token) {
            Some(dcb) => dcb.readq_release(),
            None => return Ok(()),
        };

        if let Some(mut complete) = split_complete_lines(&mut pending) {
            for line in lines(&mut complete) {
                self.session.retain_statement(&line);
                if !self.session.route_query(worker, line) {
                    worker.trigger_hangup_event(token);
                    break;
                }
            }
        }

        // stash any partial line until more bytes arrive
        if !pending.is_empty() {
            if let Some(dcb) = worker.dcb_mut(token) {
                dcb.readq_set(pending);
            }
        }

        Ok(())
    }

    fn write(&mut self, worker: &mut Worker, token: Token, data: BufferChain) -> bool {
        worker.writeq_append(token, data, DrainMode::Yes)
    }

    fn hangup(&mut self, worker: &mut Worker, _token: Token) -> Result<(), CoreError> {
        self.session.terminate(worker, None);
        Ok(())
    }

    fn connlimit(&mut self, worker: &mut Worker, token: Token, _limit: usize) {
        let message = BufferChain::from(&b"ERROR too many connections\n"[..]);
        worker.writeq_append(token, message, DrainMode::Yes);
    }
}

pub struct LineBackend {
    session: Rc<Session>,
}

impl BackendProtocol for LineBackend {
    fn init_connection(&mut self, _worker: &mut Worker, _token: Token) -> bool {
        true
    }

    fn finish_connection(&mut self, _worker: &mut Worker, _token: Token) {}

    fn read_ready(&mut self, worker: &mut Worker, token: Token) -> Result<(), CoreError> {
        let (mut pending, server) = match worker.dcb_mut(token) {
            Some(dcb) => {
                let server = dcb
                    .server()
                    .map(|s| s.name().to_string())
                    .unwrap_or_default();
                (dcb.readq_release(), server)
            }
            None => return Ok(()),
        };

        if let Some(mut complete) = split_complete_lines(&mut pending) {
            let reply = Reply::new(&server).complete();
            for line in lines(&mut complete) {
                self.session.book_server_response(&server, true);
                self.session.client_reply(worker, line, &reply);
            }
        }

        if !pending.is_empty() {
            if let Some(dcb) = worker.dcb_mut(token) {
                dcb.readq_set(pending);
            }
        }

        Ok(())
    }

    fn write(&mut self, worker: &mut Worker, token: Token, data: BufferChain) -> bool {
        let established = match worker.dcb(token) {
            Some(dcb) => dcb.stream_established(),
            None => return false,
        };
        if established {
            worker.writeq_append(token, data, DrainMode::Yes)
        } else {
            // parked until the connect completes; the worker releases the
            // delay queue on the first writable event
            match worker.dcb_mut(token) {
                Some(dcb) => {
                    dcb.delayq_append(data);
                    true
                }
                None => false,
            }
        }
    }

    fn hangup(&mut self, worker: &mut Worker, token: Token) -> Result<(), CoreError> {
        let server = worker
            .dcb(token)
            .and_then(|d| d.server().map(|s| s.name().to_string()))
            .unwrap_or_default();
        let reply = Reply::new(&server).with_error("backend connection lost");
        let error = BufferChain::from(&b"ERROR backend connection lost\n"[..]);
        self.session
            .handle_backend_error(worker, token, Some(error), &reply);
        Ok(())
    }

    fn established(&self) -> bool {
        // the line protocol has no backend handshake; the transport state
        // alone decides when queued writes may flush
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines() {
        let mut data = BufferChain::from(&b"one\ntwo\nthr"[..]);
        let mut complete = split_complete_lines(&mut data).expect("two complete lines");
        assert_eq!(complete.len(), 8);
        assert_eq!(data.len(), 3);

        let lines = lines(&mut complete);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].chunk(), b"one\n");
        assert_eq!(lines[1].chunk(), b"two\n");
    }

    #[test]
    fn no_complete_line() {
        let mut data = BufferChain::from(&b"partial"[..]);
        assert!(split_complete_lines(&mut data).is_none());
        assert_eq!(data.len(), 7);
    }
}
