// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Harness shared by the integration tests: a single worker driven on the
//! test thread, a minimal text protocol and a pair of routers (echo and
//! forward-to-backend) with observable counters.

#![allow(dead_code)]

use buffer::BufferChain;
use gantry::dcb::{DrainMode, Role};
use gantry::listener::{Listener, ListenerKind};
use gantry::protocol::{BackendProtocol, ClientProtocol, ProtocolModule};
use gantry::router::{
    Endpoint, FilterModule, FilterSession, Flow, Reply, ReplyRoute, RouterModule, RouterSession,
    Service, Target,
};
use gantry::session::Session;
use gantry::worker::{Worker, WorkerBuilder, Workers};
use gantry::CoreError;
use net::Token;

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn unique_name(prefix: &str) -> String {
    format!(
        "{}-{}",
        prefix,
        NAME_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Observable counters shared between a test and the protocol sessions it
/// spawns.
#[derive(Default)]
pub struct ProtoCounters {
    pub init_calls: AtomicUsize,
    pub read_calls: AtomicUsize,
    pub hangup_calls: AtomicUsize,
}

/// A minimal protocol: every readable chunk is one "statement". When
/// `trigger_on_first_read` is set, the first `read_ready` queues a
/// synthetic read event before returning.
pub struct TestProtocol {
    pub counters: Arc<ProtoCounters>,
    pub trigger_on_first_read: bool,
}

impl TestProtocol {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: Arc::new(ProtoCounters::default()),
            trigger_on_first_read: false,
        })
    }

    pub fn with_trigger() -> Arc<Self> {
        Arc::new(Self {
            counters: Arc::new(ProtoCounters::default()),
            trigger_on_first_read: true,
        })
    }
}

impl ProtocolModule for TestProtocol {
    fn name(&self) -> &'static str {
        "test"
    }

    fn create_client_protocol(&self, session: &Rc<Session>) -> Box<dyn ClientProtocol> {
        Box::new(TestClient {
            session: session.clone(),
            counters: self.counters.clone(),
            trigger_on_first_read: self.trigger_on_first_read,
        })
    }

    fn create_backend_protocol(&self, session: &Rc<Session>) -> Option<Box<dyn BackendProtocol>> {
        Some(Box::new(TestBackend {
            session: session.clone(),
        }))
    }

    fn reject(&self, _host: &str) -> Vec<u8> {
        b"REJECTED\n".to_vec()
    }
}

pub struct TestClient {
    session: Rc<Session>,
    counters: Arc<ProtoCounters>,
    trigger_on_first_read: bool,
}

impl ClientProtocol for TestClient {
    fn init_connection(&mut self, worker: &mut Worker, _token: Token) -> bool {
        self.counters.init_calls.fetch_add(1, Ordering::Relaxed);
        self.session.start(worker)
    }

    fn finish_connection(&mut self, _worker: &mut Worker, _token: Token) {}

    fn read_ready(&mut self, worker: &mut Worker, token: Token) -> Result<(), CoreError> {
        let calls = self.counters.read_calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.trigger_on_first_read && calls == 1 {
            worker.trigger_read_event(token);
        }

        let pending = match worker.dcb_mut(token) {
            Some(dcb) => dcb.readq_release(),
            None => return Ok(()),
        };
        if !pending.is_empty() {
            self.session.retain_statement(&pending);
            if !self.session.route_query(worker, pending) {
                worker.trigger_hangup_event(token);
            }
        }
        Ok(())
    }

    fn write(&mut self, worker: &mut Worker, token: Token, data: BufferChain) -> bool {
        worker.writeq_append(token, data, DrainMode::Yes)
    }

    fn hangup(&mut self, worker: &mut Worker, _token: Token) -> Result<(), CoreError> {
        self.counters.hangup_calls.fetch_add(1, Ordering::Relaxed);
        self.session.terminate(worker, None);
        Ok(())
    }

    fn connlimit(&mut self, worker: &mut Worker, token: Token, _limit: usize) {
        let message = BufferChain::from(&b"TOO MANY CONNECTIONS\n"[..]);
        worker.writeq_append(token, message, DrainMode::Yes);
    }
}

pub struct TestBackend {
    session: Rc<Session>,
}

impl BackendProtocol for TestBackend {
    fn init_connection(&mut self, _worker: &mut Worker, _token: Token) -> bool {
        true
    }

    fn finish_connection(&mut self, _worker: &mut Worker, _token: Token) {}

    fn read_ready(&mut self, worker: &mut Worker, token: Token) -> Result<(), CoreError> {
        let (pending, server) = match worker.dcb_mut(token) {
            Some(dcb) => {
                let server = dcb
                    .server()
                    .map(|s| s.name().to_string())
                    .unwrap_or_default();
                (dcb.readq_release(), server)
            }
            None => return Ok(()),
        };
        if !pending.is_empty() {
            self.session.book_server_response(&server, true);
            let reply = Reply::new(&server).complete();
            self.session.client_reply(worker, pending, &reply);
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
        let reply = Reply::default().with_error("backend connection lost");
        self.session.handle_backend_error(worker, token, None, &reply);
        Ok(())
    }

    fn established(&self) -> bool {
        true
    }
}

/// Router that bounces every query straight back as its own reply.
pub struct EchoRouter;

impl RouterModule for EchoRouter {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn new_session(
        &self,
        _session: &Rc<Session>,
        _endpoints: Vec<Endpoint>,
    ) -> Option<Box<dyn RouterSession>> {
        Some(Box::new(EchoSession))
    }
}

pub struct EchoSession;

impl RouterSession for EchoSession {
    fn connect(&mut self, _worker: &mut Worker, _session: &Rc<Session>) -> Result<(), CoreError> {
        Ok(())
    }

    fn route_query(
        &mut self,
        worker: &mut Worker,
        session: &Rc<Session>,
        data: BufferChain,
    ) -> Result<(), CoreError> {
        session.book_server_response("echo", true);
        let reply = Reply::new("echo").complete();
        session.client_reply(worker, data, &reply);
        Ok(())
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
        _worker: &mut Worker,
        _session: &Rc<Session>,
        _problem: Token,
        _error: Option<BufferChain>,
        _reply: &Reply,
    ) -> bool {
        false
    }
}

/// Router that forwards every query to its first endpoint.
pub struct ForwardRouter;

impl RouterModule for ForwardRouter {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn new_session(
        &self,
        _session: &Rc<Session>,
        endpoints: Vec<Endpoint>,
    ) -> Option<Box<dyn RouterSession>> {
        if endpoints.is_empty() {
            return None;
        }
        Some(Box::new(ForwardSession { endpoints }))
    }
}

pub struct ForwardSession {
    endpoints: Vec<Endpoint>,
}

impl RouterSession for ForwardSession {
    fn connect(&mut self, worker: &mut Worker, _session: &Rc<Session>) -> Result<(), CoreError> {
        self.endpoints[0].connect(worker)
    }

    fn route_query(
        &mut self,
        worker: &mut Worker,
        _session: &Rc<Session>,
        data: BufferChain,
    ) -> Result<(), CoreError> {
        if self.endpoints[0].route_query(worker, data) {
            Ok(())
        } else {
            Err(CoreError::Router("backend endpoint not open".to_string()))
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
        false
    }

    fn close(&mut self, worker: &mut Worker, _session: &Rc<Session>) {
        for endpoint in &self.endpoints {
            endpoint.close(worker);
        }
    }
}

/// Filter that answers the first query itself by storing a canned response.
pub struct ShortCircuitFilter {
    pub response: &'static [u8],
    pub fired: Arc<AtomicUsize>,
}

impl FilterModule for ShortCircuitFilter {
    fn name(&self) -> &'static str {
        "short-circuit"
    }

    fn new_session(&self, _session: &Rc<Session>) -> Box<dyn FilterSession> {
        Box::new(ShortCircuitSession {
            response: self.response,
            fired: self.fired.clone(),
        })
    }
}

struct ShortCircuitSession {
    response: &'static [u8],
    fired: Arc<AtomicUsize>,
}

impl FilterSession for ShortCircuitSession {
    fn route_query(
        &mut self,
        _worker: &mut Worker,
        session: &Rc<Session>,
        index: usize,
        _data: BufferChain,
    ) -> Result<Flow, CoreError> {
        self.fired.fetch_add(1, Ordering::Relaxed);
        assert!(session.set_response(index, BufferChain::from(self.response)));
        Ok(Flow::Consume)
    }

    fn client_reply(
        &mut self,
        _worker: &mut Worker,
        _session: &Rc<Session>,
        data: BufferChain,
        _route: &ReplyRoute,
        _reply: &Reply,
    ) -> Result<Flow, CoreError> {
        Ok(Flow::Forward(data))
    }
}

/// One worker, one listener, driven from the test thread.
pub struct Rig {
    pub worker: Worker,
    pub listener: Arc<Listener>,
    pub addr: SocketAddr,
}

pub struct RigOptions {
    pub protocol: Arc<dyn ProtocolModule>,
    pub router: Arc<dyn RouterModule>,
    pub filters: Vec<Arc<dyn FilterModule>>,
    pub targets: Vec<SocketAddr>,
    pub high_water: usize,
    pub low_water: usize,
    pub idle_timeout_ms: u64,
    pub retain_last_statements: Option<u32>,
    pub max_connections: usize,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            protocol: TestProtocol::new(),
            router: Arc::new(EchoRouter),
            filters: Vec::new(),
            targets: Vec::new(),
            high_water: 0,
            low_water: 0,
            idle_timeout_ms: 0,
            retain_last_statements: None,
            max_connections: 0,
        }
    }
}

pub fn rig(options: RigOptions) -> Rig {
    let builder = WorkerBuilder::new(0)
        .expect("failed to create worker")
        .timeout(Duration::from_millis(10))
        .watermarks(options.high_water, options.low_water)
        .idle_timeout(options.idle_timeout_ms);
    let workers = Workers::new(vec![builder.handle()]);
    let mut worker = builder.build(workers.clone(), None);

    let mut service = Service::builder(&unique_name("svc"), options.router)
        .max_connections(options.max_connections);
    if let Some(depth) = options.retain_last_statements {
        service = service.retain_last_statements(depth);
    }
    for (i, target) in options.targets.iter().enumerate() {
        service = service.target(Arc::new(Target::new(&format!("backend-{}", i), *target)));
    }
    for filter in options.filters {
        service = service.filter(filter);
    }
    let service = service.build();

    let mut definition = config::Listener::new(
        &unique_name("listener"),
        service.name(),
        "test",
        ListenerKind::Shared,
    );
    definition.set_address("127.0.0.1");
    definition.set_port(0);

    let listener = Listener::create(definition, service, options.protocol, None)
        .expect("failed to create listener");
    listener.listen(&workers).expect("failed to listen");

    // the register task is queued; one turn makes the socket live
    worker.run_once(Some(Duration::from_millis(1)));
    let addr = listener.bound_addr().expect("listener has no bound addr");

    Rig {
        worker,
        listener,
        addr,
    }
}

impl Rig {
    /// Run a few loop turns with a short poll timeout.
    pub fn spin(&mut self, turns: usize) {
        for _ in 0..turns {
            self.worker.run_once(Some(Duration::from_millis(10)));
        }
    }

    /// The first client session on the worker, with its DCB token.
    pub fn find_client(&self) -> Option<(Token, Rc<Session>)> {
        let mut found = None;
        self.worker.dcb_foreach(|dcb| {
            if dcb.role() == Role::Client && !dcb.is_closed() {
                if let Some(session) = dcb.session() {
                    found = Some(session.clone());
                    return false;
                }
            }
            true
        });
        let session = found?;
        let token = session.client_token()?;
        Some((token, session))
    }

    pub fn client_count(&self) -> usize {
        self.worker.dcb_count_by_role(Role::Client)
    }
}

/// Blocking client socket with a read timeout, for driving the rig.
pub fn connect(addr: SocketAddr) -> std::net::TcpStream {
    let stream = std::net::TcpStream::connect(addr).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .expect("failed to set read timeout");
    stream
}

/// Read until `expected` bytes have arrived or the socket times out.
pub fn read_exact_bytes(stream: &mut std::net::TcpStream, expected: usize) -> Vec<u8> {
    let mut out = vec![0u8; expected];
    let mut filled = 0;
    while filled < expected {
        match stream.read(&mut out[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => break,
        }
    }
    out.truncate(filled);
    out
}

/// A blocking echo server on its own thread, standing in for a backend
/// database. Echoes every received chunk verbatim.
pub fn spawn_echo_backend() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind backend");
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}
