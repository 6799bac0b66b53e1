// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The router and filter side of the session pipeline. Queries travel down
//! through the filter chain into the router, which addresses backends
//! through opaque [`Endpoint`] handles; replies travel back up the chain to
//! the client.

use crate::error::CoreError;
use crate::session::Session;
use crate::worker::Worker;

use buffer::BufferChain;
use net::Token;

use std::any::Any;
use std::cell::{Cell, RefCell, RefMut};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// A backend destination. Resolution happens at configuration time; the
/// core never does DNS on the accept or routing path.
#[derive(Debug)]
pub struct Target {
    name: String,
    address: SocketAddr,
}

impl Target {
    pub fn new(name: &str, address: SocketAddr) -> Self {
        Self {
            name: name.to_string(),
            address,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

/// Per-service counters. Read-mostly; bumped when sessions start and end.
#[derive(Default, Debug)]
pub struct ServiceStats {
    pub n_connections: AtomicUsize,
    pub n_current: AtomicUsize,
}

/// A service couples a router module with the targets it may route to and
/// the filters applied to every session.
pub struct Service {
    name: String,
    router: Arc<dyn RouterModule>,
    filters: Vec<Arc<dyn FilterModule>>,
    targets: Vec<Arc<Target>>,
    max_connections: usize,
    retain_last_statements: Option<u32>,
    stats: ServiceStats,
}

impl Service {
    pub fn new(name: &str, router: Arc<dyn RouterModule>, targets: Vec<Arc<Target>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            router,
            filters: Vec::new(),
            targets,
            max_connections: 0,
            retain_last_statements: None,
            stats: ServiceStats::default(),
        })
    }

    pub fn builder(name: &str, router: Arc<dyn RouterModule>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.to_string(),
            router,
            filters: Vec::new(),
            targets: Vec::new(),
            max_connections: 0,
            retain_last_statements: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &Arc<dyn RouterModule> {
        &self.router
    }

    pub fn filters(&self) -> &[Arc<dyn FilterModule>] {
        &self.filters
    }

    pub fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }

    /// Connection limit; zero means unlimited.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Service-level override of the process-wide query retention depth.
    pub fn retain_last_statements(&self) -> Option<u32> {
        self.retain_last_statements
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    /// Create one endpoint per target for a new router session.
    pub fn endpoints(&self, session: &Rc<Session>) -> Vec<Endpoint> {
        self.targets
            .iter()
            .map(|t| Endpoint::new(t.clone(), Rc::downgrade(session)))
            .collect()
    }
}

pub struct ServiceBuilder {
    name: String,
    router: Arc<dyn RouterModule>,
    filters: Vec<Arc<dyn FilterModule>>,
    targets: Vec<Arc<Target>>,
    max_connections: usize,
    retain_last_statements: Option<u32>,
}

impl ServiceBuilder {
    pub fn target(mut self, target: Arc<Target>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn filter(mut self, filter: Arc<dyn FilterModule>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn max_connections(mut self, limit: usize) -> Self {
        self.max_connections = limit;
        self
    }

    pub fn retain_last_statements(mut self, depth: u32) -> Self {
        self.retain_last_statements = Some(depth);
        self
    }

    pub fn build(self) -> Arc<Service> {
        Arc::new(Service {
            name: self.name,
            router: self.router,
            filters: self.filters,
            targets: self.targets,
            max_connections: self.max_connections,
            retain_last_statements: self.retain_last_statements,
            stats: ServiceStats::default(),
        })
    }
}

/// The path a reply took on its way up, as target names in traversal order.
#[derive(Default, Debug)]
pub struct ReplyRoute(Vec<String>);

impl ReplyRoute {
    pub fn push(&mut self, target: &str) {
        self.0.push(target.to_string());
    }

    pub fn targets(&self) -> &[String] {
        &self.0
    }
}

/// Summary of the reply being delivered upstream.
#[derive(Default, Debug, Clone)]
pub struct Reply {
    target: Option<String>,
    is_complete: bool,
    error: Option<String>,
}

impl Reply {
    pub fn new(target: &str) -> Self {
        Self {
            target: Some(target.to_string()),
            is_complete: false,
            error: None,
        }
    }

    pub fn complete(mut self) -> Self {
        self.is_complete = true;
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// What a filter or router did with a buffer travelling through it.
pub enum Flow {
    /// Pass the (possibly rewritten) buffer to the next stage.
    Forward(BufferChain),
    /// The stage consumed the buffer; the traversal stops here.
    Consume,
}

/// One stage of the downstream/upstream pipeline. The session drives the
/// chain: buffers enter `route_query` in configuration order and replies
/// pass `client_reply` in reverse order.
pub trait FilterSession {
    /// `index` identifies this filter within the session's chain and is the
    /// handle to pass to [`Session::set_response`] when short-circuiting.
    fn route_query(
        &mut self,
        worker: &mut Worker,
        session: &Rc<Session>,
        index: usize,
        data: BufferChain,
    ) -> Result<Flow, CoreError>;

    fn client_reply(
        &mut self,
        worker: &mut Worker,
        session: &Rc<Session>,
        data: BufferChain,
        route: &ReplyRoute,
        reply: &Reply,
    ) -> Result<Flow, CoreError>;
}

/// Factory for per-session filter state.
pub trait FilterModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn new_session(&self, session: &Rc<Session>) -> Box<dyn FilterSession>;
}

/// The terminal stage of the pipeline: routes queries to one or more
/// backend endpoints and relays their replies upstream.
pub trait RouterSession {
    /// Connect whatever endpoints the router needs before the first query.
    /// Called from `Session::start`.
    fn connect(&mut self, worker: &mut Worker, session: &Rc<Session>) -> Result<(), CoreError>;

    fn route_query(
        &mut self,
        worker: &mut Worker,
        session: &Rc<Session>,
        data: BufferChain,
    ) -> Result<(), CoreError>;

    /// A backend replied. Return `Flow::Forward` to relay the buffer to the
    /// filters and the client, or `Flow::Consume` to withhold it.
    fn client_reply(
        &mut self,
        worker: &mut Worker,
        session: &Rc<Session>,
        data: BufferChain,
        route: &mut ReplyRoute,
        reply: &Reply,
    ) -> Result<Flow, CoreError>;

    /// A backend failed. Return true when the session can continue; false
    /// makes the core terminate the session after forwarding the error.
    fn handle_error(
        &mut self,
        worker: &mut Worker,
        session: &Rc<Session>,
        problem: Token,
        error: Option<BufferChain>,
        reply: &Reply,
    ) -> bool;

    /// The session is closing; release endpoints.
    fn close(&mut self, _worker: &mut Worker, _session: &Rc<Session>) {}
}

/// Factory for router sessions.
pub trait RouterModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn new_session(
        &self,
        session: &Rc<Session>,
        endpoints: Vec<Endpoint>,
    ) -> Option<Box<dyn RouterSession>>;
}

/// An opaque handle a router uses to address one backend destination. The
/// core does not interpret the userdata slot.
pub struct Endpoint {
    target: Arc<Target>,
    session: Weak<Session>,
    token: Cell<Option<Token>>,
    userdata: RefCell<Option<Box<dyn Any>>>,
}

impl Endpoint {
    fn new(target: Arc<Target>, session: Weak<Session>) -> Self {
        Self {
            target,
            session,
            token: Cell::new(None),
            userdata: RefCell::new(None),
        }
    }

    pub fn target(&self) -> &str {
        self.target.name()
    }

    /// Open a backend connection on the session's worker. Attaching the
    /// backend DCB takes a session reference which is dropped again when
    /// the backend detaches.
    pub fn connect(&self, worker: &mut Worker) -> Result<(), CoreError> {
        if self.is_open() {
            return Ok(());
        }
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| CoreError::Internal("endpoint outlived its session".to_string()))?;
        let token = worker.connect_backend(self.target.clone(), &session)?;
        self.token.set(Some(token));
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        match (self.token.get(), self.session.upgrade()) {
            (Some(token), Some(session)) => session.has_backend(token),
            _ => false,
        }
    }

    /// Send a buffer towards this backend. The backend protocol frames it
    /// and parks it on the delay queue while the connection is still being
    /// established.
    pub fn route_query(&self, worker: &mut Worker, data: BufferChain) -> bool {
        match self.token.get() {
            Some(token) if self.is_open() => worker.protocol_write(token, data),
            _ => false,
        }
    }

    /// Close the backend connection behind this endpoint.
    pub fn close(&self, worker: &mut Worker) {
        if let Some(token) = self.token.take() {
            worker.close_dcb(token);
        }
    }

    pub fn token(&self) -> Option<Token> {
        self.token.get()
    }

    /// Store router-private per-endpoint state.
    pub fn set_userdata(&self, data: Box<dyn Any>) {
        *self.userdata.borrow_mut() = Some(data);
    }

    pub fn userdata_mut(&self) -> RefMut<'_, Option<Box<dyn Any>>> {
        self.userdata.borrow_mut()
    }
}
