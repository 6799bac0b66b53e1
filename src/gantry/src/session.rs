// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The session: the object binding one client connection to a router
//! instance and its backend connections. Sessions are pinned to the worker
//! that accepted the client; within that worker they are shared through
//! `Rc`, whose strong count is the session's reference count. The client
//! DCB, every attached backend DCB and any delayed routing task each hold
//! one reference.

use crate::error::CoreError;
use crate::listener::Listener;
use crate::router::{Flow, Reply, ReplyRoute, RouterSession, Service};
use crate::worker::Worker;

use buffer::BufferChain;
use chrono::{DateTime, Local};
use config::DumpStatements;
use net::Token;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

// Session-scoped variable names must carry this prefix.
const VARIABLE_PREFIX: &str = "@gantry.";

// Process-wide state. The id generator is the only piece of it that is hot;
// the knobs are read-mostly and written at config/admin time.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static RETAIN_LAST_STATEMENTS: AtomicU32 = AtomicU32::new(0);
static DUMP_STATEMENTS: AtomicU8 = AtomicU8::new(0);
static SESSION_TRACE: AtomicU32 = AtomicU32::new(0);

pub fn session_get_next_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn session_set_retain_last_statements(n: u32) {
    RETAIN_LAST_STATEMENTS.store(n, Ordering::Relaxed);
}

pub fn session_get_retain_last_statements() -> u32 {
    RETAIN_LAST_STATEMENTS.load(Ordering::Relaxed)
}

pub fn session_set_dump_statements(value: DumpStatements) {
    let encoded = match value {
        DumpStatements::Never => 0,
        DumpStatements::OnClose => 1,
        DumpStatements::OnError => 2,
    };
    DUMP_STATEMENTS.store(encoded, Ordering::Relaxed);
}

pub fn session_get_dump_statements() -> DumpStatements {
    match DUMP_STATEMENTS.load(Ordering::Relaxed) {
        1 => DumpStatements::OnClose,
        2 => DumpStatements::OnError,
        _ => DumpStatements::Never,
    }
}

pub fn session_set_session_trace(depth: u32) {
    SESSION_TRACE.store(depth, Ordering::Relaxed);
}

pub fn session_get_session_trace() -> u32 {
    SESSION_TRACE.load(Ordering::Relaxed)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Stopping,
    Failed,
    Free,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "Session created",
            SessionState::Started => "Session started",
            SessionState::Stopping => "Stopping session",
            SessionState::Failed => "Session creation failed",
            SessionState::Free => "Freed session",
        }
    }
}

/// Transaction state of the client connection, tracked for routers that
/// need to pin transactional work to one backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrxState {
    Inactive,
    Active,
    ReadOnly,
    ReadWrite,
    ReadOnlyEnding,
    ReadWriteEnding,
}

impl TrxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrxState::Inactive => "TRX_INACTIVE",
            TrxState::Active => "TRX_ACTIVE",
            TrxState::ReadOnly => "TRX_READ_ONLY",
            TrxState::ReadWrite => "TRX_READ_WRITE",
            TrxState::ReadOnlyEnding => "TRX_READ_ONLY_ENDING",
            TrxState::ReadWriteEnding => "TRX_READ_WRITE_ENDING",
        }
    }
}

/// Why the session was closed, surfaced in the admin JSON.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    None,
    Timeout,
    HandleErrorFailed,
    RoutingFailed,
    Killed,
    TooManyConnections,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::None => "",
            CloseReason::Timeout => "Timed out by Gantry",
            CloseReason::HandleErrorFailed => {
                "Router could not recover from connection errors"
            }
            CloseReason::RoutingFailed => "Router could not route query",
            CloseReason::Killed => "Killed by another connection",
            CloseReason::TooManyConnections => "Too many connections",
        }
    }
}

/// Handler for one session variable. Receives the lower-cased name and the
/// raw value slice; rejects the value by returning an error message.
pub type VariableHandler = Box<dyn Fn(&str, &str) -> Result<(), String>>;

struct PendingResponse {
    from_filter: usize,
    buffer: BufferChain,
}

/// Book-keeping for one retained client statement.
pub struct QueryInfo {
    query: BufferChain,
    received: DateTime<Local>,
    completed: Option<DateTime<Local>>,
    responses: Vec<(String, DateTime<Local>)>,
    complete: bool,
}

impl QueryInfo {
    fn new(query: BufferChain) -> Self {
        Self {
            query,
            received: Local::now(),
            completed: None,
            responses: Vec::new(),
            complete: false,
        }
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    fn book_server_response(&mut self, server: &str, final_response: bool) {
        // a particular server may be reported only once per query
        debug_assert!(!self.complete);
        debug_assert!(!self.responses.iter().any(|(name, _)| name == server));

        let now = Local::now();
        self.responses.push((server.to_string(), now));
        self.complete = final_response;
        if final_response {
            self.completed = Some(now);
        }
    }

    fn book_as_complete(&mut self) {
        self.completed = Some(Local::now());
        self.complete = true;
    }

    fn reset_server_bookkeeping(&mut self) {
        self.responses.clear();
        self.completed = None;
        self.complete = false;
    }

    fn statement_text(&self) -> String {
        let mut head = vec![0u8; std::cmp::min(self.query.len(), 1024)];
        let n = self.query.copy_out(0, &mut head);
        head.truncate(n);
        String::from_utf8_lossy(&head).trim_end().to_string()
    }

    fn as_json(&self) -> serde_json::Value {
        let statement = self.statement_text();
        let command = statement
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_uppercase();

        let mut value = serde_json::json!({
            "command": command,
            "statement": statement,
            "received": self.received.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        });

        if let Some(completed) = &self.completed {
            value["completed"] =
                serde_json::Value::String(completed.format("%Y-%m-%dT%H:%M:%S%.3f").to_string());
        }

        let responses: Vec<serde_json::Value> = self
            .responses
            .iter()
            .map(|(server, processed)| {
                let duration = (*processed - self.received).num_milliseconds();
                serde_json::json!({ "server": server, "duration": duration })
            })
            .collect();
        value["responses"] = serde_json::Value::Array(responses);

        value
    }
}

/// One client session. All fields are owner-worker local; the type is
/// deliberately neither `Send` nor `Sync`.
pub struct Session {
    id: u64,
    owner: usize,
    state: Cell<SessionState>,
    listener: Arc<Listener>,
    service: Arc<Service>,
    remote: String,
    user: RefCell<String>,
    connected: DateTime<Local>,
    client_token: Cell<Option<Token>>,
    backends: RefCell<Vec<Token>>,
    filters: RefCell<Vec<Box<dyn crate::router::FilterSession>>>,
    router: RefCell<Option<Box<dyn RouterSession>>>,
    response: RefCell<Option<PendingResponse>>,
    pending_client_writes: RefCell<VecDeque<BufferChain>>,
    trx_state: Cell<TrxState>,
    autocommit: Cell<bool>,
    protocol_data: RefCell<Option<Box<dyn std::any::Any>>>,
    close_reason: Cell<CloseReason>,
    retain_last_statements: usize,
    queries: RefCell<VecDeque<QueryInfo>>,
    current_query: Cell<isize>,
    variables: RefCell<HashMap<String, VariableHandler>>,
    log: RefCell<VecDeque<String>>,
    started: Cell<bool>,
}

impl Session {
    pub fn new(listener: &Arc<Listener>, owner: usize, remote: String) -> Rc<Self> {
        let service = listener.service().clone();

        // the service may override the process-wide retention depth
        let retain = service
            .retain_last_statements()
            .unwrap_or_else(session_get_retain_last_statements) as usize;

        Rc::new(Self {
            id: session_get_next_id(),
            owner,
            state: Cell::new(SessionState::Created),
            listener: listener.clone(),
            service,
            remote,
            user: RefCell::new(String::new()),
            connected: Local::now(),
            client_token: Cell::new(None),
            backends: RefCell::new(Vec::new()),
            filters: RefCell::new(Vec::new()),
            router: RefCell::new(None),
            response: RefCell::new(None),
            pending_client_writes: RefCell::new(VecDeque::new()),
            trx_state: Cell::new(TrxState::Inactive),
            autocommit: Cell::new(true),
            protocol_data: RefCell::new(None),
            close_reason: Cell::new(CloseReason::None),
            retain_last_statements: retain,
            queries: RefCell::new(VecDeque::new()),
            current_query: Cell::new(-1),
            variables: RefCell::new(HashMap::new()),
            log: RefCell::new(VecDeque::new()),
            started: Cell::new(false),
        })
    }

    /// Instantiate the filter chain and the router session. Must be called
    /// once before `start`.
    pub fn setup_pipeline(self: &Rc<Self>) -> Result<(), CoreError> {
        let mut filters = Vec::new();
        for module in self.service.filters() {
            filters.push(module.new_session(self));
        }
        *self.filters.borrow_mut() = filters;

        let endpoints = self.service.endpoints(self);
        let router = self
            .service
            .router()
            .new_session(self, endpoints)
            .ok_or_else(|| {
                self.state.set(SessionState::Failed);
                CoreError::Router("router refused session".to_string())
            })?;
        *self.router.borrow_mut() = Some(router);
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> usize {
        self.owner
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn user(&self) -> String {
        self.user.borrow().clone()
    }

    pub fn set_user(&self, user: &str) {
        *self.user.borrow_mut() = user.to_string();
    }

    pub fn client_token(&self) -> Option<Token> {
        self.client_token.get()
    }

    pub(crate) fn set_client_token(&self, token: Token) {
        debug_assert!(self.client_token.get().is_none());
        self.client_token.set(Some(token));
    }

    pub fn trx_state(&self) -> TrxState {
        self.trx_state.get()
    }

    pub fn set_trx_state(&self, state: TrxState) -> TrxState {
        let previous = self.trx_state.get();
        self.trx_state.set(state);
        previous
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit.get()
    }

    pub fn set_autocommit(&self, autocommit: bool) {
        self.autocommit.set(autocommit);
    }

    pub fn close_reason(&self) -> CloseReason {
        self.close_reason.get()
    }

    pub fn set_close_reason(&self, reason: CloseReason) {
        self.close_reason.set(reason);
    }

    /// Protocol-private state attached to the session.
    pub fn set_protocol_data(&self, data: Box<dyn std::any::Any>) {
        *self.protocol_data.borrow_mut() = Some(data);
    }

    pub fn with_protocol_data<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.protocol_data
            .borrow_mut()
            .as_mut()
            .and_then(|d| d.downcast_mut::<T>())
            .map(f)
    }

    /// Start the session by connecting the router. On success the session
    /// moves to `Started` and the service counters are bumped.
    pub fn start(self: &Rc<Self>, worker: &mut Worker) -> bool {
        let Some(mut router) = self.router.borrow_mut().take() else {
            error!("session {} started without a router", self.id);
            return false;
        };
        let result = router.connect(worker, self);
        *self.router.borrow_mut() = Some(router);

        match result {
            Ok(()) => {
                self.state.set(SessionState::Started);
                self.started.set(true);
                self.service
                    .stats()
                    .n_connections
                    .fetch_add(1, Ordering::Relaxed);
                self.service
                    .stats()
                    .n_current
                    .fetch_add(1, Ordering::Relaxed);
                info!(
                    "Started {} client session [{}] from {}",
                    self.service.name(),
                    self.id,
                    self.remote
                );
                true
            }
            Err(e) => {
                error!("session {} failed to start: {}", self.id, e);
                self.state.set(SessionState::Failed);
                false
            }
        }
    }

    // ---- downstream -----------------------------------------------------

    /// Route one parsed query buffer down the filter chain into the router.
    /// Returns false when routing failed and the caller should hang up the
    /// client.
    pub fn route_query(self: &Rc<Self>, worker: &mut Worker, data: BufferChain) -> bool {
        let mut filters = std::mem::take(&mut *self.filters.borrow_mut());

        let mut flow = Flow::Forward(data);
        let mut failed = false;

        for (index, filter) in filters.iter_mut().enumerate() {
            match flow {
                Flow::Forward(buffer) => {
                    match filter.route_query(worker, self, index, buffer) {
                        Ok(next) => flow = next,
                        Err(e) => {
                            error!("session {} filter error: {}", self.id, e);
                            failed = true;
                            flow = Flow::Consume;
                            break;
                        }
                    }
                }
                Flow::Consume => break,
            }
        }

        *self.filters.borrow_mut() = filters;

        if let Flow::Forward(buffer) = flow {
            if let Some(mut router) = self.router.borrow_mut().take() {
                let result = router.route_query(worker, self, buffer);
                *self.router.borrow_mut() = Some(router);
                if let Err(e) = result {
                    error!("session {} router error: {}", self.id, e);
                    failed = true;
                }
            } else {
                failed = true;
            }
        }

        // a filter may have short-circuited the query with a stored response
        if self.response.borrow().is_some() {
            self.deliver_response(worker);
        }

        if failed {
            self.close_reason.set(CloseReason::RoutingFailed);
        }

        !failed
    }

    /// Store the response a filter short-circuits a query with. At most one
    /// response may be set per query; a second call is rejected.
    pub fn set_response(&self, from_filter: usize, buffer: BufferChain) -> bool {
        let mut slot = self.response.borrow_mut();
        if slot.is_some() {
            error!(
                "session {}: a response has already been set for this query",
                self.id
            );
            return false;
        }
        *slot = Some(PendingResponse {
            from_filter,
            buffer,
        });
        true
    }

    fn deliver_response(self: &Rc<Self>, worker: &mut Worker) {
        let Some(pending) = self.response.borrow_mut().take() else {
            return;
        };

        let route = ReplyRoute::default();
        let reply = Reply::default().complete();

        let mut flow = Flow::Forward(pending.buffer);
        let mut filters = std::mem::take(&mut *self.filters.borrow_mut());
        for (index, filter) in filters.iter_mut().enumerate().rev() {
            if index >= pending.from_filter {
                continue;
            }
            match flow {
                Flow::Forward(buffer) => {
                    match filter.client_reply(worker, self, buffer, &route, &reply) {
                        Ok(next) => flow = next,
                        Err(e) => {
                            error!("session {} filter reply error: {}", self.id, e);
                            flow = Flow::Consume;
                            break;
                        }
                    }
                }
                Flow::Consume => break,
            }
        }
        *self.filters.borrow_mut() = filters;

        if let Flow::Forward(buffer) = flow {
            self.client_write(worker, buffer);
        }

        // the short-circuited query will never see a server response, so the
        // book-keeping has to be squared away here
        self.book_last_as_complete();
    }

    // ---- upstream -------------------------------------------------------

    /// Deliver a backend reply up the chain: router first, then the filters
    /// in reverse order, finally the client connection's write.
    pub fn client_reply(
        self: &Rc<Self>,
        worker: &mut Worker,
        data: BufferChain,
        reply: &Reply,
    ) -> bool {
        let mut route = ReplyRoute::default();
        if let Some(target) = reply.target() {
            route.push(target);
        }

        let mut flow = {
            let Some(mut router) = self.router.borrow_mut().take() else {
                return false;
            };
            let result = router.client_reply(worker, self, data, &mut route, reply);
            *self.router.borrow_mut() = Some(router);
            match result {
                Ok(flow) => flow,
                Err(e) => {
                    error!("session {} reply error: {}", self.id, e);
                    self.terminate(worker, None);
                    return false;
                }
            }
        };

        let mut filters = std::mem::take(&mut *self.filters.borrow_mut());
        for filter in filters.iter_mut().rev() {
            match flow {
                Flow::Forward(buffer) => {
                    match filter.client_reply(worker, self, buffer, &route, reply) {
                        Ok(next) => flow = next,
                        Err(e) => {
                            error!("session {} filter reply error: {}", self.id, e);
                            flow = Flow::Consume;
                            break;
                        }
                    }
                }
                Flow::Consume => break,
            }
        }
        *self.filters.borrow_mut() = filters;

        if let Flow::Forward(buffer) = flow {
            self.client_write(worker, buffer)
        } else {
            true
        }
    }

    /// Hand a buffer to the client connection's write. If the client
    /// protocol is busy in a handler the write is queued and flushed when
    /// the handler returns.
    pub fn client_write(self: &Rc<Self>, worker: &mut Worker, data: BufferChain) -> bool {
        let Some(token) = self.client_token.get() else {
            return false;
        };
        if worker.client_protocol_available(token) {
            worker.protocol_write(token, data)
        } else {
            self.pending_client_writes.borrow_mut().push_back(data);
            true
        }
    }

    pub(crate) fn flush_pending_client_writes(self: &Rc<Self>, worker: &mut Worker) {
        let Some(token) = self.client_token.get() else {
            return;
        };
        loop {
            let Some(data) = self.pending_client_writes.borrow_mut().pop_front() else {
                break;
            };
            if !worker.protocol_write(token, data) {
                break;
            }
        }
    }

    pub(crate) fn has_pending_client_writes(&self) -> bool {
        !self.pending_client_writes.borrow().is_empty()
    }

    /// Terminal error handler: forward the error to the client and stop the
    /// session. Used when no router is in a position to recover.
    pub fn handle_error(self: &Rc<Self>, worker: &mut Worker, error: BufferChain) {
        self.client_write(worker, error);
        self.terminate(worker, None);
    }

    /// A backend endpoint failed. The router decides whether the session
    /// survives; when it does not, the error is forwarded to the client and
    /// the session terminated.
    pub fn handle_backend_error(
        self: &Rc<Self>,
        worker: &mut Worker,
        problem: Token,
        error: Option<BufferChain>,
        reply: &Reply,
    ) {
        if session_get_dump_statements() == DumpStatements::OnError {
            self.dump_statements();
        }

        let can_continue = {
            let Some(mut router) = self.router.borrow_mut().take() else {
                return;
            };
            let result = router.handle_error(worker, self, problem, error.clone(), reply);
            *self.router.borrow_mut() = Some(router);
            result
        };

        if !can_continue {
            self.close_reason.set(CloseReason::HandleErrorFailed);
            self.terminate(worker, error);
        }
    }

    // ---- lifecycle ------------------------------------------------------

    /// Stop a started session: write the optional error to the client and
    /// close the client DCB. Backend detachments then drive the reference
    /// count to zero.
    pub fn terminate(self: &Rc<Self>, worker: &mut Worker, error: Option<BufferChain>) {
        if self.state.get() != SessionState::Started {
            return;
        }
        self.state.set(SessionState::Stopping);

        if let Some(error) = error {
            self.client_write(worker, error);
        }

        if let Some(token) = self.client_token.get() {
            worker.close_dcb(token);
        }
    }

    /// Invoked by the core when the client DCB is closed: moves the session
    /// to `Stopping` and gives the router a chance to release endpoints.
    pub(crate) fn close(self: &Rc<Self>, worker: &mut Worker) {
        if self.state.get() == SessionState::Started {
            self.state.set(SessionState::Stopping);
        }
        if let Some(mut router) = self.router.borrow_mut().take() {
            router.close(worker, self);
            *self.router.borrow_mut() = Some(router);
        }
    }

    pub(crate) fn link_backend(&self, token: Token) {
        self.backends.borrow_mut().push(token);
    }

    pub(crate) fn unlink_backend(&self, token: Token) {
        self.backends.borrow_mut().retain(|t| *t != token);
    }

    pub fn has_backend(&self, token: Token) -> bool {
        self.backends.borrow().contains(&token)
    }

    pub fn backend_tokens(&self) -> Vec<Token> {
        self.backends.borrow().clone()
    }

    // ---- session variables ----------------------------------------------

    /// Register a session variable. The name must carry the `@gantry.`
    /// prefix; lookups are case-insensitive.
    pub fn add_variable(&self, name: &str, handler: VariableHandler) -> bool {
        if !name.to_lowercase().starts_with(VARIABLE_PREFIX) {
            error!("session variable '{}' is not of the correct format", name);
            return false;
        }

        let key = name.to_lowercase();
        let mut variables = self.variables.borrow_mut();
        if variables.contains_key(&key) {
            error!("session variable '{}' has been added already", name);
            return false;
        }
        variables.insert(key, handler);
        true
    }

    /// Invoke the handler of a variable with the raw value. Returns an
    /// error message when the variable is unknown or the handler rejects
    /// the value, `None` on success.
    pub fn set_variable_value(&self, name: &str, value: &str) -> Option<String> {
        let key = name.to_lowercase();
        let variables = self.variables.borrow();
        match variables.get(&key) {
            Some(handler) => handler(&key, value).err(),
            None => {
                let message = format!("attempt to set unknown session variable {}", name);
                warn!("{}", message);
                Some(message)
            }
        }
    }

    pub fn remove_variable(&self, name: &str) -> bool {
        self.variables
            .borrow_mut()
            .remove(&name.to_lowercase())
            .is_some()
    }

    // ---- query book-keeping ---------------------------------------------

    /// Clone and retain a client statement in the fixed-depth query ring.
    pub fn retain_statement(&self, data: &BufferChain) {
        if self.retain_last_statements == 0 {
            return;
        }

        let mut queries = self.queries.borrow_mut();
        debug_assert!(queries.len() <= self.retain_last_statements);

        queries.push_front(QueryInfo::new(data.clone()));
        if queries.len() > self.retain_last_statements {
            queries.pop_back();
        }

        if queries.len() == 1 && self.current_query.get() == -1 {
            self.current_query.set(0);
        } else {
            // streaming clients may push queries faster than responses
            // arrive; the index is allowed to run past the ring end and is
            // clamped when booking
            self.current_query.set(self.current_query.get() + 1);
        }
    }

    /// Record that a server processed the current query.
    pub fn book_server_response(&self, server: &str, final_response: bool) {
        if self.retain_last_statements == 0 || self.queries.borrow().is_empty() {
            return;
        }

        let index = self.current_query.get();
        debug_assert!(index >= 0);

        let mut queries = self.queries.borrow_mut();
        if index >= 0 && (index as usize) < queries.len() {
            queries[index as usize].book_server_response(server, final_response);
        }

        if final_response {
            // brings an index that ran past the ring back inside it
            self.current_query.set(index - 1);
            debug_assert!(self.current_query.get() >= -1);
        }
    }

    /// Mark the current query complete without a server response, e.g.
    /// after a filter short-circuited it.
    pub fn book_last_as_complete(&self) {
        if self.retain_last_statements == 0 || self.queries.borrow().is_empty() {
            return;
        }

        let index = self.current_query.get();
        let mut queries = self.queries.borrow_mut();
        if index >= 0 && (index as usize) < queries.len() {
            queries[index as usize].book_as_complete();
        }
    }

    /// Forget the per-server responses booked for the current query.
    pub fn reset_server_bookkeeping(&self) {
        if self.retain_last_statements == 0 || self.queries.borrow().is_empty() {
            return;
        }

        let index = self.current_query.get();
        let mut queries = self.queries.borrow_mut();
        if index >= 0 && (index as usize) < queries.len() {
            queries[index as usize].reset_server_bookkeeping();
        }
    }

    pub fn query_ring_len(&self) -> usize {
        self.queries.borrow().len()
    }

    /// Emit the retained statements through the logger, newest last.
    pub fn dump_statements(&self) {
        if self.retain_last_statements == 0 {
            return;
        }
        let queries = self.queries.borrow();
        let mut n = queries.len();
        for info in queries.iter().rev() {
            info!("session {}: stmt {}: {}", self.id, n, info.statement_text());
            n -= 1;
        }
    }

    pub fn queries_as_json(&self) -> serde_json::Value {
        let queries = self.queries.borrow();
        serde_json::Value::Array(queries.iter().rev().map(|q| q.as_json()).collect())
    }

    // ---- session trace --------------------------------------------------

    /// Append a line to the bounded per-session trace ring.
    pub fn append_session_log(&self, line: String) {
        let depth = session_get_session_trace();
        if depth == 0 {
            return;
        }
        let mut log = self.log.borrow_mut();
        log.push_front(line);
        while log.len() > depth as usize {
            log.pop_back();
        }
    }

    /// Emit the trace ring through the logger, oldest last.
    pub fn dump_session_log(&self) {
        let log = self.log.borrow();
        if !log.is_empty() {
            let joined: Vec<&str> = log.iter().map(|s| s.as_str()).collect();
            info!("session log for session ({}):\n{}", self.id, joined.join("\n"));
        }
    }

    pub fn log_as_json(&self) -> serde_json::Value {
        let log = self.log.borrow();
        serde_json::Value::Array(
            log.iter()
                .map(|line| serde_json::Value::String(line.clone()))
                .collect(),
        )
    }

    // ---- admin ----------------------------------------------------------

    /// JSON representation for the admin interface. The `rdns` flag is
    /// accepted for interface parity; addresses resolve numerically.
    pub fn to_json(&self, worker: &Worker, _rdns: bool) -> serde_json::Value {
        let mut connections = Vec::new();
        let mut idle = serde_json::Value::Null;

        if let Some(token) = self.client_token.get() {
            if let Some(dcb) = worker.dcb(token) {
                let idle_secs =
                    (worker.tick_ms().saturating_sub(dcb.last_read())) as f64 / 1000.0;
                idle = serde_json::json!(idle_secs);
                connections.push(dcb.to_json());
            }
        }
        for token in self.backends.borrow().iter() {
            if let Some(dcb) = worker.dcb(*token) {
                connections.push(dcb.to_json());
            }
        }

        serde_json::json!({
            "id": self.id.to_string(),
            "state": self.state.get().as_str(),
            "user": self.user.borrow().clone(),
            "remote": self.remote,
            "connected": self.connected.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            "idle": idle,
            "connections": connections,
            "queries": self.queries_as_json(),
            "log": self.log_as_json(),
            "close_reason": self.close_reason.get().as_str(),
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if session_get_dump_statements() == DumpStatements::OnClose {
            self.dump_statements();
        }
        if self.started.get() {
            self.service
                .stats()
                .n_current
                .fetch_sub(1, Ordering::Relaxed);
        }
        self.state.set(SessionState::Free);
        info!(
            "Stopped {} client session [{}]",
            self.service.name(),
            self.id
        );
    }
}

/// Re-route a buffer after a delay on the session's owner worker. The task
/// holds a session reference for its whole lifetime; when routing fails a
/// hangup is delivered to the client.
pub fn session_delay_routing(
    worker: &mut Worker,
    session: Rc<Session>,
    data: BufferChain,
    delay_ms: u64,
) {
    debug_assert_eq!(worker.id(), session.owner());

    worker.delayed_call(delay_ms, move |worker| {
        if session.state() == SessionState::Started && !session.route_query(worker, data) {
            if let Some(token) = session.client_token() {
                worker.trigger_hangup_event(token);
            }
        }
    });
}
