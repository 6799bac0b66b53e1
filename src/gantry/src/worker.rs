// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The per-thread event loop. A worker owns a mio poll instance, a slab of
//! pollables (DCBs and listener accept sockets), a cross-thread task queue,
//! and a deadline-ordered delayed-call heap. DCBs and sessions are pinned
//! to the worker that created them; other threads communicate with a worker
//! exclusively by posting tasks.

use crate::dcb::{Dcb, DrainMode, ProtocolHandle, Role, State, TriggeredEvent};
use crate::error::CoreError;
use crate::listener::Listener;
use crate::router::Target;
use crate::session::{CloseReason, Session, SessionState};
use crate::WAKER_TOKEN;

use buffer::BufferChain;
use common::signal::Signal;
use crossbeam_queue::ArrayQueue;
use net::event::Source;
use net::{Events, Interest, ListenSocket, Poll, Stream, TcpStream, Token, Waker};
use queues::Mailbox;
use slab::Slab;

use std::cell::Cell;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Process-wide DCB id generator.
static NEXT_DCB_UID: AtomicU64 = AtomicU64::new(1);

// Upper bound on posted tasks executed per loop turn; tasks queued by the
// running tasks wait for the next turn.
const TASK_BATCH: usize = 1024;

const DEFAULT_NEVENT: usize = 1024;
const DEFAULT_TIMEOUT_MS: u64 = 100;

// Interval of the idle-timeout sweep.
const TIMEOUT_SWEEP_MS: u64 = 1000;

thread_local! {
    static CURRENT: Cell<Option<usize>> = Cell::new(None);
}

pub(crate) fn next_dcb_uid() -> u64 {
    NEXT_DCB_UID.fetch_add(1, Ordering::Relaxed)
}

/// A task posted to a worker from any thread.
pub type Task = Box<dyn FnOnce(&mut Worker) + Send + 'static>;

/// A task scheduled on the owning worker itself; may capture worker-local
/// non-Send state such as session references.
pub type LocalTask = Box<dyn FnOnce(&mut Worker) + 'static>;

/// How `execute` delivers a task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Run inline when the caller is already the target worker, otherwise
    /// post.
    Auto,
    /// Always post; the task runs on a later loop turn.
    Queued,
}

/// Cross-thread handle to one worker.
pub struct WorkerHandle {
    id: usize,
    waker: Arc<Waker>,
    tasks: Arc<ArrayQueue<Task>>,
    load: Arc<AtomicUsize>,
}

impl Clone for WorkerHandle {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            waker: self.waker.clone(),
            tasks: self.tasks.clone(),
            load: self.load.clone(),
        }
    }
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of DCBs currently owned by the worker.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// Post a task and wake the worker.
    pub fn post(&self, task: Task) -> Result<(), CoreError> {
        if self.tasks.push(task).is_err() {
            return Err(CoreError::ResourceExhaustion(format!(
                "task queue of worker {} is full",
                self.id
            )));
        }
        self.waker
            .wake()
            .map_err(|e| CoreError::Internal(e.to_string()))
    }
}

/// The set of all workers in the process.
pub struct Workers {
    handles: Vec<WorkerHandle>,
}

impl Workers {
    pub fn new(handles: Vec<WorkerHandle>) -> Arc<Self> {
        Arc::new(Self { handles })
    }

    pub fn count(&self) -> usize {
        self.handles.len()
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    pub fn get(&self, id: usize) -> Option<&WorkerHandle> {
        self.handles.get(id)
    }

    /// Post a task to the worker with the given id.
    pub fn post(&self, id: usize, task: Task) -> Result<(), CoreError> {
        self.handles
            .get(id)
            .ok_or_else(|| CoreError::Internal(format!("no worker with id {}", id)))?
            .post(task)
    }

    /// Post one task (built per worker) to every worker, including the
    /// caller's own if it is one.
    pub fn broadcast(&self, make: impl Fn(usize) -> Task) -> Result<(), CoreError> {
        let mut result = Ok(());
        for handle in &self.handles {
            if let Err(e) = handle.post(make(handle.id)) {
                result = Err(e);
            }
        }
        result
    }

    /// The worker with the fewest connections.
    pub fn least_loaded(&self) -> usize {
        self.handles
            .iter()
            .min_by_key(|h| h.load())
            .map(|h| h.id())
            .unwrap_or(0)
    }

    /// The worker bound to the calling thread, if any.
    pub fn current() -> Option<usize> {
        CURRENT.with(|c| c.get())
    }
}

struct TimerEntry {
    deadline_ms: u64,
    seq: u64,
    task: LocalTask,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // reversed so the BinaryHeap pops the earliest deadline first, ties
    // broken by posting order
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.deadline_ms, other.seq).cmp(&(self.deadline_ms, self.seq))
    }
}

pub(crate) struct AcceptEndpoint {
    pub(crate) listener: Arc<Listener>,
    pub(crate) socket: ListenSocket,
    pub(crate) enabled: bool,
}

enum Pollable {
    Dcb(Dcb),
    Accept(AcceptEndpoint),
}

/// Builds the Send half of a worker so the worker itself can be constructed
/// inside its own thread and hold non-Send state.
pub struct WorkerBuilder {
    id: usize,
    poll: Poll,
    waker: Arc<Waker>,
    tasks: Arc<ArrayQueue<Task>>,
    load: Arc<AtomicUsize>,
    nevent: usize,
    timeout: Duration,
    high_water: usize,
    low_water: usize,
    idle_timeout_ms: u64,
}

impl WorkerBuilder {
    pub fn new(id: usize) -> Result<Self, CoreError> {
        let poll = Poll::new().map_err(|e| CoreError::Internal(e.to_string()))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN)
                .map_err(|e| CoreError::Internal(e.to_string()))?,
        );

        Ok(Self {
            id,
            poll,
            waker,
            tasks: Arc::new(ArrayQueue::new(64 * 1024)),
            load: Arc::new(AtomicUsize::new(0)),
            nevent: DEFAULT_NEVENT,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            high_water: 0,
            low_water: 0,
            idle_timeout_ms: 0,
        })
    }

    pub fn nevent(mut self, nevent: usize) -> Self {
        self.nevent = nevent;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Write queue watermarks applied to every DCB this worker creates.
    pub fn watermarks(mut self, high: usize, low: usize) -> Self {
        self.high_water = high;
        self.low_water = low;
        self
    }

    /// Idle limit for client connections in milliseconds; zero disables the
    /// periodic sweep.
    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            id: self.id,
            waker: self.waker.clone(),
            tasks: self.tasks.clone(),
            load: self.load.clone(),
        }
    }

    pub fn build(
        self,
        workers: Arc<Workers>,
        signal_queue: Option<Mailbox<Signal>>,
    ) -> Worker {
        Worker {
            id: self.id,
            poll: self.poll,
            waker: self.waker,
            tasks: self.tasks,
            load: self.load,
            workers,
            signal_queue,
            nevent: self.nevent,
            timeout: self.timeout,
            high_water: self.high_water,
            low_water: self.low_water,
            idle_timeout_ms: self.idle_timeout_ms,
            pollables: Slab::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            triggers: Vec::new(),
            zombies: Vec::new(),
            start: Instant::now(),
            shutdown: false,
        }
    }
}

/// One event loop thread.
pub struct Worker {
    id: usize,
    poll: Poll,
    waker: Arc<Waker>,
    tasks: Arc<ArrayQueue<Task>>,
    load: Arc<AtomicUsize>,
    workers: Arc<Workers>,
    signal_queue: Option<Mailbox<Signal>>,
    nevent: usize,
    timeout: Duration,
    high_water: usize,
    low_water: usize,
    idle_timeout_ms: u64,
    pollables: Slab<Pollable>,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    triggers: Vec<Token>,
    zombies: Vec<Token>,
    start: Instant,
    shutdown: bool,
}

impl Worker {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn workers(&self) -> &Arc<Workers> {
        &self.workers
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Milliseconds since the worker started; the clock every DCB timestamp
    /// on this worker is measured against.
    pub fn tick_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn dcb_count(&self) -> usize {
        self.pollables
            .iter()
            .filter(|(_, p)| matches!(p, Pollable::Dcb(_)))
            .count()
    }

    pub fn dcb(&self, token: Token) -> Option<&Dcb> {
        match self.pollables.get(token.0) {
            Some(Pollable::Dcb(dcb)) => Some(dcb),
            _ => None,
        }
    }

    pub fn dcb_mut(&mut self, token: Token) -> Option<&mut Dcb> {
        match self.pollables.get_mut(token.0) {
            Some(Pollable::Dcb(dcb)) => Some(dcb),
            _ => None,
        }
    }

    /// Count DCBs in the given role.
    pub fn dcb_count_by_role(&self, role: Role) -> usize {
        self.pollables
            .iter()
            .filter(|(_, p)| matches!(p, Pollable::Dcb(d) if d.role() == role))
            .count()
    }

    /// Call `func` for every DCB on this worker; stop when it returns false.
    pub fn dcb_foreach(&self, mut func: impl FnMut(&Dcb) -> bool) {
        for (_, pollable) in self.pollables.iter() {
            if let Pollable::Dcb(dcb) = pollable {
                if !func(dcb) {
                    break;
                }
            }
        }
    }

    /// JSON array of every session owned by this worker, through the client
    /// DCBs pinned here.
    pub fn sessions_to_json(&self) -> serde_json::Value {
        let mut sessions = Vec::new();
        self.dcb_foreach(|dcb| {
            if dcb.role() == Role::Client {
                if let Some(session) = dcb.session() {
                    sessions.push(session.to_json(self, false));
                }
            }
            true
        });
        serde_json::Value::Array(sessions)
    }

    // ---- task scheduling ------------------------------------------------

    /// Run or post a task on the target worker. `RunMode::Auto` runs inline
    /// when the target is this worker; `RunMode::Queued` always posts.
    pub fn execute(
        &mut self,
        target: usize,
        mode: RunMode,
        task: Task,
    ) -> Result<(), CoreError> {
        if target == self.id && mode == RunMode::Auto {
            task(self);
            Ok(())
        } else {
            self.workers.post(target, task)
        }
    }

    /// Post a task to every worker, including this one.
    pub fn broadcast(&mut self, make: impl Fn(usize) -> Task) -> Result<(), CoreError> {
        self.workers.broadcast(make)
    }

    /// Schedule `task` to run on this worker after at least `delay_ms`
    /// milliseconds. Delayed tasks run in deadline order, ties broken by
    /// scheduling order.
    pub fn delayed_call(&mut self, delay_ms: u64, task: impl FnOnce(&mut Worker) + 'static) {
        let entry = TimerEntry {
            deadline_ms: self.tick_ms() + delay_ms,
            seq: self.timer_seq,
            task: Box::new(task),
        };
        self.timer_seq += 1;
        self.timers.push(entry);
    }

    // ---- DCB management -------------------------------------------------

    /// Build and register a client DCB for an accepted stream. The protocol
    /// has not been initialized yet; the caller drives `init_connection`.
    pub(crate) fn add_client_dcb(
        &mut self,
        stream: Stream,
        remote: String,
        session: Rc<Session>,
        protocol: Box<dyn crate::protocol::ClientProtocol>,
    ) -> Result<Token, CoreError> {
        let now = self.tick_ms();
        let dcb = Dcb::new(
            next_dcb_uid(),
            self.id,
            Role::Client,
            stream,
            remote,
            Some(session.clone()),
            ProtocolHandle::Client(protocol),
            self.high_water,
            self.low_water,
            now,
        );

        let token = self.insert_dcb(dcb)?;
        session.set_client_token(token);
        Ok(token)
    }

    /// Open a non-blocking backend connection for a session and register
    /// the backend DCB. The session gains a reference which is dropped when
    /// the backend detaches.
    pub fn connect_backend(
        &mut self,
        target: Arc<Target>,
        session: &Rc<Session>,
    ) -> Result<Token, CoreError> {
        debug_assert_eq!(session.owner(), self.id);

        let module = session.listener().protocol_module().clone();
        let protocol = module.create_backend_protocol(session).ok_or_else(|| {
            CoreError::Protocol(format!(
                "protocol '{}' does not support backend connections",
                module.name()
            ))
        })?;

        let stream = TcpStream::connect(target.address()).map_err(CoreError::from)?;
        let now = self.tick_ms();
        let mut dcb = Dcb::new(
            next_dcb_uid(),
            self.id,
            Role::Backend,
            Stream::from(stream),
            target.address().to_string(),
            Some(session.clone()),
            ProtocolHandle::Backend(protocol),
            self.high_water,
            self.low_water,
            now,
        );
        dcb.set_server(target);

        let token = self.insert_dcb(dcb)?;
        session.link_backend(token);

        let ok = self
            .with_protocol(token, |proto, worker, token| match proto {
                ProtocolHandle::Backend(p) => p.init_connection(worker, token),
                ProtocolHandle::Client(_) => false,
            })
            .unwrap_or(false);

        if !ok {
            self.close_dcb(token);
            return Err(CoreError::Protocol(
                "backend connection initialization failed".to_string(),
            ));
        }

        Ok(token)
    }

    fn insert_dcb(&mut self, dcb: Dcb) -> Result<Token, CoreError> {
        let key = self.pollables.insert(Pollable::Dcb(dcb));
        let token = Token(key);

        let registered = match self.pollables.get_mut(key) {
            Some(Pollable::Dcb(dcb)) => dcb.enable_events(self.poll.registry(), token),
            _ => false,
        };
        if !registered {
            self.pollables.remove(key);
            return Err(CoreError::ResourceExhaustion(
                "failed to add connection to the event loop".to_string(),
            ));
        }

        self.load.fetch_add(1, Ordering::Relaxed);
        Ok(token)
    }

    /// Idempotent close. Callable from the owner worker; other threads must
    /// post a task targeting the owner. Once this returns no further user
    /// callbacks fire for the DCB and `writeq_drain` is a no-op.
    pub fn close_dcb(&mut self, token: Token) {
        let Some(dcb) = self.dcb_mut(token) else {
            return;
        };
        if !dcb.mark_closed() {
            return;
        }

        // teardown is deferred while a protocol handler for this DCB is on
        // the stack; the dispatch path finalizes after the handler returns
        if dcb.protocol.is_some() {
            self.finalize_close(token);
        }
    }

    fn finalize_close(&mut self, token: Token) {
        {
            let Some(dcb) = self.dcb_mut(token) else {
                return;
            };
            if dcb.is_finalized() {
                return;
            }
            dcb.set_finalized();
        }

        {
            let Worker { poll, pollables, .. } = self;
            if let Some(Pollable::Dcb(dcb)) = pollables.get_mut(token.0) {
                dcb.disable_events(poll.registry());
            }
        }

        if let Some(proto) = self.dcb_mut(token).and_then(|d| d.protocol.take()) {
            let mut proto = proto;
            match &mut proto {
                ProtocolHandle::Client(p) => p.finish_connection(self, token),
                ProtocolHandle::Backend(p) => p.finish_connection(self, token),
            }
        }

        if let Some(dcb) = self.dcb_mut(token) {
            dcb.remove_callbacks();
            dcb.shutdown_socket();
            dcb.clear();
        }

        let role = self.dcb(token).map(|d| d.role());
        let session = self.dcb_mut(token).and_then(|d| d.take_session());
        if let Some(session) = session {
            match role {
                Some(Role::Client) => session.close(self),
                Some(Role::Backend) => session.unlink_backend(token),
                _ => {}
            }
            // the session reference drops here; the last one frees it
        }

        self.zombies.push(token);
    }

    /// Append to a DCB's write queue, optionally draining to the socket.
    pub fn writeq_append(&mut self, token: Token, data: BufferChain, drain: DrainMode) -> bool {
        let now = self.tick_ms();
        let result = {
            let Worker { poll, pollables, .. } = self;
            match pollables.get_mut(token.0) {
                Some(Pollable::Dcb(dcb)) => {
                    dcb.writeq_append(data, drain, poll.registry(), token, now)
                }
                _ => false,
            }
        };
        self.collect_trigger(token);
        result
    }

    /// Drain a DCB's write queue to the socket, returning bytes written.
    pub fn writeq_drain(&mut self, token: Token) -> usize {
        let now = self.tick_ms();
        let flushed = {
            let Worker { poll, pollables, .. } = self;
            match pollables.get_mut(token.0) {
                Some(Pollable::Dcb(dcb)) => dcb.writeq_drain(poll.registry(), token, now),
                _ => 0,
            }
        };
        self.collect_trigger(token);
        flushed
    }

    // I/O inside a queue operation may have flagged a synthetic event; make
    // sure the loop sees it even when the call came from outside dispatch.
    fn collect_trigger(&mut self, token: Token) {
        if self.dcb(token).map(|d| d.has_triggered()).unwrap_or(false) {
            self.triggers.push(token);
        }
    }

    /// Feed a buffer through the DCB's protocol `write` so that it is
    /// framed for the wire. This is the path routers use when they already
    /// speak the wire protocol. A protocol handler must not use this on its
    /// own DCB; it owns the framing and appends to the write queue itself.
    pub fn protocol_write(&mut self, token: Token, data: BufferChain) -> bool {
        self.with_protocol(token, |proto, worker, token| match proto {
            ProtocolHandle::Client(p) => p.write(worker, token, data),
            ProtocolHandle::Backend(p) => p.write(worker, token, data),
        })
        .unwrap_or(false)
    }

    /// Run the client protocol's `init_connection`, called exactly once
    /// after the DCB is registered and before any `read_ready`.
    pub(crate) fn init_client_protocol(&mut self, token: Token) -> bool {
        self.with_protocol(token, |proto, worker, token| match proto {
            ProtocolHandle::Client(p) => p.init_connection(worker, token),
            ProtocolHandle::Backend(_) => false,
        })
        .unwrap_or(false)
    }

    /// Have the client protocol compose a "too many connections" message.
    pub(crate) fn client_connlimit(&mut self, token: Token, limit: usize) {
        self.with_protocol(token, |proto, worker, token| {
            if let ProtocolHandle::Client(p) = proto {
                p.connlimit(worker, token, limit);
            }
        });
    }

    /// True when the client protocol of the DCB can be invoked right now.
    pub(crate) fn client_protocol_available(&self, token: Token) -> bool {
        self.dcb(token)
            .map(|d| !d.is_closed() && matches!(d.protocol, Some(ProtocolHandle::Client(_))))
            .unwrap_or(false)
    }

    /// Arrange a synthetic readable event for the DCB, delivered before the
    /// next poll wait. The last trigger within one handler wins.
    pub fn trigger_read_event(&mut self, token: Token) {
        if let Some(dcb) = self.dcb_mut(token) {
            dcb.trigger_read_event();
            self.triggers.push(token);
        }
    }

    pub fn trigger_write_event(&mut self, token: Token) {
        if let Some(dcb) = self.dcb_mut(token) {
            dcb.trigger_write_event();
            self.triggers.push(token);
        }
    }

    pub fn trigger_hangup_event(&mut self, token: Token) {
        if let Some(dcb) = self.dcb_mut(token) {
            dcb.trigger_hangup_event();
            self.triggers.push(token);
        }
    }

    // ---- listener plumbing ----------------------------------------------

    /// Register a listener accept socket on this worker's poll.
    pub(crate) fn register_accept(
        &mut self,
        listener: Arc<Listener>,
        mut socket: ListenSocket,
    ) -> Result<Token, CoreError> {
        let entry = self.pollables.vacant_entry();
        let token = Token(entry.key());
        socket
            .register(self.poll.registry(), token, Interest::READABLE)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        entry.insert(Pollable::Accept(AcceptEndpoint {
            listener,
            socket,
            enabled: true,
        }));
        Ok(token)
    }

    /// Stop or resume accepting for a listener without closing its socket.
    pub(crate) fn set_accept_enabled(&mut self, name: &str, enabled: bool) {
        let Worker { poll, pollables, .. } = self;
        for (key, pollable) in pollables.iter_mut() {
            if let Pollable::Accept(endpoint) = pollable {
                if endpoint.listener.name() != name || endpoint.enabled == enabled {
                    continue;
                }
                let result = if enabled {
                    endpoint
                        .socket
                        .register(poll.registry(), Token(key), Interest::READABLE)
                        .or_else(|_| {
                            endpoint.socket.reregister(
                                poll.registry(),
                                Token(key),
                                Interest::READABLE,
                            )
                        })
                } else {
                    endpoint.socket.deregister(poll.registry())
                };
                if let Err(e) = result {
                    warn!("listener '{}' readiness change failed: {}", name, e);
                }
                endpoint.enabled = enabled;
            }
        }
    }

    /// Remove and close a listener's accept sockets on this worker.
    pub(crate) fn remove_accepts(&mut self, name: &str) {
        let keys: Vec<usize> = self
            .pollables
            .iter()
            .filter_map(|(key, pollable)| match pollable {
                Pollable::Accept(endpoint) if endpoint.listener.name() == name => Some(key),
                _ => None,
            })
            .collect();
        for key in keys {
            if let Pollable::Accept(mut endpoint) = self.pollables.remove(key) {
                let _ = endpoint.socket.deregister(self.poll.registry());
            }
        }
    }

    /// Accept one pending connection on an accept socket, when enabled.
    pub(crate) fn accept_one(
        &mut self,
        token: Token,
    ) -> Option<std::io::Result<(Stream, String)>> {
        match self.pollables.get(token.0) {
            Some(Pollable::Accept(endpoint)) if endpoint.enabled => {
                Some(endpoint.socket.accept())
            }
            _ => None,
        }
    }

    // ---- timeouts -------------------------------------------------------

    /// Close client DCBs whose last read is older than the idle limit. The
    /// session records the timeout as its close reason.
    pub fn process_timeouts(&mut self) {
        if self.idle_timeout_ms == 0 {
            return;
        }
        let now = self.tick_ms();

        let mut stale = Vec::new();
        for (key, pollable) in self.pollables.iter() {
            if let Pollable::Dcb(dcb) = pollable {
                if dcb.role() == Role::Client
                    && dcb.state() == State::Polling
                    && !dcb.is_closed()
                    && now.saturating_sub(dcb.last_read()) > self.idle_timeout_ms
                {
                    stale.push(Token(key));
                }
            }
        }

        for token in stale {
            if let Some(session) = self.dcb(token).and_then(|d| d.session().cloned()) {
                if session.state() == SessionState::Started {
                    session.set_close_reason(CloseReason::Timeout);
                }
            }
            info!("closing idle connection on worker {}", self.id);
            self.close_dcb(token);
        }
    }

    // ---- the loop -------------------------------------------------------

    /// Run the event loop until a shutdown signal arrives.
    pub fn run(&mut self) {
        CURRENT.with(|c| c.set(Some(self.id)));

        if self.idle_timeout_ms > 0 {
            self.schedule_timeout_sweep();
        }

        let mut events = Events::with_capacity(self.nevent);
        while !self.shutdown {
            self.turn(&mut events, None);
        }

        CURRENT.with(|c| c.set(None));
    }

    /// Run a single loop turn: poll, dispatch, tasks, timers, triggered
    /// events, zombie reaping. Exposed so embedders and tests can drive a
    /// worker without a dedicated thread.
    pub fn run_once(&mut self, timeout: Option<Duration>) {
        CURRENT.with(|c| c.set(Some(self.id)));
        let mut events = Events::with_capacity(self.nevent);
        self.turn(&mut events, timeout);
    }

    fn schedule_timeout_sweep(&mut self) {
        self.delayed_call(TIMEOUT_SWEEP_MS, |worker| {
            worker.process_timeouts();
            worker.schedule_timeout_sweep();
        });
    }

    fn turn(&mut self, events: &mut Events, timeout: Option<Duration>) {
        let timeout = self.poll_timeout(timeout);

        if let Err(e) = self.poll.poll(events, Some(timeout)) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                error!("worker {}: error polling: {}", self.id, e);
            }
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }

            let listener = match self.pollables.get(token.0) {
                Some(Pollable::Accept(endpoint)) if endpoint.enabled => {
                    Some(endpoint.listener.clone())
                }
                _ => None,
            };
            if let Some(listener) = listener {
                listener.accept_ready(self, token);
                continue;
            }

            if matches!(self.pollables.get(token.0), Some(Pollable::Dcb(_))) {
                self.dcb_event(
                    token,
                    event.is_readable(),
                    event.is_writable(),
                    event.is_error(),
                );
            }
        }

        self.drain_signals();
        self.drain_tasks();
        self.run_timers();
        self.process_triggers();
        self.reap_zombies();
    }

    fn poll_timeout(&self, requested: Option<Duration>) -> Duration {
        let mut timeout = requested.unwrap_or(self.timeout);
        if !self.tasks.is_empty() || !self.triggers.is_empty() {
            return Duration::from_millis(0);
        }
        if let Some(entry) = self.timers.peek() {
            let now = self.tick_ms();
            let until = Duration::from_millis(entry.deadline_ms.saturating_sub(now));
            if until < timeout {
                timeout = until;
            }
        }
        timeout
    }

    fn drain_signals(&mut self) {
        let Some(mailbox) = &self.signal_queue else {
            return;
        };
        while let Some(signal) = mailbox.try_recv() {
            match signal {
                Signal::Shutdown => {
                    info!("worker {} shutting down", self.id);
                    self.shutdown = true;
                }
            }
        }
    }

    fn drain_tasks(&mut self) {
        let pending = std::cmp::min(self.tasks.len(), TASK_BATCH);
        for _ in 0..pending {
            let Some(task) = self.tasks.pop() else {
                break;
            };
            // a panicking task loses its slot but never unwinds the loop
            if std::panic::catch_unwind(AssertUnwindSafe(|| task(self))).is_err() {
                error!("worker {}: posted task panicked", self.id);
            }
        }
    }

    fn run_timers(&mut self) {
        loop {
            let now = self.tick_ms();
            match self.timers.peek() {
                Some(entry) if entry.deadline_ms <= now => {}
                _ => break,
            }
            let entry = self.timers.pop().expect("peeked timer entry");
            if std::panic::catch_unwind(AssertUnwindSafe(|| (entry.task)(self))).is_err() {
                error!("worker {}: delayed task panicked", self.id);
            }
        }
    }

    fn process_triggers(&mut self) {
        let tokens = std::mem::take(&mut self.triggers);
        for token in tokens {
            let pending = self
                .dcb(token)
                .map(|d| d.has_triggered() && !d.is_closed())
                .unwrap_or(false);
            if pending {
                self.dcb_event(token, false, false, false);
            }
        }
    }

    fn reap_zombies(&mut self) {
        let zombies = std::mem::take(&mut self.zombies);
        for token in zombies {
            if matches!(self.pollables.get(token.0), Some(Pollable::Dcb(_))) {
                self.pollables.remove(token.0);
                self.load.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    // ---- event dispatch -------------------------------------------------

    fn dcb_event(&mut self, token: Token, readable: bool, writable: bool, error: bool) {
        let mut readable = readable;
        let mut writable = writable;
        let mut hangup = error;
        let mut synthetic = false;

        loop {
            let alive = self
                .dcb(token)
                .map(|d| !d.is_closed())
                .unwrap_or(false);
            if !alive {
                return;
            }

            if hangup {
                self.handle_hangup(token);
                return;
            }

            if writable {
                self.handle_writable(token);
            }

            if readable {
                self.handle_readable(token, synthetic);
            }

            // a handler may have queued a synthetic event; re-enter with it
            // before returning to the poll wait, last trigger wins
            match self.dcb_mut(token).and_then(|d| d.take_triggered()) {
                Some(TriggeredEvent::Readable) => {
                    readable = true;
                    writable = false;
                    hangup = false;
                    synthetic = true;
                }
                Some(TriggeredEvent::Writable) => {
                    readable = false;
                    writable = true;
                    hangup = false;
                    synthetic = true;
                }
                Some(TriggeredEvent::Hangup) => {
                    readable = false;
                    writable = false;
                    hangup = true;
                    synthetic = true;
                }
                None => return,
            }
        }
    }

    fn handle_readable(&mut self, token: Token, synthetic: bool) {
        // drive a pending TLS handshake before reading
        if self.dcb(token).map(|d| d.is_handshaking()).unwrap_or(false) {
            if !self.step_handshake(token) {
                return;
            }
        }

        let now = self.tick_ms();
        let read_result = {
            let Some(dcb) = self.dcb_mut(token) else {
                return;
            };
            dcb.read(0, now)
        };

        match read_result {
            Ok(_) => {}
            Err(e) if e.is_transient() => {}
            Err(e) => {
                debug!("read error on worker {}: {}", self.id, e);
                self.handle_hangup(token);
                return;
            }
        }

        // the protocol is called with a non-empty read queue or for a
        // synthesized read event; a hangup from a zero-length read is
        // delivered through the triggered event after the protocol has seen
        // any bytes that arrived with it
        let has_bytes = self.dcb(token).map(|d| d.readq_len() > 0).unwrap_or(false);
        if !has_bytes && !synthetic {
            return;
        }

        let result = self.with_protocol(token, |proto, worker, token| match proto {
            ProtocolHandle::Client(p) => p.read_ready(worker, token),
            ProtocolHandle::Backend(p) => p.read_ready(worker, token),
        });

        if let Some(Err(e)) = result {
            warn!("protocol error on worker {}: {}", self.id, e);
            self.close_dcb(token);
        }
    }

    fn handle_writable(&mut self, token: Token) {
        if self.dcb(token).map(|d| d.is_handshaking()).unwrap_or(false) {
            if !self.step_handshake(token) {
                return;
            }
        }

        // a backend connection that has completed its handshake releases
        // the delay queue into the write queue
        let release_delayq = self
            .dcb(token)
            .map(|d| {
                d.role() == Role::Backend
                    && d.stream_established()
                    && d.protocol_established()
                    && d.delayq_len() > 0
            })
            .unwrap_or(false);
        if release_delayq {
            let delayed = self
                .dcb_mut(token)
                .map(|d| d.delayq_release())
                .unwrap_or_default();
            self.writeq_append(token, delayed, DrainMode::Yes);
        }

        self.writeq_drain(token);
    }

    fn handle_hangup(&mut self, token: Token) {
        if let Some(dcb) = self.dcb_mut(token) {
            dcb.set_hanged_up();
        }

        let result = self.with_protocol(token, |proto, worker, token| match proto {
            ProtocolHandle::Client(p) => p.hangup(worker, token),
            ProtocolHandle::Backend(p) => p.hangup(worker, token),
        });

        match result {
            // no error from the protocol: the core owns the close
            Some(Ok(())) | None => self.close_dcb(token),
            // the protocol reported an error; it keeps control of the
            // DCB's lifecycle (typically it has already arranged a close
            // through session teardown)
            Some(Err(e)) => {
                debug!("hangup handler error on worker {}: {}", self.id, e);
            }
        }
    }

    /// Returns true when the handshake completed and normal traffic may
    /// continue.
    fn step_handshake(&mut self, token: Token) -> bool {
        let result = match self.dcb_mut(token) {
            Some(dcb) => dcb.ssl_handshake(),
            None => return false,
        };

        match result {
            1 => {
                self.update_interest(token);
                true
            }
            0 => {
                self.update_interest(token);
                false
            }
            _ => {
                self.close_dcb(token);
                false
            }
        }
    }

    fn update_interest(&mut self, token: Token) {
        let Worker { poll, pollables, .. } = self;
        if let Some(Pollable::Dcb(dcb)) = pollables.get_mut(token.0) {
            dcb.update_interest(poll.registry(), token);
        }
    }

    /// Take the protocol out of the DCB for the duration of a call so the
    /// handler can borrow the worker freely, then put it back and run the
    /// deferred work that piled up while it was out.
    fn with_protocol<R>(
        &mut self,
        token: Token,
        f: impl FnOnce(&mut ProtocolHandle, &mut Worker, Token) -> R,
    ) -> Option<R> {
        let mut proto = self.dcb_mut(token)?.protocol.take()?;
        let result = f(&mut proto, self, token);

        if let Some(dcb) = self.dcb_mut(token) {
            if dcb.protocol.is_none() {
                dcb.protocol = Some(proto);
            }
        }

        self.after_protocol_call(token);
        Some(result)
    }

    fn after_protocol_call(&mut self, token: Token) {
        // replies queued while the client protocol was busy
        if let Some(session) = self.dcb(token).and_then(|d| d.session().cloned()) {
            if session.has_pending_client_writes() {
                session.flush_pending_client_writes(self);
            }
        }

        // a close requested while the handler was on the stack
        let deferred = self
            .dcb(token)
            .map(|d| d.is_closed() && !d.is_finalized())
            .unwrap_or(false);
        if deferred {
            self.finalize_close(token);
        }
    }
}
