// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The Descriptor Control Block: a non-blocking socket wrapper with read and
//! write queues, watermark flow control, optional TLS and a triggered-event
//! facility. One DCB belongs to exactly one worker; every mutation happens
//! on that worker.

use crate::error::CoreError;
use crate::protocol::{BackendProtocol, ClientProtocol};
use crate::router::Target;
use crate::session::Session;

use buffer::{Buf, BufferChain};
use net::event::Source;
use net::{Interest, Registry, Stream, Token};

use std::io::{ErrorKind, Read, Write};
use std::rc::Rc;
use std::sync::Arc;

// Read chunk staged on the stack; matches the upper bound on a TLS fragment.
const READ_CHUNK: usize = buffer::TARGET_READ_SIZE;

// Bounded residual-read passes performed while shutting a socket down.
const SHUTDOWN_DRAIN_PASSES: usize = 4;

/// The role a DCB serves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Serves a dedicated client.
    Client,
    /// Serves a backend connection.
    Backend,
    /// Internal DCB not connected to the outside.
    Internal,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Backend => "backend",
            Role::Internal => "internal",
        }
    }
}

/// Poll registration state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Created but not added to the poll instance.
    Created,
    /// Added to the poll instance.
    Polling,
    /// Removed from the poll instance.
    NoPolling,
    /// Socket closed.
    Disconnected,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "created",
            State::Polling => "polling",
            State::NoPolling => "no polling",
            State::Disconnected => "disconnected",
        }
    }
}

/// The reason a registered callback fires.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    /// The write queue has fully drained.
    Drained,
    /// The write queue crossed above the high water mark.
    HighWater,
    /// The write queue dropped back below the low water mark.
    LowWater,
}

/// TLS handshake progression for the connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SslState {
    HandshakeUnknown,
    HandshakeRequired,
    HandshakeDone,
    Established,
    HandshakeFailed,
}

impl SslState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslState::HandshakeUnknown => "unknown",
            SslState::HandshakeRequired => "required",
            SslState::HandshakeDone => "done",
            SslState::Established => "established",
            SslState::HandshakeFailed => "failed",
        }
    }
}

/// A synthetic event queued for re-delivery before the next poll wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriggeredEvent {
    Readable,
    Writable,
    Hangup,
}

/// Whether `writeq_append` should try to flush to the socket immediately.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrainMode {
    Yes,
    No,
}

/// Callback invoked on watermark and drain transitions. The `u64` is the
/// opaque user value supplied at registration.
pub type CallbackFn = fn(&mut Dcb, Reason, u64);

#[derive(Copy, Clone)]
struct Callback {
    reason: Reason,
    cb: CallbackFn,
    userdata: u64,
}

/// Descriptor statistics, surfaced through the admin JSON.
#[derive(Default, Copy, Clone, Debug)]
pub struct Stats {
    pub n_reads: u64,
    pub n_writes: u64,
    pub n_buffered: u64,
    pub n_high_water: u64,
    pub n_low_water: u64,
}

pub(crate) enum ProtocolHandle {
    Client(Box<dyn ClientProtocol>),
    Backend(Box<dyn BackendProtocol>),
}

impl ProtocolHandle {
    fn established(&self) -> bool {
        match self {
            ProtocolHandle::Client(_) => true,
            ProtocolHandle::Backend(p) => p.established(),
        }
    }
}

/// A wrapper for one socket within the proxy. For each client session there
/// is one client DCB and zero or more backend DCBs.
pub struct Dcb {
    uid: u64,
    owner: usize,
    role: Role,
    state: State,
    ssl_state: SslState,
    stream: Option<Stream>,
    remote: String,
    server: Option<Arc<Target>>,
    session: Option<Rc<Session>>,
    pub(crate) protocol: Option<ProtocolHandle>,
    readq: BufferChain,
    writeq: BufferChain,
    delayq: BufferChain,
    high_water: usize,
    low_water: usize,
    high_water_reached: bool,
    callbacks: Vec<Callback>,
    triggered: Option<TriggeredEvent>,
    n_close: u32,
    finalized: bool,
    hanged_up: bool,
    last_read: u64,
    last_write: u64,
    stats: Stats,
}

impl Dcb {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        uid: u64,
        owner: usize,
        role: Role,
        stream: Stream,
        remote: String,
        session: Option<Rc<Session>>,
        protocol: ProtocolHandle,
        high_water: usize,
        low_water: usize,
        now_ms: u64,
    ) -> Self {
        let ssl_state = if stream.is_tls() {
            SslState::HandshakeRequired
        } else {
            SslState::HandshakeUnknown
        };

        Self {
            uid,
            owner,
            role,
            state: State::Created,
            ssl_state,
            stream: Some(stream),
            remote,
            server: None,
            session,
            protocol: Some(protocol),
            readq: BufferChain::new(),
            writeq: BufferChain::new(),
            delayq: BufferChain::new(),
            high_water,
            low_water,
            high_water_reached: false,
            callbacks: Vec::new(),
            triggered: None,
            n_close: 0,
            finalized: false,
            hanged_up: false,
            last_read: now_ms,
            last_write: now_ms,
            stats: Stats::default(),
        }
    }

    pub(crate) fn set_server(&mut self, server: Arc<Target>) {
        self.server = Some(server);
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// The worker this DCB is pinned to.
    pub fn owner(&self) -> usize {
        self.owner
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn server(&self) -> Option<&Arc<Target>> {
        self.server.as_ref()
    }

    pub fn session(&self) -> Option<&Rc<Session>> {
        self.session.as_ref()
    }

    pub fn last_read(&self) -> u64 {
        self.last_read
    }

    pub fn last_write(&self) -> u64 {
        self.last_write
    }

    pub fn is_closed(&self) -> bool {
        self.n_close != 0
    }

    pub fn hanged_up(&self) -> bool {
        self.hanged_up
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn writeq_len(&self) -> usize {
        self.writeq.len()
    }

    pub fn ssl_state(&self) -> SslState {
        self.ssl_state
    }

    pub fn set_ssl_state(&mut self, state: SslState) {
        self.ssl_state = state;
    }

    pub fn ssl_enabled(&self) -> bool {
        self.stream.as_ref().map(|s| s.is_tls()).unwrap_or(false)
    }

    /// Step the TLS handshake. Returns -1 on error, 0 when another call is
    /// needed once the readiness direction reported by the stream's wants
    /// flags fires, and 1 when the handshake has completed.
    pub fn ssl_handshake(&mut self) -> i32 {
        let Some(stream) = self.stream.as_mut() else {
            return -1;
        };

        match stream.do_handshake() {
            Ok(()) => {
                self.ssl_state = SslState::HandshakeDone;
                1
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => 0,
            Err(e) => {
                warn!("dcb {} tls handshake failed: {}", self.uid, e);
                self.ssl_state = SslState::HandshakeFailed;
                -1
            }
        }
    }

    /// Whether the transport (TCP connect and TLS negotiation) is up.
    pub fn stream_established(&self) -> bool {
        self.stream
            .as_ref()
            .map(|s| s.is_established())
            .unwrap_or(false)
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.stream
            .as_ref()
            .map(|s| s.is_handshaking())
            .unwrap_or(false)
    }

    /// Pull up to `max_bytes` (0 for no limit) from the socket and append to
    /// the read queue. Returns the total length of the read queue and the
    /// number of newly appended bytes. End-of-stream is reported by setting
    /// the hangup flag and scheduling a hangup event, not by a return value.
    pub fn read(&mut self, max_bytes: usize, now_ms: u64) -> Result<(usize, usize), CoreError> {
        if self.is_closed() {
            return Ok((self.readq.len(), 0));
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(CoreError::Internal("read on detached stream".to_string()));
        };

        let mut new_bytes = 0;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    // zero-length read means the peer closed the stream
                    self.hanged_up = true;
                    self.triggered = Some(TriggeredEvent::Hangup);
                    break;
                }
                Ok(n) => {
                    self.readq.extend_from_slice(&chunk[..n]);
                    new_bytes += n;
                    self.stats.n_reads += 1;
                    self.last_read = now_ms;
                    if self.ssl_state == SslState::HandshakeDone {
                        self.ssl_state = SslState::Established;
                    }
                    if max_bytes != 0 && new_bytes >= max_bytes {
                        break;
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => {}
                    _ => {
                        return Err(CoreError::from(e));
                    }
                },
            }
        }

        Ok((self.readq.len(), new_bytes))
    }

    /// Transfer `data` into the write queue. With `DrainMode::Yes` the queue
    /// is flushed to the socket before returning. Returns false only when
    /// the DCB has been closed.
    pub fn writeq_append(
        &mut self,
        data: BufferChain,
        drain: DrainMode,
        registry: &Registry,
        token: Token,
        now_ms: u64,
    ) -> bool {
        if self.is_closed() || data.is_empty() && drain == DrainMode::No {
            return !self.is_closed();
        }

        self.stats.n_buffered += 1;
        self.writeq.append_chain(data);

        if self.high_water > 0
            && !self.high_water_reached
            && self.writeq.len() > self.high_water
        {
            self.high_water_reached = true;
            self.stats.n_high_water += 1;
            self.call_callbacks(Reason::HighWater);
        }

        if drain == DrainMode::Yes {
            self.writeq_drain(registry, token, now_ms);
        } else {
            self.update_interest(registry, token);
        }

        true
    }

    /// Write from the head of the queue until it is empty or the socket
    /// would block. Returns the number of bytes written. A no-op once the
    /// DCB has been closed.
    pub fn writeq_drain(&mut self, registry: &Registry, token: Token, now_ms: u64) -> usize {
        if self.is_closed() || self.state == State::Disconnected {
            return 0;
        }

        let had_bytes = !self.writeq.is_empty();
        let mut flushed = 0;

        {
            let Some(stream) = self.stream.as_mut() else {
                return 0;
            };

            while !self.writeq.is_empty() {
                match stream.write(self.writeq.chunk()) {
                    Ok(n) => {
                        self.writeq.advance(n);
                        flushed += n;
                        self.stats.n_writes += 1;
                        self.last_write = now_ms;
                    }
                    Err(e) => match e.kind() {
                        ErrorKind::WouldBlock => break,
                        ErrorKind::Interrupted => {}
                        _ => {
                            debug!("dcb {} write error: {}", self.uid, e);
                            self.hanged_up = true;
                            self.triggered = Some(TriggeredEvent::Hangup);
                            break;
                        }
                    },
                }
            }
        }

        self.note_drain_progress(had_bytes);
        self.update_interest(registry, token);

        flushed
    }

    // Watermark release and drain notifications, edge-triggered. The two
    // conditions are independent: LowWater fires on the downward crossing
    // even while bytes remain queued, Drained only once the queue empties.
    fn note_drain_progress(&mut self, had_bytes: bool) {
        if self.high_water_reached && self.writeq.len() < self.low_water {
            self.high_water_reached = false;
            self.stats.n_low_water += 1;
            self.call_callbacks(Reason::LowWater);
        }

        if had_bytes && self.writeq.is_empty() {
            self.call_callbacks(Reason::Drained);
        }
    }

    /// Returns the read queue, leaving the DCB without one. The queue
    /// becomes the property of the caller.
    pub fn readq_release(&mut self) -> BufferChain {
        self.readq.take_all()
    }

    /// Store unconsumed bytes back when processing needs to wait for more
    /// data to arrive.
    pub fn readq_append(&mut self, data: BufferChain) {
        self.readq.append_chain(data);
    }

    pub fn readq_prepend(&mut self, data: BufferChain) {
        self.readq.prepend_chain(data);
    }

    /// Replace the read queue. The expectation is that no queue exists when
    /// this is called; if one does, the buffers are concatenated so that no
    /// protocol bytes are dropped.
    pub fn readq_set(&mut self, data: BufferChain) {
        if !self.readq.is_empty() {
            error!("dcb {}: read queue set while one already exists", self.uid);
            self.readq.append_chain(data);
        } else {
            self.readq = data;
        }
    }

    pub fn readq(&self) -> &BufferChain {
        &self.readq
    }

    pub fn readq_len(&self) -> usize {
        self.readq.len()
    }

    /// Queue a write that must wait until the backend connection is fully
    /// established.
    pub fn delayq_append(&mut self, data: BufferChain) {
        self.delayq.append_chain(data);
    }

    pub fn delayq_release(&mut self) -> BufferChain {
        self.delayq.take_all()
    }

    pub fn delayq_len(&self) -> usize {
        self.delayq.len()
    }

    pub(crate) fn protocol_established(&self) -> bool {
        self.protocol.as_ref().map(|p| p.established()).unwrap_or(false)
    }

    /// Register a callback. Refuses an exact duplicate of an already
    /// registered `(reason, cb, userdata)` triple.
    pub fn add_callback(&mut self, reason: Reason, cb: CallbackFn, userdata: u64) -> bool {
        let duplicate = self
            .callbacks
            .iter()
            .any(|c| c.reason == reason && c.cb == cb && c.userdata == userdata);
        if duplicate {
            return false;
        }
        self.callbacks.push(Callback {
            reason,
            cb,
            userdata,
        });
        true
    }

    /// Remove a previously registered callback. Returns false if no such
    /// registration exists.
    pub fn remove_callback(&mut self, reason: Reason, cb: CallbackFn, userdata: u64) -> bool {
        let before = self.callbacks.len();
        self.callbacks
            .retain(|c| !(c.reason == reason && c.cb == cb && c.userdata == userdata));
        self.callbacks.len() != before
    }

    /// Remove all callbacks.
    pub fn remove_callbacks(&mut self) {
        self.callbacks.clear();
    }

    fn call_callbacks(&mut self, reason: Reason) {
        // snapshot so a callback may add or remove registrations
        let snapshot: Vec<Callback> = self
            .callbacks
            .iter()
            .filter(|c| c.reason == reason)
            .copied()
            .collect();
        for c in snapshot {
            (c.cb)(self, reason, c.userdata);
        }
    }

    /// Arrange a synthetic readable event for the next loop turn. Within a
    /// single handler invocation the last trigger wins.
    pub fn trigger_read_event(&mut self) {
        self.triggered = Some(TriggeredEvent::Readable);
    }

    /// Arrange a synthetic writable event for the next loop turn.
    pub fn trigger_write_event(&mut self) {
        self.triggered = Some(TriggeredEvent::Writable);
    }

    /// Arrange a synthetic hangup event for the next loop turn.
    pub fn trigger_hangup_event(&mut self) {
        self.triggered = Some(TriggeredEvent::Hangup);
    }

    pub(crate) fn take_triggered(&mut self) -> Option<TriggeredEvent> {
        self.triggered.take()
    }

    pub(crate) fn has_triggered(&self) -> bool {
        self.triggered.is_some()
    }

    pub(crate) fn set_hanged_up(&mut self) {
        self.hanged_up = true;
    }

    /// Add the DCB to the readiness set of its worker. Idempotent.
    pub(crate) fn enable_events(&mut self, registry: &Registry, token: Token) -> bool {
        match self.state {
            State::Polling => true,
            State::Created | State::NoPolling => {
                let interest = self.desired_interest();
                let Some(stream) = self.stream.as_mut() else {
                    return false;
                };
                let result = if self.state == State::Created {
                    stream.register(registry, token, interest)
                } else {
                    stream.reregister(registry, token, interest)
                };
                match result {
                    Ok(()) => {
                        self.state = State::Polling;
                        true
                    }
                    Err(e) => {
                        error!("dcb {} failed to register: {}", self.uid, e);
                        false
                    }
                }
            }
            State::Disconnected => false,
        }
    }

    /// Remove the DCB from the readiness set of its worker. Idempotent.
    pub(crate) fn disable_events(&mut self, registry: &Registry) -> bool {
        match self.state {
            State::NoPolling | State::Created => true,
            State::Polling => {
                if let Some(stream) = self.stream.as_mut() {
                    let _ = stream.deregister(registry);
                }
                self.state = State::NoPolling;
                true
            }
            State::Disconnected => false,
        }
    }

    fn desired_interest(&self) -> Interest {
        let mut interest = self
            .stream
            .as_ref()
            .map(|s| s.interest())
            .unwrap_or(Interest::READABLE);
        let wants_write = self
            .stream
            .as_ref()
            .map(|s| s.tls_wants().1)
            .unwrap_or(false);
        if !self.writeq.is_empty() || wants_write {
            interest = interest.add(Interest::WRITABLE);
        }
        interest
    }

    pub(crate) fn update_interest(&mut self, registry: &Registry, token: Token) {
        if self.state != State::Polling {
            return;
        }
        let interest = self.desired_interest();
        if let Some(stream) = self.stream.as_mut() {
            if let Err(e) = stream.reregister(registry, token, interest) {
                debug!("dcb {} failed to reregister: {}", self.uid, e);
            }
        }
    }

    /// First close marks the DCB closed; later closes are no-ops. Returns
    /// true when this call performed the close.
    pub(crate) fn mark_closed(&mut self) -> bool {
        self.n_close += 1;
        self.n_close == 1
    }

    /// Teardown may be deferred while a protocol handler for this DCB is on
    /// the stack; this flag records that it has run.
    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub(crate) fn set_finalized(&mut self) {
        self.finalized = true;
    }

    pub(crate) fn take_session(&mut self) -> Option<Rc<Session>> {
        self.session.take()
    }

    /// Graceful socket teardown: half-close the write side (with TLS
    /// close-notify when enabled) and drain residual reads for a bounded
    /// number of passes.
    pub(crate) fn shutdown_socket(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.shutdown();

            let mut chunk = [0u8; 4096];
            for _ in 0..SHUTDOWN_DRAIN_PASSES {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
        self.state = State::Disconnected;
    }

    /// Free all queues and callbacks. No callbacks fire after this.
    pub(crate) fn clear(&mut self) {
        self.readq.clear();
        self.writeq.clear();
        self.delayq.clear();
        self.callbacks.clear();
        self.triggered = None;
        self.stream = None;
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "uid": self.uid,
            "role": self.role.as_str(),
            "state": self.state.as_str(),
            "remote": self.remote,
            "writeq_len": self.writeq.len(),
            "readq_len": self.readq.len(),
            "last_read_ms": self.last_read,
            "last_write_ms": self.last_write,
            "ssl": self.ssl_state.as_str(),
            "stats": {
                "reads": self.stats.n_reads,
                "writes": self.stats.n_writes,
                "buffered": self.stats.n_buffered,
                "high_water": self.stats.n_high_water,
                "low_water": self.stats.n_low_water,
            },
        });
        if let Some(server) = &self.server {
            value["server"] = serde_json::Value::String(server.name().to_string());
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientProtocol;
    use crate::worker::Worker;
    use net::{Poll, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopProtocol;

    impl ClientProtocol for NoopProtocol {
        fn init_connection(&mut self, _worker: &mut Worker, _token: Token) -> bool {
            true
        }

        fn finish_connection(&mut self, _worker: &mut Worker, _token: Token) {}

        fn read_ready(&mut self, _worker: &mut Worker, _token: Token) -> Result<(), CoreError> {
            Ok(())
        }

        fn write(&mut self, _worker: &mut Worker, _token: Token, _data: BufferChain) -> bool {
            true
        }

        fn hangup(&mut self, _worker: &mut Worker, _token: Token) -> Result<(), CoreError> {
            Ok(())
        }

        fn connlimit(&mut self, _worker: &mut Worker, _token: Token, _limit: usize) {}
    }

    static HIGH_FIRES: AtomicUsize = AtomicUsize::new(0);
    static LOW_FIRES: AtomicUsize = AtomicUsize::new(0);
    static DRAIN_FIRES: AtomicUsize = AtomicUsize::new(0);

    fn on_high(_dcb: &mut Dcb, _reason: Reason, _userdata: u64) {
        HIGH_FIRES.fetch_add(1, Ordering::Relaxed);
    }

    fn on_low(_dcb: &mut Dcb, _reason: Reason, _userdata: u64) {
        LOW_FIRES.fetch_add(1, Ordering::Relaxed);
    }

    fn on_drained(_dcb: &mut Dcb, _reason: Reason, _userdata: u64) {
        DRAIN_FIRES.fetch_add(1, Ordering::Relaxed);
    }

    // A real socket pair so the DCB has a stream; the peer end keeps the
    // connection alive without reading.
    fn test_dcb(high_water: usize, low_water: usize) -> (Dcb, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind");
        let addr = listener.local_addr().unwrap();
        let peer = std::net::TcpStream::connect(addr).expect("failed to connect");
        let (accepted, _) = listener.accept().expect("failed to accept");
        let stream = Stream::from(TcpStream::from_std(accepted).expect("failed to wrap"));

        let dcb = Dcb::new(
            1,
            0,
            Role::Client,
            stream,
            "127.0.0.1".to_string(),
            None,
            ProtocolHandle::Client(Box::new(NoopProtocol)),
            high_water,
            low_water,
            0,
        );
        (dcb, peer)
    }

    #[test]
    fn low_water_fires_without_drained_on_a_partial_drain() {
        HIGH_FIRES.store(0, Ordering::Relaxed);
        LOW_FIRES.store(0, Ordering::Relaxed);
        DRAIN_FIRES.store(0, Ordering::Relaxed);

        let (mut dcb, _peer) = test_dcb(1024, 256);
        let poll = Poll::new().unwrap();

        assert!(dcb.add_callback(Reason::HighWater, on_high, 0));
        assert!(dcb.add_callback(Reason::LowWater, on_low, 0));
        assert!(dcb.add_callback(Reason::Drained, on_drained, 0));

        let data = BufferChain::from(vec![b'x'; 2000]);
        assert!(dcb.writeq_append(data, DrainMode::No, poll.registry(), Token(0), 0));
        assert_eq!(HIGH_FIRES.load(Ordering::Relaxed), 1);
        assert_eq!(LOW_FIRES.load(Ordering::Relaxed), 0);

        // 1800 of the queued bytes leave; 200 remain, below the low mark
        dcb.writeq.advance(1800);
        dcb.note_drain_progress(true);
        assert_eq!(LOW_FIRES.load(Ordering::Relaxed), 1);
        assert_eq!(DRAIN_FIRES.load(Ordering::Relaxed), 0);

        // the rest leaves: drained, and no second low-water fire
        dcb.writeq.advance(200);
        dcb.note_drain_progress(true);
        assert_eq!(LOW_FIRES.load(Ordering::Relaxed), 1);
        assert_eq!(DRAIN_FIRES.load(Ordering::Relaxed), 1);

        // a pass over an already-empty queue notifies nothing further
        dcb.note_drain_progress(false);
        assert_eq!(DRAIN_FIRES.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn readq_set_concatenates_an_existing_queue() {
        let (mut dcb, _peer) = test_dcb(0, 0);

        dcb.readq_set(BufferChain::from(&b"abc"[..]));
        assert_eq!(dcb.readq_len(), 3);

        // setting over an existing queue keeps both, in stream order
        dcb.readq_set(BufferChain::from(&b"def"[..]));
        assert_eq!(dcb.readq_len(), 6);

        let mut out = [0u8; 6];
        assert_eq!(dcb.readq().copy_out(0, &mut out), 6);
        assert_eq!(&out, b"abcdef");
    }
}
