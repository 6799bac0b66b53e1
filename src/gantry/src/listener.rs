// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Listeners tie a network port to a service. A listener owns the accept
//! strategy (shared, per-worker, unix socket or main-worker dispatch), the
//! protocol module used for accepted clients, and the per-remote
//! authentication flood tracking.

use crate::error::CoreError;
use crate::protocol::ProtocolModule;
use crate::router::Service;
use crate::session::{CloseReason, Session};
use crate::worker::{Worker, Workers};
use crate::ACCEPT_BATCH;

use net::{ListenSocket, Stream, TcpListener, TlsTcpAcceptor, Token, UnixListener};
use serde::Serialize;

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

pub use config::ListenerKind;

/// Lifecycle of a listener.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Started,
    Stopped,
    Failed,
    Destroyed,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Created => "Created",
            ListenerState::Started => "Running",
            ListenerState::Stopped => "Stopped",
            ListenerState::Failed => "Failed",
            ListenerState::Destroyed => "Destroyed",
        }
    }
}

struct AuthFailure {
    score: f64,
    updated: Instant,
}

/// A bound accept socket with a protocol factory. Shared by reference with
/// every client session accepted through it, so a destroyed listener
/// lingers until the last of its clients is gone.
pub struct Listener {
    config: config::Listener,
    service: Arc<Service>,
    protocol: Arc<dyn ProtocolModule>,
    tls: Option<Arc<TlsTcpAcceptor>>,
    state: Mutex<ListenerState>,
    shared_socket: Mutex<Option<ListenSocket>>,
    auth_failures: Mutex<HashMap<String, AuthFailure>>,
    n_accepts: AtomicU64,
}

fn registry() -> &'static Mutex<HashMap<String, Arc<Listener>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Listener>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Listener {
    /// Create a listener and add it to the global registry. The listener is
    /// not yet accepting; call `listen` to bind and start it.
    pub fn create(
        config: config::Listener,
        service: Arc<Service>,
        protocol: Arc<dyn ProtocolModule>,
        tls: Option<Arc<TlsTcpAcceptor>>,
    ) -> Result<Arc<Self>, CoreError> {
        if config.tls() && tls.is_none() {
            return Err(CoreError::Tls(format!(
                "listener '{}' requires tls but no tls configuration was provided",
                config.name()
            )));
        }

        let listener = Arc::new(Self {
            config,
            service,
            protocol,
            tls,
            state: Mutex::new(ListenerState::Created),
            shared_socket: Mutex::new(None),
            auth_failures: Mutex::new(HashMap::new()),
            n_accepts: AtomicU64::new(0),
        });

        let mut names = registry().lock().unwrap();
        if names.contains_key(listener.name()) {
            return Err(CoreError::Internal(format!(
                "listener '{}' already exists",
                listener.name()
            )));
        }
        names.insert(listener.name().to_string(), listener.clone());

        Ok(listener)
    }

    /// Remove the listener from the registry and close its sockets on all
    /// workers. Clients accepted through it keep their shared reference, so
    /// the object itself lingers until they are gone.
    pub fn destroy(listener: &Arc<Listener>, workers: &Arc<Workers>) {
        registry().lock().unwrap().remove(listener.name());

        let name = listener.name().to_string();
        let _ = workers.broadcast(move |_| {
            let name = name.clone();
            Box::new(move |worker: &mut Worker| {
                worker.remove_accepts(&name);
            })
        });

        *listener.shared_socket.lock().unwrap() = None;
        *listener.state.lock().unwrap() = ListenerState::Destroyed;
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn address(&self) -> &str {
        self.config.address()
    }

    pub fn port(&self) -> u16 {
        self.config.port()
    }

    pub fn kind(&self) -> ListenerKind {
        self.config.kind()
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn protocol_module(&self) -> &Arc<dyn ProtocolModule> {
        &self.protocol
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap()
    }

    /// The address actually bound, once listening. Meaningful for shared
    /// and main-worker TCP listeners, in particular with an ephemeral port.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.shared_socket
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    fn socket_addr(&self) -> Result<SocketAddr, CoreError> {
        format!("{}:{}", self.config.address(), self.config.port())
            .parse()
            .map_err(|_| {
                CoreError::Internal(format!(
                    "listener '{}' has a bad listen address",
                    self.name()
                ))
            })
    }

    /// Bind and start accepting on every worker according to the listener
    /// kind.
    pub fn listen(self: &Arc<Self>, workers: &Arc<Workers>) -> Result<(), CoreError> {
        let result = self.listen_inner(workers);
        *self.state.lock().unwrap() = match result {
            Ok(()) => ListenerState::Started,
            Err(_) => ListenerState::Failed,
        };
        result
    }

    fn listen_inner(self: &Arc<Self>, workers: &Arc<Workers>) -> Result<(), CoreError> {
        match self.config.kind() {
            ListenerKind::Shared => {
                let socket = TcpListener::bind(self.socket_addr()?).map_err(CoreError::from)?;
                let socket = self.wrap_socket(socket);
                self.distribute_clones(workers, socket)
            }
            ListenerKind::Unix => {
                let path = self.config.socket().ok_or_else(|| {
                    CoreError::Internal(format!(
                        "unix listener '{}' has no socket path",
                        self.name()
                    ))
                })?;
                // stale socket files keep the bind from succeeding
                let _ = std::fs::remove_file(path);
                let socket = UnixListener::bind(path).map_err(CoreError::from)?;
                self.distribute_clones(workers, ListenSocket::from(socket))
            }
            ListenerKind::Unique => {
                let addr = self.socket_addr()?;
                for handle in workers.handles() {
                    let socket =
                        TcpListener::bind_reuseport(addr).map_err(CoreError::from)?;
                    let socket = self.wrap_socket(socket);
                    self.post_register(workers, handle.id(), socket)?;
                }
                Ok(())
            }
            ListenerKind::Main => {
                let socket = TcpListener::bind(self.socket_addr()?).map_err(CoreError::from)?;
                let socket = self.wrap_socket(socket);
                let clone = socket.try_clone().map_err(CoreError::from)?;
                self.post_register(workers, 0, clone)?;
                *self.shared_socket.lock().unwrap() = Some(socket);
                Ok(())
            }
        }
    }

    fn wrap_socket(&self, socket: TcpListener) -> ListenSocket {
        match &self.tls {
            Some(acceptor) if self.config.tls() => {
                ListenSocket::from((socket, acceptor.clone()))
            }
            _ => ListenSocket::from(socket),
        }
    }

    fn distribute_clones(
        self: &Arc<Self>,
        workers: &Arc<Workers>,
        socket: ListenSocket,
    ) -> Result<(), CoreError> {
        for handle in workers.handles() {
            let clone = socket.try_clone().map_err(CoreError::from)?;
            self.post_register(workers, handle.id(), clone)?;
        }
        *self.shared_socket.lock().unwrap() = Some(socket);
        Ok(())
    }

    fn post_register(
        self: &Arc<Self>,
        workers: &Arc<Workers>,
        worker_id: usize,
        socket: ListenSocket,
    ) -> Result<(), CoreError> {
        let listener = self.clone();
        workers.post(
            worker_id,
            Box::new(move |worker: &mut Worker| {
                if let Err(e) = worker.register_accept(listener.clone(), socket) {
                    error!(
                        "listener '{}' failed to register on worker {}: {}",
                        listener.name(),
                        worker.id(),
                        e
                    );
                }
            }),
        )
    }

    /// Stop accepting without closing the sockets. Already-accepted
    /// sessions are not affected.
    pub fn stop(self: &Arc<Self>, workers: &Arc<Workers>) -> bool {
        if self.state() != ListenerState::Started {
            return false;
        }
        let name = self.name().to_string();
        let posted = workers.broadcast(move |_| {
            let name = name.clone();
            Box::new(move |worker: &mut Worker| worker.set_accept_enabled(&name, false))
        });
        if posted.is_ok() {
            *self.state.lock().unwrap() = ListenerState::Stopped;
        }
        posted.is_ok()
    }

    /// Resume accepting on a stopped listener, on the same address.
    pub fn start(self: &Arc<Self>, workers: &Arc<Workers>) -> bool {
        if self.state() != ListenerState::Stopped {
            return false;
        }
        let name = self.name().to_string();
        let posted = workers.broadcast(move |_| {
            let name = name.clone();
            Box::new(move |worker: &mut Worker| worker.set_accept_enabled(&name, true))
        });
        if posted.is_ok() {
            *self.state.lock().unwrap() = ListenerState::Started;
        }
        posted.is_ok()
    }

    // ---- authentication flood control -----------------------------------

    /// Record a failed authentication from a remote. Enough failures get
    /// later connection attempts from the host rejected before a session
    /// is built; the score decays linearly over time.
    pub fn mark_auth_as_failed(&self, remote: &str) {
        let mut failures = self.auth_failures.lock().unwrap();
        let now = Instant::now();
        let decay = self.config.auth_fail_decay();
        let entry = failures.entry(remote.to_string()).or_insert(AuthFailure {
            score: 0.0,
            updated: now,
        });
        let elapsed = now.duration_since(entry.updated).as_secs_f64();
        entry.score = (entry.score - elapsed * decay).max(0.0) + 1.0;
        entry.updated = now;
    }

    /// Whether connections from the remote are currently turned away.
    pub fn auth_blocked(&self, remote: &str) -> bool {
        let mut failures = self.auth_failures.lock().unwrap();
        let now = Instant::now();
        let decay = self.config.auth_fail_decay();
        let Some(entry) = failures.get_mut(remote) else {
            return false;
        };
        let elapsed = now.duration_since(entry.updated).as_secs_f64();
        entry.score = (entry.score - elapsed * decay).max(0.0);
        entry.updated = now;
        if entry.score == 0.0 {
            failures.remove(remote);
            return false;
        }
        entry.score >= self.config.auth_fail_limit() as f64
    }

    // ---- accepting ------------------------------------------------------

    /// Readable event on an accept socket: accept until the kernel has no
    /// more pending connections, bounded per event so one listener cannot
    /// starve the worker.
    pub(crate) fn accept_ready(self: &Arc<Self>, worker: &mut Worker, token: Token) {
        for _ in 0..ACCEPT_BATCH {
            let accepted = match worker.accept_one(token) {
                None => return,
                Some(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Some(Err(e)) => {
                    // a failed accept (e.g. an aborted TLS handshake) does
                    // not invalidate the rest of the backlog
                    warn!("listener '{}' accept failed: {}", self.name(), e);
                    continue;
                }
                Some(Ok(accepted)) => accepted,
            };
            let (stream, remote) = accepted;
            self.n_accepts.fetch_add(1, Ordering::Relaxed);

            if self.auth_blocked(&remote) {
                self.reject_connection(stream, &remote);
                continue;
            }

            if self.config.kind() == ListenerKind::Main {
                let target = worker.workers().least_loaded();
                if target != worker.id() {
                    let listener = self.clone();
                    let result = worker.workers().post(
                        target,
                        Box::new(move |worker: &mut Worker| {
                            let _ = attach_client(worker, &listener, stream, remote);
                        }),
                    );
                    if let Err(e) = result {
                        warn!("listener '{}' failed to dispatch accept: {}", self.name(), e);
                    }
                    continue;
                }
            }

            let _ = attach_client(worker, self, stream, remote);
        }

        // a full batch likely left connections in the backlog; readiness is
        // edge-triggered so no further event will fire for them
        let listener = self.clone();
        let _ = worker.workers().post(
            worker.id(),
            Box::new(move |worker: &mut Worker| {
                listener.accept_ready(worker, token);
            }),
        );
    }

    /// Ask the protocol for a deny message, write it to the raw socket and
    /// drop the connection. No session or DCB is built.
    fn reject_connection(&self, mut stream: Stream, host: &str) {
        info!(
            "listener '{}' rejecting connection from {}: too many authentication failures",
            self.name(),
            host
        );
        let message = self.protocol.reject(host);
        if !message.is_empty() {
            let _ = stream.write(&message);
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "state": self.state().as_str(),
            "kind": self.config.kind().to_string(),
            "address": self.config.address(),
            "port": self.config.port(),
            "socket": self.config.socket(),
            "protocol": self.protocol.name(),
            "service": self.service.name(),
            "tls": self.config.tls(),
            "accepts": self.n_accepts.load(Ordering::Relaxed),
        })
    }
}

/// Build a session and client DCB for an accepted stream and initialize its
/// protocol. Runs on the worker that will own the connection.
pub fn attach_client(
    worker: &mut Worker,
    listener: &Arc<Listener>,
    stream: Stream,
    remote: String,
) -> Result<Token, CoreError> {
    let service = listener.service();
    let session = Session::new(listener, worker.id(), remote.clone());
    let protocol = listener.protocol_module().create_client_protocol(&session);

    let token = worker.add_client_dcb(stream, remote, session.clone(), protocol)?;

    // connection limit: the protocol composes the refusal so the client
    // sees a proper wire-level message before the socket closes
    let limit = service.max_connections();
    if limit > 0 && service.stats().n_current.load(Ordering::Relaxed) >= limit {
        session.set_close_reason(CloseReason::TooManyConnections);
        worker.client_connlimit(token, limit);
        worker.close_dcb(token);
        return Err(CoreError::ResourceExhaustion(format!(
            "service '{}' connection limit ({}) reached",
            service.name(),
            limit
        )));
    }

    if let Err(e) = session.setup_pipeline() {
        error!("failed to set up session pipeline: {}", e);
        worker.close_dcb(token);
        return Err(e);
    }

    if !worker.init_client_protocol(token) {
        worker.close_dcb(token);
        return Err(CoreError::Protocol(
            "client connection initialization failed".to_string(),
        ));
    }

    Ok(token)
}

// ---- registry lookups ---------------------------------------------------

pub fn listener_find(name: &str) -> Option<Arc<Listener>> {
    registry().lock().unwrap().get(name).cloned()
}

pub fn listener_find_by_address(address: &str, port: u16) -> Option<Arc<Listener>> {
    registry()
        .lock()
        .unwrap()
        .values()
        .find(|l| l.address() == address && l.port() == port)
        .cloned()
}

pub fn listener_find_by_socket(socket: &str) -> Option<Arc<Listener>> {
    registry()
        .lock()
        .unwrap()
        .values()
        .find(|l| l.config.socket() == Some(socket))
        .cloned()
}

pub fn listener_find_by_service(service: &str) -> Vec<Arc<Listener>> {
    registry()
        .lock()
        .unwrap()
        .values()
        .filter(|l| l.service.name() == service)
        .cloned()
        .collect()
}

// ---- persistence --------------------------------------------------------

#[derive(Serialize)]
struct PersistedListener<'a> {
    listener: [&'a config::Listener; 1],
}

/// Persist a listener definition to `<dir>/<name>.conf` in the same format
/// the configuration parser reads, so created listeners survive a restart.
/// Replaces any existing file with the same name.
pub fn listener_serialize(listener: &Arc<Listener>, dir: &Path) -> std::io::Result<PathBuf> {
    let persisted = PersistedListener {
        listener: [&listener.config],
    };
    let content = toml::to_string_pretty(&persisted)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let path = dir.join(format!("{}.conf", listener.name()));
    let mut file = std::fs::File::create(&path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(path)
}
