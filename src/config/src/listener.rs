// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const ADDRESS: &str = "0.0.0.0";
const AUTH_FAIL_LIMIT: u32 = 10;
const AUTH_FAIL_DECAY: f64 = 1.0;

// helper functions
fn address() -> String {
    ADDRESS.to_string()
}

fn auth_fail_limit() -> u32 {
    AUTH_FAIL_LIMIT
}

fn auth_fail_decay() -> f64 {
    AUTH_FAIL_DECAY
}

/// How the listening socket is shared between the worker threads.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    /// A unix domain socket shared between workers.
    Unix,
    /// One TCP listening socket shared between workers.
    Shared,
    /// A unique TCP listening socket for each worker (SO_REUSEPORT).
    Unique,
    /// Accepts land on the first worker and are dispatched to the least
    /// loaded worker.
    Main,
}

impl Default for ListenerKind {
    fn default() -> Self {
        Self::Shared
    }
}

impl std::fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix => write!(f, "unix"),
            Self::Shared => write!(f, "shared"),
            Self::Unique => write!(f, "unique"),
            Self::Main => write!(f, "main"),
        }
    }
}

// definitions
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Listener {
    name: String,
    service: String,
    protocol: String,
    #[serde(default)]
    kind: ListenerKind,
    #[serde(default = "address")]
    address: String,
    #[serde(default)]
    port: u16,
    /// Path for unix domain listeners.
    #[serde(skip_serializing_if = "Option::is_none")]
    socket: Option<String>,
    #[serde(default)]
    tls: bool,
    #[serde(default = "auth_fail_limit")]
    auth_fail_limit: u32,
    #[serde(default = "auth_fail_decay")]
    auth_fail_decay: f64,
}

// implementation
impl Listener {
    pub fn new(name: &str, service: &str, protocol: &str, kind: ListenerKind) -> Self {
        Self {
            name: name.to_string(),
            service: service.to_string(),
            protocol: protocol.to_string(),
            kind,
            address: address(),
            port: 0,
            socket: None,
            tls: false,
            auth_fail_limit: auth_fail_limit(),
            auth_fail_decay: auth_fail_decay(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_address(&mut self, address: &str) {
        self.address = address.to_string();
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn socket(&self) -> Option<&str> {
        self.socket.as_deref()
    }

    pub fn set_socket(&mut self, socket: &str) {
        self.socket = Some(socket.to_string());
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn set_tls(&mut self, tls: bool) {
        self.tls = tls;
    }

    /// Failed authentications tolerated from one remote before connections
    /// from it are rejected.
    pub fn auth_fail_limit(&self) -> u32 {
        self.auth_fail_limit
    }

    /// Rate at which recorded failures are forgiven, in failures per second.
    pub fn auth_fail_decay(&self) -> f64 {
        self.auth_fail_decay
    }
}

// trait definitions
pub trait ListenerConfig {
    fn listeners(&self) -> &[Listener];
}
