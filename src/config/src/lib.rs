// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

#[macro_use]
extern crate log;

mod listener;
mod service;
mod session;
mod tls;
mod worker;

pub use listener::{Listener, ListenerConfig, ListenerKind};
pub use service::{Service, ServiceConfig, Target};
pub use session::{DumpStatements, Session, SessionConfig};
pub use tls::{Tls, TlsConfig};
pub use worker::{Worker, WorkerConfig};

use serde::{Deserialize, Serialize};
use std::io::Read;

/// Top-level configuration for the proxy daemon.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    worker: Worker,
    #[serde(default)]
    session: Session,
    #[serde(default)]
    tls: Tls,
    #[serde(default, rename = "service")]
    services: Vec<Service>,
    #[serde(default, rename = "listener")]
    listeners: Vec<Listener>,
}

impl ProxyConfig {
    pub fn load(file: &str) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(file)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            error!("{}", e);
            std::io::Error::new(std::io::ErrorKind::Other, "error parsing config")
        })?;

        for listener in &config.listeners {
            if !config.services.iter().any(|s| s.name() == listener.service()) {
                error!(
                    "listener '{}' references unknown service '{}'",
                    listener.name(),
                    listener.service()
                );
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "listener references unknown service",
                ));
            }
        }

        Ok(config)
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }
}

impl WorkerConfig for ProxyConfig {
    fn worker(&self) -> &Worker {
        &self.worker
    }
}

impl SessionConfig for ProxyConfig {
    fn session(&self) -> &Session {
        &self.session
    }
}

impl TlsConfig for ProxyConfig {
    fn tls(&self) -> &Tls {
        &self.tls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let config: ProxyConfig = toml::from_str("").expect("empty config is valid");
        assert_eq!(config.worker().threads(), 4);
        assert_eq!(config.session().retain_last_statements(), 0);
    }

    #[test]
    fn parse_full() {
        let content = r#"
            [worker]
            threads = 2
            nevent = 512
            timeout = 10

            [session]
            retain_last_statements = 8
            dump_statements = "on_error"
            session_trace = 32
            idle_timeout = 300

            [[service]]
            name = "orders"
            router = "passthrough"

            [[service.target]]
            name = "db1"
            address = "127.0.0.1:3306"

            [[listener]]
            name = "orders-listener"
            service = "orders"
            protocol = "line"
            kind = "shared"
            address = "127.0.0.1"
            port = 4006
        "#;
        let config: ProxyConfig = toml::from_str(content).expect("config is valid");
        assert_eq!(config.worker().threads(), 2);
        assert_eq!(config.session().dump_statements(), DumpStatements::OnError);
        assert_eq!(config.services().len(), 1);
        assert_eq!(config.listeners().len(), 1);
        assert_eq!(config.listeners()[0].kind(), ListenerKind::Shared);
        assert_eq!(config.services()[0].targets()[0].address(), "127.0.0.1:3306");
    }
}
