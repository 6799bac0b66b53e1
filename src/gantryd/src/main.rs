// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The gantry proxy daemon: loads a TOML configuration, registers the
//! bundled protocol and router modules, and runs the proxy until the
//! process is terminated.

#[macro_use]
extern crate log;

mod modules;

use clap::Parser;
use common::ssl::tls_acceptor;
use config::{ProxyConfig, TlsConfig, WorkerConfig};
use gantry::process::ProcessBuilder;
use gantry::protocol::ProtocolModule;
use gantry::router::{RouterModule, Service, Target};
use modules::line::LineProtocol;
use modules::passthrough::PassthroughRouter;

use std::collections::HashMap;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gantryd", about = "gantry database proxy daemon", version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Directory of persisted listener definitions to load in addition to
    /// the configuration file
    #[arg(long)]
    persistdir: Option<String>,
}

#[derive(serde::Deserialize)]
struct PersistedListeners {
    #[serde(default)]
    listener: Vec<config::Listener>,
}

/// Read back listener definitions previously written by the runtime, so
/// listeners created at admin time survive a restart.
fn load_persisted_listeners(dir: &str) -> Vec<config::Listener> {
    let mut listeners = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot read persisted listeners from {}: {}", dir, e);
            return listeners;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e != "conf").unwrap_or(true) {
            continue;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("cannot read {}: {}", path.display(), e);
                continue;
            }
        };
        match toml::from_str::<PersistedListeners>(&content) {
            Ok(mut persisted) => listeners.append(&mut persisted.listener),
            Err(e) => warn!("bad persisted listener {}: {}", path.display(), e),
        }
    }

    listeners
}

fn protocol_modules() -> HashMap<&'static str, Arc<dyn ProtocolModule>> {
    let mut modules: HashMap<&'static str, Arc<dyn ProtocolModule>> = HashMap::new();
    let line = Arc::new(LineProtocol::default());
    modules.insert(line.name(), line);
    modules
}

fn router_modules() -> HashMap<&'static str, Arc<dyn RouterModule>> {
    let mut modules: HashMap<&'static str, Arc<dyn RouterModule>> = HashMap::new();
    let passthrough = Arc::new(PassthroughRouter::default());
    modules.insert(passthrough.name(), passthrough);
    modules
}

fn build_services(
    config: &ProxyConfig,
    routers: &HashMap<&'static str, Arc<dyn RouterModule>>,
) -> Result<HashMap<String, Arc<Service>>, String> {
    let mut services = HashMap::new();

    for definition in config.services() {
        let router = routers
            .get(definition.router())
            .ok_or_else(|| format!("unknown router module '{}'", definition.router()))?
            .clone();

        let mut builder = Service::builder(definition.name(), router)
            .max_connections(definition.max_connections());
        if let Some(depth) = definition.retain_last_statements() {
            builder = builder.retain_last_statements(depth);
        }
        for target in definition.targets() {
            let address = target
                .address()
                .parse()
                .map_err(|_| format!("bad target address '{}'", target.address()))?;
            builder = builder.target(Arc::new(Target::new(target.name(), address)));
        }

        services.insert(definition.name().to_string(), builder.build());
    }

    Ok(services)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match ProxyConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error loading config from {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => ProxyConfig::default(),
    };

    let protocols = protocol_modules();
    let routers = router_modules();

    let services = match build_services(&config, &routers) {
        Ok(services) => services,
        Err(e) => {
            eprintln!("error in service configuration: {}", e);
            std::process::exit(1);
        }
    };

    let tls = match tls_acceptor(config.tls()) {
        Ok(acceptor) => acceptor.map(Arc::new),
        Err(e) => {
            eprintln!("error in tls configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut definitions: Vec<config::Listener> = config.listeners().to_vec();
    if let Some(dir) = &args.persistdir {
        definitions.extend(load_persisted_listeners(dir));
    }

    let mut builder = ProcessBuilder::new(&config);
    for listener in &definitions {
        let Some(service) = services.get(listener.service()) else {
            eprintln!("listener '{}' references unknown service", listener.name());
            std::process::exit(1);
        };
        let Some(protocol) = protocols.get(listener.protocol()) else {
            eprintln!(
                "listener '{}' references unknown protocol '{}'",
                listener.name(),
                listener.protocol()
            );
            std::process::exit(1);
        };
        builder = builder.listener(
            listener.clone(),
            service.clone(),
            protocol.clone(),
            tls.clone(),
        );
    }

    info!(
        "starting gantryd with {} workers",
        config.worker().threads()
    );

    match builder.spawn() {
        Ok(process) => process.wait(),
        Err(e) => {
            eprintln!("failed to start: {}", e);
            std::process::exit(1);
        }
    }
}
