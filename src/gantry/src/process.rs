// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Process assembly: spawns the worker threads, wires the shutdown signal
//! fan-out and attaches the configured listeners.

use crate::error::CoreError;
use crate::listener::Listener;
use crate::protocol::ProtocolModule;
use crate::router::Service;
use crate::session::{
    session_set_dump_statements, session_set_retain_last_statements, session_set_session_trace,
};
use crate::worker::{WorkerBuilder, Workers};

use common::signal::Signal;
use net::Waker;
use queues::{fan_out, Dispatcher};

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const THREAD_PREFIX: &str = "gantry";
const SIGNAL_QUEUE_CAPACITY: usize = 1024;

struct ListenerSpec {
    config: config::Listener,
    service: Arc<Service>,
    protocol: Arc<dyn ProtocolModule>,
    tls: Option<Arc<net::TlsTcpAcceptor>>,
}

/// Builds a running proxy process from configuration, services, protocol
/// modules and listener definitions.
pub struct ProcessBuilder {
    threads: usize,
    nevent: usize,
    timeout: Duration,
    high_water: usize,
    low_water: usize,
    idle_timeout_ms: u64,
    listeners: Vec<ListenerSpec>,
}

impl ProcessBuilder {
    pub fn new<T: config::WorkerConfig + config::SessionConfig>(config: &T) -> Self {
        let worker = config.worker();
        let session = config.session();

        session_set_retain_last_statements(session.retain_last_statements());
        session_set_dump_statements(session.dump_statements());
        session_set_session_trace(session.session_trace());

        Self {
            threads: worker.threads(),
            nevent: worker.nevent(),
            timeout: Duration::from_millis(worker.timeout() as u64),
            high_water: worker.writeq_high_water(),
            low_water: worker.writeq_low_water(),
            idle_timeout_ms: session.idle_timeout() * 1000,
            listeners: Vec::new(),
        }
    }

    /// Add a listener to create and start once the workers are running.
    pub fn listener(
        mut self,
        config: config::Listener,
        service: Arc<Service>,
        protocol: Arc<dyn ProtocolModule>,
        tls: Option<Arc<net::TlsTcpAcceptor>>,
    ) -> Self {
        self.listeners.push(ListenerSpec {
            config,
            service,
            protocol,
            tls,
        });
        self
    }

    pub fn spawn(self) -> Result<Process, CoreError> {
        let mut builders = Vec::with_capacity(self.threads);
        for id in 0..self.threads {
            builders.push(
                WorkerBuilder::new(id)?
                    .nevent(self.nevent)
                    .timeout(self.timeout)
                    .watermarks(self.high_water, self.low_water)
                    .idle_timeout(self.idle_timeout_ms),
            );
        }

        let workers = Workers::new(builders.iter().map(|b| b.handle()).collect());

        // the shutdown fabric: the process handle keeps the sending side,
        // every worker receives through its own waker-paired mailbox
        let worker_wakers: Vec<Arc<Waker>> = builders.iter().map(|b| b.waker()).collect();
        let (signal_tx, mut signal_mailboxes) =
            fan_out::<Signal>(&worker_wakers, SIGNAL_QUEUE_CAPACITY);

        let mut threads = Vec::with_capacity(self.threads);
        for builder in builders {
            let workers = workers.clone();
            let mailbox = signal_mailboxes.remove(0);
            let thread = std::thread::Builder::new()
                .name(format!("{}_worker_{}", THREAD_PREFIX, builder.handle().id()))
                .spawn(move || {
                    let mut worker = builder.build(workers, Some(mailbox));
                    worker.run();
                })
                .map_err(|e| CoreError::ResourceExhaustion(e.to_string()))?;
            threads.push(thread);
        }

        let mut listeners = Vec::with_capacity(self.listeners.len());
        for spec in self.listeners {
            let listener =
                Listener::create(spec.config, spec.service, spec.protocol, spec.tls)?;
            listener.listen(&workers)?;
            listeners.push(listener);
        }

        Ok(Process {
            workers,
            threads,
            listeners,
            signal_tx,
        })
    }
}

/// A running proxy process: worker threads plus started listeners.
pub struct Process {
    workers: Arc<Workers>,
    threads: Vec<JoinHandle<()>>,
    listeners: Vec<Arc<Listener>>,
    signal_tx: Dispatcher<Signal>,
}

impl Process {
    pub fn workers(&self) -> &Arc<Workers> {
        &self.workers
    }

    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    /// Gracefully shut down: every worker receives a shutdown signal and
    /// the calling thread blocks until they have all exited.
    pub fn shutdown(mut self) {
        if self.signal_tx.send_all(Signal::Shutdown).is_err() {
            error!("error sending shutdown signal to workers");
        }
        if let Err(e) = self.signal_tx.flush() {
            error!("error waking workers for shutdown: {}", e);
        }
        self.wait()
    }

    /// Block until every worker thread terminates.
    pub fn wait(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}
