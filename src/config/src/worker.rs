// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const THREADS: usize = 4;
const NEVENT: usize = 1024;
const TIMEOUT: usize = 100;
const WRITEQ_HIGH_WATER: usize = 0;
const WRITEQ_LOW_WATER: usize = 0;

// helper functions
fn threads() -> usize {
    THREADS
}

fn nevent() -> usize {
    NEVENT
}

fn timeout() -> usize {
    TIMEOUT
}

fn writeq_high_water() -> usize {
    WRITEQ_HIGH_WATER
}

fn writeq_low_water() -> usize {
    WRITEQ_LOW_WATER
}

// definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct Worker {
    #[serde(default = "threads")]
    threads: usize,
    #[serde(default = "nevent")]
    nevent: usize,
    #[serde(default = "timeout")]
    timeout: usize,
    #[serde(default = "writeq_high_water")]
    writeq_high_water: usize,
    #[serde(default = "writeq_low_water")]
    writeq_low_water: usize,
}

// implementation
impl Worker {
    /// Number of worker threads to spawn.
    pub fn threads(&self) -> usize {
        std::cmp::max(1, self.threads)
    }

    /// Maximum events returned from a single poll.
    pub fn nevent(&self) -> usize {
        self.nevent
    }

    /// Poll timeout in milliseconds.
    pub fn timeout(&self) -> usize {
        self.timeout
    }

    /// Write queue backpressure threshold in bytes; zero disables the
    /// watermark callbacks.
    pub fn writeq_high_water(&self) -> usize {
        self.writeq_high_water
    }

    pub fn writeq_low_water(&self) -> usize {
        self.writeq_low_water
    }
}

// trait implementations
impl Default for Worker {
    fn default() -> Self {
        Self {
            threads: threads(),
            nevent: nevent(),
            timeout: timeout(),
            writeq_high_water: writeq_high_water(),
            writeq_low_water: writeq_low_water(),
        }
    }
}

// trait definitions
pub trait WorkerConfig {
    fn worker(&self) -> &Worker;
}
