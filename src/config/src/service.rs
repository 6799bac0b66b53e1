// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const MAX_CONNECTIONS: usize = 0;

// helper functions
fn max_connections() -> usize {
    MAX_CONNECTIONS
}

/// A backend destination a service may route to.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Target {
    name: String,
    address: String,
}

impl Target {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

// definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct Service {
    name: String,
    router: String,
    #[serde(default = "max_connections")]
    max_connections: usize,
    /// Overrides the process-wide retention depth when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    retain_last_statements: Option<u32>,
    #[serde(default, rename = "target")]
    targets: Vec<Target>,
}

// implementation
impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &str {
        &self.router
    }

    /// Connection limit for the service; zero means unlimited.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn retain_last_statements(&self) -> Option<u32> {
        self.retain_last_statements
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }
}

// trait definitions
pub trait ServiceConfig {
    fn services(&self) -> &[Service];
}
