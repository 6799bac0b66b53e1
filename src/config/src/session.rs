// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const RETAIN_LAST_STATEMENTS: u32 = 0;
const SESSION_TRACE: u32 = 0;
const IDLE_TIMEOUT: u64 = 0;

// helper functions
fn retain_last_statements() -> u32 {
    RETAIN_LAST_STATEMENTS
}

fn session_trace() -> u32 {
    SESSION_TRACE
}

fn idle_timeout() -> u64 {
    IDLE_TIMEOUT
}

/// When to dump the retained statements of a session through the logger.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DumpStatements {
    Never,
    OnClose,
    OnError,
}

impl Default for DumpStatements {
    fn default() -> Self {
        Self::Never
    }
}

impl std::fmt::Display for DumpStatements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::OnClose => write!(f, "on_close"),
            Self::OnError => write!(f, "on_error"),
        }
    }
}

// definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct Session {
    #[serde(default = "retain_last_statements")]
    retain_last_statements: u32,
    #[serde(default)]
    dump_statements: DumpStatements,
    #[serde(default = "session_trace")]
    session_trace: u32,
    #[serde(default = "idle_timeout")]
    idle_timeout: u64,
}

// implementation
impl Session {
    /// Depth of the per-session query ring; zero disables query retention.
    pub fn retain_last_statements(&self) -> u32 {
        self.retain_last_statements
    }

    pub fn dump_statements(&self) -> DumpStatements {
        self.dump_statements
    }

    /// Depth of the per-session trace log ring; zero disables tracing.
    pub fn session_trace(&self) -> u32 {
        self.session_trace
    }

    /// Idle limit for client connections in seconds; zero disables the
    /// timeout sweep.
    pub fn idle_timeout(&self) -> u64 {
        self.idle_timeout
    }
}

// trait implementations
impl Default for Session {
    fn default() -> Self {
        Self {
            retain_last_statements: retain_last_statements(),
            dump_statements: DumpStatements::default(),
            session_trace: session_trace(),
            idle_timeout: idle_timeout(),
        }
    }
}

// trait definitions
pub trait SessionConfig {
    fn session(&self) -> &Session;
}
