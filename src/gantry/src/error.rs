// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use thiserror::Error;

/// Error kinds surfaced by the core. I/O errors are absorbed at the DCB
/// layer and re-surface as hangup events; router errors propagate to
/// session termination.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A would-block-like condition; recovered by re-arming readiness.
    #[error("operation would block")]
    TransientIo,

    /// The peer ended the stream.
    #[error("peer closed connection")]
    PeerClose,

    /// Malformed message from a peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS handshake or record failure; terminal for the connection.
    #[error("tls error: {0}")]
    Tls(String),

    /// Allocation or descriptor exhaustion; the request is rejected but the
    /// session survives.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Returned from a router or filter; the router decides whether the
    /// session can continue.
    #[error("router error: {0}")]
    Router(String),

    /// Invariant violation. Logged and the session terminated; never
    /// unwinds the worker loop.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock => CoreError::TransientIo,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => CoreError::PeerClose,
            std::io::ErrorKind::OutOfMemory => {
                CoreError::ResourceExhaustion(e.to_string())
            }
            _ => CoreError::Internal(e.to_string()),
        }
    }
}

impl CoreError {
    /// True when the condition clears on the next readiness event.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientIo)
    }
}
