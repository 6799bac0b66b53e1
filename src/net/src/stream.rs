// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::event::Source;
use crate::*;
use std::io::{Read, Write};
use std::net::Shutdown;

/// A wrapper type that unifies types which represent a stream. Plaintext TCP,
/// unix domain sockets and TLS/SSL over TCP can all be wrapped by this type.
/// This allows dynamic behaviors at runtime, such as enabling TLS/SSL through
/// configuration.
pub struct Stream {
    inner: StreamType,
}

/// Provides concrete types for stream variants. Since the number of variants
/// is expected to be small, dispatch through enum variants should be more
/// efficient than using a trait for dynamic dispatch.
enum StreamType {
    Tcp(TcpStream),
    Unix(UnixStream),
    TlsTcp(TlsTcpStream),
}

impl Stream {
    pub fn interest(&self) -> Interest {
        match &self.inner {
            StreamType::Tcp(s) => {
                if !s.is_established() {
                    Interest::READABLE.add(Interest::WRITABLE)
                } else {
                    Interest::READABLE
                }
            }
            StreamType::Unix(_) => Interest::READABLE,
            StreamType::TlsTcp(s) => s.interest(),
        }
    }

    pub fn is_established(&self) -> bool {
        match &self.inner {
            StreamType::Tcp(s) => s.is_established(),
            StreamType::Unix(_) => true,
            StreamType::TlsTcp(s) => !s.is_handshaking(),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        match &self.inner {
            StreamType::Tcp(_) | StreamType::Unix(_) => false,
            StreamType::TlsTcp(s) => s.is_handshaking(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.inner, StreamType::TlsTcp(_))
    }

    pub fn do_handshake(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(_) | StreamType::Unix(_) => Ok(()),
            StreamType::TlsTcp(s) => s.do_handshake(),
        }
    }

    /// Readiness direction the last stalled TLS operation was waiting on.
    /// Always `(false, false)` for plaintext streams.
    pub fn tls_wants(&self) -> (bool, bool) {
        match &self.inner {
            StreamType::Tcp(_) | StreamType::Unix(_) => (false, false),
            StreamType::TlsTcp(s) => (s.wants_read(), s.wants_write()),
        }
    }

    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.set_nodelay(nodelay),
            StreamType::Unix(_) => Ok(()),
            StreamType::TlsTcp(s) => s.set_nodelay(nodelay),
        }
    }

    /// Graceful shutdown of the write half. For TLS streams a close-notify is
    /// sent before the transport is shut down.
    pub fn shutdown(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.shutdown(Shutdown::Write),
            StreamType::Unix(s) => s.shutdown(Shutdown::Write),
            StreamType::TlsTcp(s) => {
                let _ = s.shutdown();
                s.get_ref().shutdown(Shutdown::Write)
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            StreamType::Tcp(s) => write!(f, "{:?}", s),
            StreamType::Unix(s) => write!(f, "{:?}", s),
            StreamType::TlsTcp(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<TcpStream> for Stream {
    fn from(other: TcpStream) -> Self {
        Self {
            inner: StreamType::Tcp(other),
        }
    }
}

impl From<UnixStream> for Stream {
    fn from(other: UnixStream) -> Self {
        Self {
            inner: StreamType::Unix(other),
        }
    }
}

impl From<TlsTcpStream> for Stream {
    fn from(other: TlsTcpStream) -> Self {
        Self {
            inner: StreamType::TlsTcp(other),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.read(buf),
            StreamType::Unix(s) => s.read(buf),
            StreamType::TlsTcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.write(buf),
            StreamType::Unix(s) => s.write(buf),
            StreamType::TlsTcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.flush(),
            StreamType::Unix(s) => s.flush(),
            StreamType::TlsTcp(s) => s.flush(),
        }
    }
}

impl event::Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.register(registry, token, interest),
            StreamType::Unix(s) => s.register(registry, token, interest),
            StreamType::TlsTcp(s) => s.register(registry, token, interest),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.reregister(registry, token, interest),
            StreamType::Unix(s) => s.reregister(registry, token, interest),
            StreamType::TlsTcp(s) => s.reregister(registry, token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.deregister(registry),
            StreamType::Unix(s) => s.deregister(registry),
            StreamType::TlsTcp(s) => s.deregister(registry),
        }
    }
}
