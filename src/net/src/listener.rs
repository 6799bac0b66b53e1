// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::event::Source;
use crate::*;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;

/// A bound accept socket. Wraps the transport variants so that accept always
/// yields a `Stream` plus the numeric peer address. TLS negotiation, when
/// configured, is started at accept time and completed by the owner of the
/// stream.
pub struct ListenSocket {
    inner: ListenSocketType,
}

enum ListenSocketType {
    Plain(TcpListener),
    Tls((TcpListener, Arc<TlsTcpAcceptor>)),
    Unix(UnixListener),
}

impl From<TcpListener> for ListenSocket {
    fn from(other: TcpListener) -> Self {
        Self {
            inner: ListenSocketType::Plain(other),
        }
    }
}

impl From<(TcpListener, Arc<TlsTcpAcceptor>)> for ListenSocket {
    fn from(other: (TcpListener, Arc<TlsTcpAcceptor>)) -> Self {
        Self {
            inner: ListenSocketType::Tls(other),
        }
    }
}

impl From<UnixListener> for ListenSocket {
    fn from(other: UnixListener) -> Self {
        Self {
            inner: ListenSocketType::Unix(other),
        }
    }
}

impl ListenSocket {
    /// Accepts a new `Stream`.
    ///
    /// An error `e` with `e.kind()` of `ErrorKind::WouldBlock` indicates that
    /// the operation should be retried again in the future. All other errors
    /// should be treated as failures.
    pub fn accept(&self) -> Result<(Stream, String)> {
        match &self.inner {
            ListenSocketType::Plain(listener) => {
                let (stream, addr) = listener.accept()?;
                Ok((Stream::from(stream), addr.ip().to_string()))
            }
            ListenSocketType::Tls((listener, acceptor)) => {
                let (stream, addr) = listener.accept()?;
                let stream = acceptor.accept(stream)?;
                Ok((Stream::from(stream), addr.ip().to_string()))
            }
            ListenSocketType::Unix(listener) => {
                let (stream, remote) = listener.accept()?;
                Ok((Stream::from(stream), remote))
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            ListenSocketType::Plain(listener) => listener.local_addr(),
            ListenSocketType::Tls((listener, _)) => listener.local_addr(),
            ListenSocketType::Unix(_) => {
                Err(Error::new(ErrorKind::Other, "unix socket has no inet addr"))
            }
        }
    }

    /// Duplicate the underlying descriptor, preserving the TLS configuration.
    pub fn try_clone(&self) -> Result<ListenSocket> {
        let inner = match &self.inner {
            ListenSocketType::Plain(listener) => ListenSocketType::Plain(listener.try_clone()?),
            ListenSocketType::Tls((listener, acceptor)) => {
                ListenSocketType::Tls((listener.try_clone()?, acceptor.clone()))
            }
            ListenSocketType::Unix(listener) => ListenSocketType::Unix(listener.try_clone()?),
        };
        Ok(Self { inner })
    }
}

impl event::Source for ListenSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> Result<()> {
        match &mut self.inner {
            ListenSocketType::Plain(listener) => listener.register(registry, token, interests),
            ListenSocketType::Tls((listener, _)) => listener.register(registry, token, interests),
            ListenSocketType::Unix(listener) => listener.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> Result<()> {
        match &mut self.inner {
            ListenSocketType::Plain(listener) => listener.reregister(registry, token, interests),
            ListenSocketType::Tls((listener, _)) => listener.reregister(registry, token, interests),
            ListenSocketType::Unix(listener) => listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        match &mut self.inner {
            ListenSocketType::Plain(listener) => listener.deregister(registry),
            ListenSocketType::Tls((listener, _)) => listener.deregister(registry),
            ListenSocketType::Unix(listener) => listener.deregister(registry),
        }
    }
}
