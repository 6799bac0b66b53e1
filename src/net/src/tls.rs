// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

pub use boring::ssl::{ShutdownResult, SslVerifyMode};

use boring::ssl::{ErrorCode, Ssl, SslContext, SslFiletype, SslMethod, SslStream};
use foreign_types_shared::{ForeignType, ForeignTypeRef};

use crate::event::Source;
use crate::*;
use std::io::{Error, ErrorKind, Read, Write};
use std::os::unix::prelude::AsRawFd;

#[derive(PartialEq)]
enum TlsState {
    Handshaking,
    Negotiated,
}

/// Wraps a TLS/SSL stream so that negotiated and handshaking sessions have a
/// uniform type. The wants flags report which readiness direction the last
/// stalled handshake step was waiting on.
pub struct TlsTcpStream {
    inner: SslStream<TcpStream>,
    state: TlsState,
    wants_read: bool,
    wants_write: bool,
}

impl AsRawFd for TlsTcpStream {
    fn as_raw_fd(&self) -> i32 {
        self.inner.get_ref().as_raw_fd()
    }
}

impl TlsTcpStream {
    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        self.inner.get_mut().set_nodelay(nodelay)
    }

    pub fn is_handshaking(&self) -> bool {
        self.state == TlsState::Handshaking
    }

    pub fn wants_read(&self) -> bool {
        self.wants_read
    }

    pub fn wants_write(&self) -> bool {
        self.wants_write
    }

    pub fn interest(&self) -> Interest {
        if self.is_handshaking() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        }
    }

    /// Attempts to drive the TLS/SSL handshake to completion. An `Ok` result
    /// indicates that the handshake is complete. An error of `WouldBlock`
    /// indicates that the handshake may complete in the future; check the
    /// wants flags for the direction to wait on. Other errors are terminal
    /// and the connection should be closed.
    pub fn do_handshake(&mut self) -> Result<()> {
        if !self.is_handshaking() {
            return Ok(());
        }

        let ptr = self.inner.ssl().as_ptr();
        let ret = unsafe { boring_sys::SSL_do_handshake(ptr) };
        if ret > 0 {
            self.state = TlsState::Negotiated;
            self.wants_read = false;
            self.wants_write = false;
            Ok(())
        } else {
            let code = unsafe { ErrorCode::from_raw(boring_sys::SSL_get_error(ptr, ret)) };
            match code {
                ErrorCode::WANT_READ => {
                    self.wants_read = true;
                    self.wants_write = false;
                    Err(Error::from(ErrorKind::WouldBlock))
                }
                ErrorCode::WANT_WRITE => {
                    self.wants_read = false;
                    self.wants_write = true;
                    Err(Error::new(ErrorKind::WouldBlock, "handshake wants write"))
                }
                _ => Err(Error::new(ErrorKind::Other, "handshake failed")),
            }
        }
    }

    /// Send a TLS close-notify. Best effort; a `WouldBlock` from the
    /// transport is reported so the caller may retry.
    pub fn shutdown(&mut self) -> Result<ShutdownResult> {
        self.inner
            .shutdown()
            .map_err(|e| match e.into_io_error() {
                Ok(io) => io,
                Err(other) => Error::new(ErrorKind::Other, other.to_string()),
            })
    }

    pub fn get_ref(&self) -> &TcpStream {
        self.inner.get_ref()
    }
}

impl std::fmt::Debug for TlsTcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.inner.get_ref())
    }
}

impl Read for TlsTcpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.is_handshaking() {
            Err(Error::new(
                ErrorKind::WouldBlock,
                "read on handshaking session would block",
            ))
        } else {
            self.inner.read(buf)
        }
    }
}

impl Write for TlsTcpStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.is_handshaking() {
            Err(Error::new(
                ErrorKind::WouldBlock,
                "write on handshaking session would block",
            ))
        } else {
            self.inner.write(buf)
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.is_handshaking() {
            Err(Error::new(
                ErrorKind::WouldBlock,
                "flush on handshaking session would block",
            ))
        } else {
            self.inner.flush()
        }
    }
}

impl event::Source for TlsTcpStream {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.inner.get_mut().register(registry, token, interest)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.inner.get_mut().reregister(registry, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        self.inner.get_mut().deregister(registry)
    }
}

/// Provides a wrapped acceptor for server-side TLS. Accept never blocks;
/// streams come back in the handshaking state when negotiation is pending.
pub struct TlsTcpAcceptor {
    inner: SslContext,
}

impl TlsTcpAcceptor {
    pub fn mozilla_intermediate_v5() -> Result<TlsTcpAcceptorBuilder> {
        let inner = boring::ssl::SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
            .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;

        Ok(TlsTcpAcceptorBuilder {
            inner,
            ca_file: None,
            certificate_file: None,
            certificate_chain_file: None,
            private_key_file: None,
        })
    }

    pub fn accept(&self, stream: TcpStream) -> Result<TlsTcpStream> {
        let ssl = Ssl::new(&self.inner)?;

        let stream = unsafe { SslStream::from_raw_parts(ssl.into_ptr(), stream) };

        let ret = unsafe { boring_sys::SSL_accept(stream.ssl().as_ptr()) };

        if ret > 0 {
            Ok(TlsTcpStream {
                inner: stream,
                state: TlsState::Negotiated,
                wants_read: false,
                wants_write: false,
            })
        } else {
            let code =
                unsafe { ErrorCode::from_raw(boring_sys::SSL_get_error(stream.ssl().as_ptr(), ret)) };
            match code {
                ErrorCode::WANT_READ => Ok(TlsTcpStream {
                    inner: stream,
                    state: TlsState::Handshaking,
                    wants_read: true,
                    wants_write: false,
                }),
                ErrorCode::WANT_WRITE => Ok(TlsTcpStream {
                    inner: stream,
                    state: TlsState::Handshaking,
                    wants_read: false,
                    wants_write: true,
                }),
                _ => Err(Error::new(ErrorKind::Other, "handshake failed")),
            }
        }
    }
}

/// Builder for a `TlsTcpAcceptor` with improved ergonomics over the raw
/// `boring` builder: all inputs are file paths and may be set in any order.
pub struct TlsTcpAcceptorBuilder {
    inner: boring::ssl::SslAcceptorBuilder,
    ca_file: Option<String>,
    certificate_file: Option<String>,
    certificate_chain_file: Option<String>,
    private_key_file: Option<String>,
}

impl TlsTcpAcceptorBuilder {
    pub fn build(mut self) -> Result<TlsTcpAcceptor> {
        if let Some(f) = self.private_key_file {
            self.inner
                .set_private_key_file(f, SslFiletype::PEM)
                .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;
        } else {
            return Err(Error::new(ErrorKind::Other, "no private key file provided"));
        }

        if let Some(f) = self.ca_file {
            self.inner
                .set_ca_file(f)
                .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;
        }

        if let Some(f) = self.certificate_file {
            self.inner
                .set_certificate_file(f, SslFiletype::PEM)
                .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;
        }

        if let Some(f) = self.certificate_chain_file {
            self.inner
                .set_certificate_chain_file(f)
                .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;
        }

        Ok(TlsTcpAcceptor {
            inner: self.inner.build().into_context(),
        })
    }

    pub fn private_key_file(mut self, file: String) -> Self {
        self.private_key_file = Some(file);
        self
    }

    pub fn certificate_file(mut self, file: String) -> Self {
        self.certificate_file = Some(file);
        self
    }

    pub fn certificate_chain_file(mut self, file: String) -> Self {
        self.certificate_chain_file = Some(file);
        self
    }

    pub fn ca_file(mut self, file: String) -> Self {
        self.ca_file = Some(file);
        self
    }
}

/// Client-side TLS for backend connections. Returns our wrapped stream type
/// so negotiated and handshaking streams share a uniform type.
pub struct TlsTcpConnector {
    inner: boring::ssl::SslConnector,
}

impl TlsTcpConnector {
    pub fn new() -> Result<Self> {
        let builder = boring::ssl::SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;

        Ok(Self {
            inner: builder.build(),
        })
    }

    pub fn connect(&self, domain: &str, stream: TcpStream) -> Result<TlsTcpStream> {
        let ssl = self
            .inner
            .configure()
            .and_then(|c| c.into_ssl(domain))
            .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;

        let stream = unsafe { SslStream::from_raw_parts(ssl.into_ptr(), stream) };

        let ret = unsafe { boring_sys::SSL_connect(stream.ssl().as_ptr()) };

        if ret > 0 {
            Ok(TlsTcpStream {
                inner: stream,
                state: TlsState::Negotiated,
                wants_read: false,
                wants_write: false,
            })
        } else {
            let code =
                unsafe { ErrorCode::from_raw(boring_sys::SSL_get_error(stream.ssl().as_ptr(), ret)) };
            match code {
                ErrorCode::WANT_READ => Ok(TlsTcpStream {
                    inner: stream,
                    state: TlsState::Handshaking,
                    wants_read: true,
                    wants_write: false,
                }),
                ErrorCode::WANT_WRITE => Ok(TlsTcpStream {
                    inner: stream,
                    state: TlsState::Handshaking,
                    wants_read: false,
                    wants_write: true,
                }),
                _ => Err(Error::new(ErrorKind::Other, "ssl handshake failure")),
            }
        }
    }
}
