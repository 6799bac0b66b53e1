// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::event::Source;
use crate::*;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::prelude::{AsRawFd, FromRawFd};

pub use std::net::Shutdown;

pub struct TcpStream {
    inner: mio::net::TcpStream,
}

impl TcpStream {
    /// Begin a non-blocking connect. The stream is established once the
    /// socket becomes writable and `is_established` returns true.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let inner = mio::net::TcpStream::connect(addr)?;

        Ok(Self { inner })
    }

    pub fn is_established(&self) -> bool {
        self.inner.peer_addr().is_ok()
    }

    pub fn from_std(stream: std::net::TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            inner: mio::net::TcpStream::from_std(stream),
        })
    }

    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.inner.shutdown(how)
    }
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.inner)
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> i32 {
        self.inner.as_raw_fd()
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

impl event::Source for TcpStream {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.inner.register(registry, token, interest)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.inner.reregister(registry, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        self.inner.deregister(registry)
    }
}

pub struct TcpListener {
    inner: mio::net::TcpListener,
}

impl TcpListener {
    pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
        // we create from a std TcpListener so SO_REUSEADDR is not set for us
        let listener = std::net::TcpListener::bind(addr)?;
        // this means we need to set non-blocking ourselves
        listener.set_nonblocking(true)?;

        Ok(Self {
            inner: mio::net::TcpListener::from_std(listener),
        })
    }

    /// Bind with SO_REUSEPORT so that every worker thread may own its own
    /// listening socket on the same address.
    pub fn bind_reuseport(addr: SocketAddr) -> Result<TcpListener> {
        let domain = match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket = socket2::Socket::new(
            domain,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let listener: std::net::TcpListener = socket.into();

        Ok(Self {
            inner: mio::net::TcpListener::from_std(listener),
        })
    }

    /// Duplicate the listening descriptor so another worker can add the same
    /// socket to its own readiness set.
    pub fn try_clone(&self) -> Result<TcpListener> {
        let fd = unsafe { libc::dup(self.inner.as_raw_fd()) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        listener.set_nonblocking(true)?;

        Ok(Self {
            inner: mio::net::TcpListener::from_std(listener),
        })
    }

    pub fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        self.inner
            .accept()
            .map(|(stream, addr)| (TcpStream { inner: stream }, addr))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> i32 {
        self.inner.as_raw_fd()
    }
}

impl event::Source for TcpListener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        self.inner.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ephemeral() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).expect("failed to bind");
        assert!(listener.local_addr().unwrap().port() != 0);
    }

    #[test]
    fn reuseport_pair() {
        let a = TcpListener::bind_reuseport("127.0.0.1:0".parse().unwrap()).expect("bind a");
        let addr = a.local_addr().unwrap();
        let _b = TcpListener::bind_reuseport(addr).expect("bind b on same address");
    }

    #[test]
    fn clone_shares_address() {
        let a = TcpListener::bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        let b = a.try_clone().expect("clone");
        assert_eq!(a.local_addr().unwrap(), b.local_addr().unwrap());
    }
}
