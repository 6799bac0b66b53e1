// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::event::Source;
use crate::*;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::prelude::{AsRawFd, FromRawFd};
use std::path::Path;

pub struct UnixStream {
    inner: mio::net::UnixStream,
}

impl UnixStream {
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.inner.shutdown(how)
    }
}

impl std::fmt::Debug for UnixStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.inner)
    }
}

impl Read for UnixStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for UnixStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

impl event::Source for UnixStream {
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

pub struct UnixListener {
    inner: mio::net::UnixListener,
}

impl UnixListener {
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<UnixListener> {
        Ok(Self {
            inner: mio::net::UnixListener::bind(path)?,
        })
    }

    pub fn try_clone(&self) -> Result<UnixListener> {
        let fd = unsafe { libc::dup(self.inner.as_raw_fd()) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
        listener.set_nonblocking(true)?;

        Ok(Self {
            inner: mio::net::UnixListener::from_std(listener),
        })
    }

    pub fn accept(&self) -> Result<(UnixStream, String)> {
        self.inner.accept().map(|(stream, addr)| {
            let remote = addr
                .as_pathname()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "localhost".to_string());
            (UnixStream { inner: stream }, remote)
        })
    }
}

impl AsRawFd for UnixListener {
    fn as_raw_fd(&self) -> i32 {
        self.inner.as_raw_fd()
    }
}

impl event::Source for UnixListener {
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
