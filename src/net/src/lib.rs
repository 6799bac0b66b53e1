// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Thin non-blocking wrappers over mio sockets. A `Stream` unifies plaintext
//! TCP, unix domain and TLS streams so connection handling code is agnostic
//! to the transport. Listener sockets support cloned shared descriptors and
//! per-thread SO_REUSEPORT binding.

pub use mio::*;

pub mod event {
    pub use mio::event::*;
}

mod listener;
mod stream;
mod tcp;
mod tls;
mod unix;

pub use listener::ListenSocket;
pub use stream::Stream;
pub use tcp::{TcpListener, TcpStream};
pub use tls::{TlsTcpAcceptor, TlsTcpAcceptorBuilder, TlsTcpConnector, TlsTcpStream};
pub use unix::{UnixListener, UnixStream};

type Result<T> = std::io::Result<T>;
