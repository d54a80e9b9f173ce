//! Raw sockets taken over from the HTTP layer
//!
//! A socket is owned by exactly one party at a time: the HTTP layer, then the
//! upgrade handler, then one connection worker. [`SocketGuard`] closes it
//! exactly once, whichever way its owner exits.

use std::io;
use std::net::TcpStream;
use std::os::fd::{IntoRawFd, OwnedFd};
use std::process::Stdio;

use tracing::{debug, warn};

use crate::worker::WorkerError;

/// A bidirectional byte stream detached from the HTTP layer
pub trait HandoffSocket: Send + 'static {
    /// Remote address, used as a log correlation tag
    fn remote_addr(&self) -> String;

    /// Standard input for the daemon serving this connection
    ///
    /// Fails with [`WorkerError::NotStream`] when the socket is not a raw
    /// TCP stream the child process can use directly.
    fn child_stdin(&self) -> Result<Stdio, WorkerError>;

    /// Close the socket
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// A hijacked TCP connection
#[derive(Debug)]
pub struct TcpSocket {
    stream: TcpStream,
    remote_addr: String,
}

impl TcpSocket {
    /// Take a socket away from the tokio reactor
    ///
    /// The descriptor is switched back to blocking mode since the daemon
    /// expects an ordinary blocking stdin.
    pub fn from_tokio(stream: tokio::net::TcpStream) -> io::Result<Self> {
        Self::from_std(stream.into_std()?)
    }

    pub fn from_std(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        let remote_addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".into());
        Ok(Self {
            stream,
            remote_addr,
        })
    }
}

impl HandoffSocket for TcpSocket {
    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn child_stdin(&self) -> Result<Stdio, WorkerError> {
        let dup = self.stream.try_clone().map_err(WorkerError::Descriptor)?;
        Ok(Stdio::from(OwnedFd::from(dup)))
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let fd = self.stream.into_raw_fd();
        // SAFETY: `into_raw_fd` released ownership of `fd` to us and nothing
        // else refers to it; it is closed exactly once here.
        if unsafe { libc::close(fd) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Owns a handed-off socket and closes it exactly once
///
/// Closing happens on [`close`](Self::close) or, failing that, on drop, so
/// early returns and panics release the socket too. Close failures are
/// logged, never propagated.
pub struct SocketGuard {
    socket: Option<Box<dyn HandoffSocket>>,
    remote_addr: String,
}

impl SocketGuard {
    pub fn new(socket: Box<dyn HandoffSocket>) -> Self {
        let remote_addr = socket.remote_addr();
        Self {
            socket: Some(socket),
            remote_addr,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// See [`HandoffSocket::child_stdin`]
    pub fn child_stdin(&self) -> Result<Stdio, WorkerError> {
        match &self.socket {
            Some(socket) => socket.child_stdin(),
            None => Err(WorkerError::Descriptor(io::ErrorKind::NotConnected.into())),
        }
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };

        match socket.close() {
            Ok(()) => debug!(remote_addr = %self.remote_addr, "Socket closed"),
            Err(e) => warn!(
                remote_addr = %self.remote_addr,
                error = %e,
                "Failed to close socket"
            ),
        }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SocketGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketGuard")
            .field("remote_addr", &self.remote_addr)
            .field("open", &self.socket.is_some())
            .finish()
    }
}
