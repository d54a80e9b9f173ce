//! Connection server
//!
//! Accepts handed-off sockets, counts each one as in-flight work and runs a
//! [`ConnectionWorker`] per socket on its own task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::shutdown::{InFlight, ShutdownCoordinator};
use crate::socket::{HandoffSocket, SocketGuard};
use crate::timer::ticker;
use crate::worker::{ConnectionWorker, DaemonLauncher, Launcher};

/// Unique connection identifier, used to correlate log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a ConnectionId from a raw value (mainly for testing)
    #[cfg(test)]
    pub fn new(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is shutting down, rejected connection from {remote_addr}")]
    ShuttingDown { remote_addr: String },
}

/// Runs one worker per handed-off socket
///
/// Shared by `Arc` between the upgrade handler and the supervisor.
pub struct ConnectionServer<L = DaemonLauncher> {
    coordinator: ShutdownCoordinator,
    launcher: Arc<L>,
    /// Fired on a forced shutdown; every worker kills its daemon
    kill_switch: CancellationToken,
    next_id: AtomicU64,
}

impl<L: Launcher> ConnectionServer<L> {
    pub fn new(launcher: L) -> Self {
        Self {
            coordinator: ShutdownCoordinator::new(),
            launcher: Arc::new(launcher),
            kill_switch: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Whether new connections are still admitted
    pub fn is_accepting(&self) -> bool {
        !self.coordinator.is_closing()
    }

    /// Number of connections (and pending handoffs) not yet finished
    pub fn in_flight(&self) -> usize {
        self.coordinator.in_flight()
    }

    /// Count a connection that is about to be handed off
    ///
    /// Returns `None` once shutdown has begun. The reservation keeps the
    /// drain waiting until it is passed to
    /// [`accept_reserved`](Self::accept_reserved) or dropped.
    pub fn try_reserve(&self) -> Option<InFlight> {
        self.coordinator.try_register()
    }

    /// Take ownership of a socket and start a worker for it
    ///
    /// Returns immediately. After [`shutdown`](Self::shutdown) has begun the
    /// socket is closed and rejected.
    pub fn accept_socket(
        &self,
        socket: Box<dyn HandoffSocket>,
    ) -> Result<ConnectionId, ServerError> {
        let socket = SocketGuard::new(socket);

        match self.try_reserve() {
            Some(reservation) => Ok(self.accept_reserved(socket, reservation)),
            None => {
                let remote_addr = socket.remote_addr().to_string();
                warn!(remote_addr = %remote_addr, "Server closing, rejecting connection");
                socket.close();
                Err(ServerError::ShuttingDown { remote_addr })
            }
        }
    }

    /// Start a worker for a socket whose in-flight unit is already counted
    pub fn accept_reserved(&self, socket: SocketGuard, reservation: InFlight) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(conn = %id, remote_addr = %socket.remote_addr(), "Connection accepted");

        let worker = ConnectionWorker::new(
            id,
            socket,
            Arc::clone(&self.launcher),
            self.kill_switch.child_token(),
        );

        tokio::spawn(async move {
            // Dropped after the worker has closed its socket.
            let _reservation = reservation;
            let _ = worker.run().await;
        });

        id
    }

    /// Stop admitting connections and wait for every worker to finish
    ///
    /// Never kills daemons and has no deadline of its own.
    pub async fn shutdown(&self) {
        info!(in_flight = self.in_flight(), "Connection server shutting down");
        self.coordinator.close_and_wait().await;
        info!("Connection server drained");
    }

    /// Wait for running workers without closing the gate
    pub async fn wait_drained(&self) {
        self.coordinator.wait_for_drain().await;
    }

    /// Kill every running daemon
    pub fn terminate(&self) {
        warn!(in_flight = self.in_flight(), "Terminating running daemons");
        self.kill_switch.cancel();
    }

    /// Periodically log the number of live connections
    ///
    /// The reporter runs as background work on `background` and stops when
    /// that coordinator closes.
    pub fn report_status(&self, every: Duration, background: &ShutdownCoordinator) {
        let mut ticks = ticker("status", every, every, background);
        let coordinator = self.coordinator.clone();

        tokio::spawn(async move {
            while ticks.recv().await.is_some() {
                info!(
                    in_flight = coordinator.in_flight(),
                    accepting = !coordinator.is_closing(),
                    "Status"
                );
            }
        });
    }
}
