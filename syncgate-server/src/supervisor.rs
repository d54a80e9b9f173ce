//! Process-level shutdown
//!
//! Waits for SIGTERM or SIGINT, then stops the HTTP listener, closes
//! background work and drains the connection server, all under one deadline.
//! When the deadline passes, running daemons are killed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::server::ConnectionServer;
use crate::shutdown::ShutdownCoordinator;
use crate::worker::{DaemonLauncher, Launcher};

/// Process exit code when the shutdown deadline passed
pub const FORCED_SHUTDOWN_EXIT_CODE: i32 = 254;

/// How long killed daemons get to be reaped
const KILL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Everything drained before the deadline
    Complete,
    /// The deadline passed and daemons were killed
    Forced,
}

impl ShutdownOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Forced => FORCED_SHUTDOWN_EXIT_CODE,
        }
    }
}

/// SIGTERM and SIGINT listeners
pub struct Signals {
    sigterm: Signal,
    sigint: Signal,
}

impl Signals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

/// Runs the shutdown sequence
pub struct Supervisor<L = DaemonLauncher> {
    server: Arc<ConnectionServer<L>>,
    http_shutdown: CancellationToken,
    background: ShutdownCoordinator,
    deadline: Duration,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(
        server: Arc<ConnectionServer<L>>,
        http_shutdown: CancellationToken,
        background: ShutdownCoordinator,
        deadline: Duration,
    ) -> Self {
        Self {
            server,
            http_shutdown,
            background,
            deadline,
        }
    }

    /// Stop everything, killing daemons if the deadline passes
    ///
    /// `http` is the listener task started with `http_shutdown`.
    pub async fn shutdown(&self, http: JoinHandle<()>) -> ShutdownOutcome {
        info!(
            deadline = ?self.deadline,
            in_flight = self.server.in_flight(),
            "Shutting down"
        );

        let drain = async {
            self.http_shutdown.cancel();
            if let Err(e) = http.await {
                warn!(error = %e, "HTTP listener task failed");
            }
            self.background.close_not_wait();
            self.server.shutdown().await;
        };

        if timeout(self.deadline, drain).await.is_ok() {
            info!("Shutdown complete");
            return ShutdownOutcome::Complete;
        }

        error!(
            in_flight = self.server.in_flight(),
            "Shutdown deadline passed, forcing"
        );
        self.server.terminate();
        if timeout(KILL_GRACE, self.server.wait_drained()).await.is_err() {
            warn!(
                in_flight = self.server.in_flight(),
                "Workers still running after kill"
            );
        }
        ShutdownOutcome::Forced
    }
}
