//! Connection workers
//!
//! A [`ConnectionWorker`] owns one handed-off socket for the rest of the
//! connection's life. It starts the daemon with the socket as standard input,
//! waits for it, classifies how it exited, and closes the socket.

use std::future::Future;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::server::ConnectionId;
use crate::socket::SocketGuard;

/// Exit code the daemon uses when the client ended the session
pub const CLIENT_TERMINATED_EXIT_CODE: i32 = 255;

/// How the daemon process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit code 0
    Completed,
    /// Exit code 255: the client went away; not an error on our side
    ClientTerminated,
    /// Any other non-zero exit code
    Failed { code: i32 },
    /// Terminated by a signal (including a forced shutdown)
    Signaled { signal: i32 },
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => Self::Completed,
            Some(CLIENT_TERMINATED_EXIT_CODE) => Self::ClientTerminated,
            Some(code) => Self::Failed { code },
            None => Self::Signaled {
                signal: status.signal().unwrap_or_default(),
            },
        }
    }

    /// Whether the outcome points at a problem on the server side
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Signaled { .. })
    }
}

/// Reasons a worker could not serve its connection
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The socket is not a raw TCP stream, e.g. a TLS-terminated upgrade.
    /// Points at a deployment mismatch (no raw TCP passthrough upstream).
    #[error("connection from {remote_addr} is not a stream-oriented TCP socket ({kind})")]
    NotStream {
        remote_addr: String,
        kind: &'static str,
    },

    #[error("unable to hand the socket to the daemon: {0}")]
    Descriptor(#[source] io::Error),

    #[error("unable to start {program}: {source}")]
    Launch { program: String, source: io::Error },

    #[error("lost track of the daemon process: {0}")]
    Wait(#[source] io::Error),
}

/// Starts the process that serves a connection
///
/// The returned future resolves when the process exits. When `kill` fires,
/// the process must be terminated rather than awaited.
pub trait Launcher: Send + Sync + 'static {
    fn launch(
        &self,
        stdin: Stdio,
        kill: CancellationToken,
    ) -> impl Future<Output = Result<ExitStatus, WorkerError>> + Send;
}

/// Launches the configured daemon command line
#[derive(Debug, Clone)]
pub struct DaemonLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl DaemonLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(&config.program, config.args.clone())
    }
}

impl Launcher for DaemonLauncher {
    async fn launch(
        &self,
        stdin: Stdio,
        kill: CancellationToken,
    ) -> Result<ExitStatus, WorkerError> {
        // The Command (and its copy of the socket) is dropped right after
        // spawning, leaving the child as the only holder of the duplicate.
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(stdin)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Launch {
                program: self.program.display().to_string(),
                source,
            })?;

        debug!(pid = ?child.id(), program = %self.program.display(), "Daemon started");

        tokio::select! {
            status = child.wait() => return status.map_err(WorkerError::Wait),
            _ = kill.cancelled() => {}
        }

        warn!(pid = ?child.id(), "Killing daemon on forced shutdown");
        child.kill().await.map_err(WorkerError::Wait)?;
        child.wait().await.map_err(WorkerError::Wait)
    }
}

/// Serves one handed-off connection
pub struct ConnectionWorker<L> {
    id: ConnectionId,
    socket: SocketGuard,
    launcher: Arc<L>,
    kill: CancellationToken,
}

impl<L: Launcher> ConnectionWorker<L> {
    pub fn new(
        id: ConnectionId,
        socket: SocketGuard,
        launcher: Arc<L>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            id,
            socket,
            launcher,
            kill,
        }
    }

    /// Run the daemon to completion, then close the socket
    ///
    /// The outcome is logged here; the return value is for callers that want
    /// to act on it.
    pub async fn run(self) -> Result<ExitOutcome, WorkerError> {
        let Self {
            id,
            socket,
            launcher,
            kill,
        } = self;

        let started = Instant::now();
        debug!(conn = %id, remote_addr = %socket.remote_addr(), "Worker starting");

        let stdin = socket.child_stdin();
        let result = match stdin {
            Ok(stdin) => launcher
                .launch(stdin, kill)
                .await
                .map(ExitOutcome::from_status),
            Err(e) => Err(e),
        };
        log_result(id, socket.remote_addr(), &result, started.elapsed());

        socket.close();
        result
    }
}

fn log_result(
    id: ConnectionId,
    remote_addr: &str,
    result: &Result<ExitOutcome, WorkerError>,
    elapsed: Duration,
) {
    match result {
        Ok(ExitOutcome::Completed) => {
            info!(conn = %id, remote_addr, duration = ?elapsed, "Daemon finished");
        }
        Ok(ExitOutcome::ClientTerminated) => {
            warn!(conn = %id, remote_addr, duration = ?elapsed, "Daemon stopped, client closed the session");
        }
        Ok(ExitOutcome::Failed { code }) => {
            warn!(conn = %id, remote_addr, exit_code = code, "Daemon exited with error status");
        }
        Ok(ExitOutcome::Signaled { signal }) => {
            warn!(conn = %id, remote_addr, signal, "Daemon killed by signal");
        }
        Err(e @ WorkerError::NotStream { .. }) => {
            error!(conn = %id, remote_addr, error = %e, "Raw TCP passthrough required, dropping connection");
        }
        Err(e) => {
            error!(conn = %id, remote_addr, error = %e, "Worker aborted");
        }
    }
}
