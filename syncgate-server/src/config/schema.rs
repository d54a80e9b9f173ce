//! Configuration schema structs

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use syncgate_utils::{Result, SyncgateError};

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upgrade: UpgradeConfig,
    pub daemon: DaemonConfig,
}

/// Listener and shutdown settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP listener binds (default: [::]:8084)
    pub listen: String,
    /// Time allowed for a client to send its request headers
    pub read_timeout_secs: u64,
    /// Deadline for draining connections before daemons are killed
    pub shutdown_timeout_secs: u64,
    /// Interval of the status log line, 0 disables it
    pub status_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "[::]:8084".into(),
            read_timeout_secs: 15,
            shutdown_timeout_secs: 17,
            status_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e: std::net::AddrParseError| SyncgateError::InvalidAddress {
                addr: self.listen.clone(),
                message: e.to_string(),
            })
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }
}

/// The upgrade handshake
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Request method that asks for an upgrade (default: RSYNC)
    pub method: String,
    /// Value of the `Upgrade` response header (default: rsync)
    pub protocol: String,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            method: "RSYNC".into(),
            protocol: "rsync".into(),
        }
    }
}

/// The daemon started for every connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("rsync"),
            args: vec!["--daemon".into(), "--config=/etc/rsyncd.conf".into()],
        }
    }
}
