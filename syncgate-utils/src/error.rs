//! Error types for syncgate
//!
//! Startup and configuration failures share one error type; the per-connection
//! error enums live next to the code that raises them in `syncgate-server`.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Main error type for syncgate operations
#[derive(Debug, thiserror::Error)]
pub enum SyncgateError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Network Errors ===

    #[error("Invalid listen address '{addr}': {message}")]
    InvalidAddress { addr: String, message: String },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncgateError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error comes from the configuration (file or flags)
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigInvalid { .. }
                | Self::ConfigNotFound(_)
                | Self::InvalidAddress { .. }
        )
    }
}

/// Result type alias using SyncgateError
pub type Result<T> = std::result::Result<T, SyncgateError>;
