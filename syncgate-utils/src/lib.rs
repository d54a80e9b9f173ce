//! syncgate-utils: Common utilities shared across syncgate crates
//!
//! This crate provides:
//! - Unified error types ([`SyncgateError`], [`Result`])
//! - Logging infrastructure ([`init_logging_with_config`], [`LogConfig`])
//! - XDG-compliant path utilities ([`paths`] module)

pub mod error;
pub mod logging;
pub mod paths;

// Re-export main types at crate root for convenience
pub use error::{Result, SyncgateError};
pub use logging::{init_logging_with_config, LogConfig, LogOutput, Verbosity};

pub use paths::{config_dir, config_file, log_dir, state_dir};
