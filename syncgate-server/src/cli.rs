//! Command line arguments

use std::path::PathBuf;

use clap::Parser;
use syncgate_utils::{LogConfig, LogOutput, Verbosity};

use crate::config::AppConfig;

/// HTTP upgrade gateway for an rsync daemon
#[derive(Parser, Debug)]
#[command(name = "syncgate-server")]
#[command(about = "Hands upgraded HTTP connections to an rsync daemon")]
#[command(version)]
pub struct Cli {
    /// Log connection events (info level)
    #[arg(short, long)]
    pub verbose: bool,

    /// Log everything (debug level)
    #[arg(long)]
    pub debug: bool,

    /// Address to listen on, overrides the config file
    ///
    /// Example: [::]:8084 or 127.0.0.1:8084
    #[arg(long, env = "SYNCGATE_LISTEN")]
    pub listen: Option<String>,

    /// Also write logs to $XDG_STATE_HOME/syncgate/log/syncgate.log
    #[arg(long)]
    pub log_file: bool,

    /// Configuration file (default: $XDG_CONFIG_HOME/syncgate/config.toml)
    #[arg(short, long, env = "SYNCGATE_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.verbose, self.debug)
    }

    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::server(self.verbosity());
        if self.log_file {
            config.output = LogOutput::Both;
        }
        config
    }

    /// Apply command line overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(listen) = &self.listen {
            config.server.listen = listen.clone();
        }
    }
}
