//! syncgate-server: hands upgraded HTTP connections to a daemon process
//!
//! A client sends a request with a custom method (`RSYNC` by default) and
//! upgrade headers. The [`upgrade::UpgradeHandler`] answers `101 Switching
//! Protocols`, takes the raw TCP socket away from hyper and passes it to the
//! [`server::ConnectionServer`], which runs the configured daemon with the
//! socket as its standard input. The [`supervisor::Supervisor`] drains all of
//! this on SIGTERM or SIGINT within a deadline.

pub mod cli;
pub mod config;
pub mod http;
pub mod server;
pub mod shutdown;
pub mod socket;
pub mod supervisor;
pub mod timer;
pub mod upgrade;
pub mod worker;

#[cfg(test)]
mod testing;
