//! Configuration for the syncgate server
//!
//! A TOML file (`[server]`, `[upgrade]`, `[daemon]`) layered under command
//! line overrides. Every section falls back to defaults, so an absent file is
//! a valid configuration.

mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::*;
