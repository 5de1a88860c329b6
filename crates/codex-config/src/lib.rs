//! Configuration for the game server and clients.
//!
//! Settings persist to disk as `config.ron`. Values given on the command line
//! override the file, and [`Config::sanitize`] replaces anything out of range
//! with its default before the network layer sees it.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, NetworkConfig, default_config_dir};
pub use error::ConfigError;
