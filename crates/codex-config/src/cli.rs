//! Command-line argument parsing for the game server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Game server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "codex-server", about = "Codex Naturalis game server")]
pub struct CliArgs {
    /// IPv4 address to bind to.
    #[arg(long)]
    pub server_ip: Option<String>,

    /// Game server TCP port.
    #[arg(long)]
    pub socket_port: Option<u32>,

    /// Liveness tick period in milliseconds.
    #[arg(long)]
    pub ping_interval: Option<u64>,

    /// Missed ticks before a peer is declared dead.
    #[arg(long)]
    pub max_ping_count: Option<u32>,

    /// Socket read timeout in milliseconds.
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Frame write timeout in milliseconds.
    #[arg(long)]
    pub write_timeout: Option<u64>,

    /// Delay between reconnection attempts in milliseconds.
    #[arg(long)]
    pub retry_delay: Option<u64>,

    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let net = &mut self.network;
        if let Some(ref ip) = args.server_ip {
            net.server_ip = ip.clone();
        }
        if let Some(port) = args.socket_port {
            net.socket_port = port;
        }
        if let Some(ms) = args.ping_interval {
            net.ping_interval_ms = ms;
        }
        if let Some(count) = args.max_ping_count {
            net.max_ping_count = count;
        }
        if let Some(ms) = args.read_timeout {
            net.socket_read_timeout_ms = ms;
        }
        if let Some(ms) = args.write_timeout {
            net.socket_write_timeout_ms = ms;
        }
        if let Some(ms) = args.retry_delay {
            net.reconnect_retry_delay_ms = ms;
        }
        if let Some(max) = args.max_connections {
            net.max_connections = max;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
