//! Codex Naturalis game server.
//!
//! Loads `config.ron`, applies command-line overrides and serves the games
//! lobby over TCP until interrupted.
//!
//! Run with: `cargo run -p codex-server -- --socket-port 30000`

mod lobby;

use std::sync::Arc;

use clap::Parser;
use codex_config::{CliArgs, Config, default_config_dir};
use codex_net::{FrameConfig, GameServer, LinkConfig, ServerConfig};
use tracing::{error, info, warn};

use crate::lobby::GamesManager;

fn link_config(config: &Config) -> LinkConfig {
    let net = &config.network;
    LinkConfig {
        ping_interval: net.ping_interval(),
        max_missed_pings: net.max_ping_count,
        read_timeout: net.read_timeout(),
        write_timeout: net.write_timeout(),
        retry_delay: net.retry_delay(),
        retry_jitter: 0.0,
        frame: FrameConfig::default(),
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // Logging is not up yet; remember what went wrong and report it later.
    let mut startup_problems = Vec::new();
    let config_dir = match args.config.clone() {
        Some(dir) => Some(dir),
        None => default_config_dir()
            .map_err(|e| startup_problems.push(e.to_string()))
            .ok(),
    };
    let mut config = match config_dir.as_deref() {
        Some(dir) => Config::load_or_create(dir).unwrap_or_else(|e| {
            startup_problems.push(format!("{e}; using defaults"));
            Config::default()
        }),
        None => Config::default(),
    };
    config.apply_cli_overrides(&args);
    let replaced = config.sanitize();

    let log_dir = config_dir.as_ref().map(|dir| dir.join("logs"));
    codex_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    for problem in startup_problems {
        warn!("{problem}");
    }
    for field in replaced {
        warn!("Invalid {field} replaced by its default");
    }

    let server_config = ServerConfig {
        bind_addr: config.network.socket_addr(),
        max_connections: config.network.max_connections,
        link: link_config(&config),
    };
    info!(
        "Codex server on {} | ping every {:?}, {} misses allowed",
        server_config.bind_addr,
        server_config.link.ping_interval,
        server_config.link.max_missed_pings
    );

    let server = GameServer::new(server_config, Arc::new(GamesManager::default()));
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    server.shutdown().await;
    info!("Server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_link_config_follows_network_settings() {
        let mut config = Config::default();
        config.network.ping_interval_ms = 250;
        config.network.max_ping_count = 5;
        config.network.socket_write_timeout_ms = 750;

        let link = link_config(&config);
        assert_eq!(link.ping_interval, Duration::from_millis(250));
        assert_eq!(link.max_missed_pings, 5);
        assert_eq!(link.read_timeout, Duration::from_millis(100));
        assert_eq!(link.write_timeout, Duration::from_millis(750));
        assert_eq!(link.retry_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_default_settings_match_link_defaults() {
        assert_eq!(link_config(&Config::default()), LinkConfig::default());
    }
}
