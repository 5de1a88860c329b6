//! Configuration structs with sensible defaults and RON persistence.

use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";
const APP_DIR: &str = "codex-naturalis";
const DEFAULT_SOCKET_PORT: u16 = 30000;
const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// `dirs::config_dir()/codex-naturalis`.
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .ok_or(ConfigError::NoConfigDir)
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Network settings shared by server and clients.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// IPv4 address the server binds to and clients connect to.
    pub server_ip: String,
    /// TCP port of the game server.
    pub socket_port: u32,
    /// Legacy remote-call port. Accepted and validated, otherwise unused.
    pub rmi_port: u32,
    /// Liveness tick period in milliseconds.
    pub ping_interval_ms: u64,
    /// Ticks without traffic before a peer is declared dead.
    pub max_ping_count: u32,
    /// Upper bound on one blocking read, in milliseconds.
    pub socket_read_timeout_ms: u64,
    /// Upper bound on writing one frame, in milliseconds.
    pub socket_write_timeout_ms: u64,
    /// Pause between reconnection attempts, in milliseconds.
    pub reconnect_retry_delay_ms: u64,
    /// Maximum concurrent connections (server only).
    pub max_connections: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_ip: "127.0.0.1".to_string(),
            socket_port: u32::from(DEFAULT_SOCKET_PORT),
            rmi_port: 30001,
            ping_interval_ms: 5000,
            max_ping_count: 3,
            socket_read_timeout_ms: 100,
            socket_write_timeout_ms: 5000,
            reconnect_retry_delay_ms: 100,
            max_connections: 256,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Address of the game server socket.
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = self
            .server_ip
            .parse::<Ipv4Addr>()
            .unwrap_or(Ipv4Addr::LOCALHOST);
        let port = u16::try_from(self.socket_port).unwrap_or(DEFAULT_SOCKET_PORT);
        SocketAddr::from((ip, port))
    }

    /// Liveness tick period.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_read_timeout_ms)
    }

    /// Write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_write_timeout_ms)
    }

    /// Reconnection retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_retry_delay_ms)
    }
}

fn is_valid_port(port: u32) -> bool {
    port > 1023 && port < 65536
}

fn replace_with_default<T: Display>(
    field: &'static str,
    value: &mut T,
    default: T,
    fixed: &mut Vec<&'static str>,
) {
    log::warn!("Invalid {field} {value}, falling back to {default}");
    *value = default;
    fixed.push(field);
}

// --- Validation ---

impl Config {
    /// Replace every out-of-range value with its default.
    ///
    /// Returns the names of the fields that were replaced.
    pub fn sanitize(&mut self) -> Vec<&'static str> {
        let defaults = NetworkConfig::default();
        let mut fixed = Vec::new();
        let net = &mut self.network;

        if net.server_ip.parse::<Ipv4Addr>().is_err() {
            replace_with_default("server_ip", &mut net.server_ip, defaults.server_ip, &mut fixed);
        }
        if !is_valid_port(net.socket_port) {
            replace_with_default(
                "socket_port",
                &mut net.socket_port,
                defaults.socket_port,
                &mut fixed,
            );
        }
        if !is_valid_port(net.rmi_port) {
            replace_with_default("rmi_port", &mut net.rmi_port, defaults.rmi_port, &mut fixed);
        }
        if net.ping_interval_ms == 0 {
            replace_with_default(
                "ping_interval_ms",
                &mut net.ping_interval_ms,
                defaults.ping_interval_ms,
                &mut fixed,
            );
        }
        if net.max_ping_count == 0 {
            replace_with_default(
                "max_ping_count",
                &mut net.max_ping_count,
                defaults.max_ping_count,
                &mut fixed,
            );
        }
        if net.socket_read_timeout_ms == 0 {
            replace_with_default(
                "socket_read_timeout_ms",
                &mut net.socket_read_timeout_ms,
                defaults.socket_read_timeout_ms,
                &mut fixed,
            );
        }
        if net.socket_write_timeout_ms == 0 {
            replace_with_default(
                "socket_write_timeout_ms",
                &mut net.socket_write_timeout_ms,
                defaults.socket_write_timeout_ms,
                &mut fixed,
            );
        }
        if net.reconnect_retry_delay_ms == 0 {
            replace_with_default(
                "reconnect_retry_delay_ms",
                &mut net.reconnect_retry_delay_ms,
                defaults.reconnect_retry_delay_ms,
                &mut fixed,
            );
        }
        if net.max_connections == 0 {
            replace_with_default(
                "max_connections",
                &mut net.max_connections,
                defaults.max_connections,
                &mut fixed,
            );
        }

        let level = self.debug.log_level.to_ascii_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            self.debug.log_level = level;
        } else {
            replace_with_default(
                "log_level",
                &mut self.debug.log_level,
                DebugConfig::default().log_level,
                &mut fixed,
            );
        }

        fixed
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path,
            source,
        })
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_settings() {
        let net = NetworkConfig::default();
        assert_eq!(net.socket_addr(), "127.0.0.1:30000".parse().unwrap());
        assert_eq!(net.ping_interval(), Duration::from_secs(5));
        assert_eq!(net.max_ping_count, 3);
        assert_eq!(net.read_timeout(), Duration::from_millis(100));
        assert_eq!(net.write_timeout(), Duration::from_secs(5));
        assert_eq!(net.retry_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(2))
                .unwrap();
        assert!(ron_str.contains("socket_port: 30000"));
        assert!(ron_str.contains("log_level: \"info\""));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let config: Config = ron::from_str("(network: (socket_port: 4000))").unwrap();
        assert_eq!(config.network.socket_port, 4000);
        assert_eq!(config.network.max_ping_count, 3);
        assert_eq!(config.debug, DebugConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_sanitize_keeps_valid_values() {
        let mut config = Config::default();
        config.network.socket_port = 1024;
        config.network.server_ip = "10.0.0.7".to_string();
        assert!(config.sanitize().is_empty());
        assert_eq!(config.network.socket_port, 1024);
    }

    #[test]
    fn test_sanitize_replaces_invalid_values() {
        let mut config = Config::default();
        config.network.server_ip = "not-an-ip".to_string();
        config.network.socket_port = 1023;
        config.network.rmi_port = 70000;
        config.network.ping_interval_ms = 0;
        config.network.max_ping_count = 0;
        config.network.socket_write_timeout_ms = 0;
        config.debug.log_level = "loud".to_string();

        let fixed = config.sanitize();
        assert_eq!(
            fixed,
            vec![
                "server_ip",
                "socket_port",
                "rmi_port",
                "ping_interval_ms",
                "max_ping_count",
                "socket_write_timeout_ms",
                "log_level"
            ]
        );
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_sanitize_normalises_log_level_case() {
        let mut config = Config::default();
        config.debug.log_level = "DEBUG".to_string();
        assert!(config.sanitize().is_empty());
        assert_eq!(config.debug.log_level, "debug");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.server_ip = "10.0.0.1".to_string();
        config.network.max_connections = 8;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("codex");
        let config = Config::load_or_create(&nested).unwrap();
        assert_eq!(config, Config::default());
        assert!(nested.join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.network.ping_interval_ms = 1000;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.network.ping_interval_ms, 1000);
    }

    #[test]
    fn test_invalid_ron_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();

        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE));
    }
}
