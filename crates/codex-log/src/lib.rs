//! Structured logging for the game server.
//!
//! Console output with uptime timestamps and thread names, plus a JSON log
//! file in debug builds. `log` records emitted by `codex-config` are picked
//! up by the same subscriber.

use std::path::{Path, PathBuf};

use codex_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Name of the JSON log file written in debug builds.
pub const LOG_FILE: &str = "codex.log";

const DEFAULT_DIRECTIVE: &str = "info";

/// Filter directive derived from the config's `log_level`, or `info`.
pub fn filter_directive(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.trim().to_string()
        }
        _ => DEFAULT_DIRECTIVE.to_string(),
    }
}

/// Where the JSON log goes inside `log_dir`.
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(LOG_FILE)
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over the config. The JSON file layer is only added when
/// `debug_build` is set and `log_dir` can be created.
///
/// ```no_run
/// use codex_config::Config;
/// use codex_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let directive = filter_directive(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));
    let active = env_filter.to_string();

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_file_path(log_dir))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        tracing::info!(
            "Logging initialized (filter: {active}, file: {})",
            log_file_path(log_dir).display()
        );
        return;
    }

    subscriber.init();
    tracing::info!("Logging initialized (filter: {active})");
}

/// `EnvFilter` for the default directive.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_DIRECTIVE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_is_info() {
        assert_eq!(filter_directive(None), "info");
        assert_eq!(default_env_filter().to_string(), "info");
    }

    #[test]
    fn test_config_level_is_used() {
        let mut config = Config::default();
        config.debug.log_level = "debug".to_string();
        assert_eq!(filter_directive(Some(&config)), "debug");
    }

    #[test]
    fn test_blank_config_level_falls_back() {
        let mut config = Config::default();
        config.debug.log_level = "  ".to_string();
        assert_eq!(filter_directive(Some(&config)), "info");
    }

    #[test]
    fn test_per_crate_directives_parse() {
        for directive in ["info,codex_net=debug", "warn,codex_net::link=trace", "error"] {
            assert!(
                EnvFilter::try_new(directive).is_ok(),
                "failed to parse {directive}"
            );
        }
    }

    #[test]
    fn test_log_file_lives_in_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_file_path(dir.path());
        assert_eq!(path.parent(), Some(dir.path()));
        assert_eq!(path.file_name().unwrap(), LOG_FILE);
    }

    // The only test that installs the global subscriber.
    #[test]
    fn test_init_logs_through_tracing_into_file() {
        let dir = tempfile::tempdir().unwrap();
        init_logging(Some(dir.path()), true, None);
        tracing::warn!("after init");

        let written = std::fs::read_to_string(log_file_path(dir.path())).unwrap();
        assert!(written.contains("Logging initialized"));
        assert!(written.contains("after init"));
        assert!(written.lines().all(|line| line.starts_with('{')));
    }
}
