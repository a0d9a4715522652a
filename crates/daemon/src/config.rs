//! Configuration management for the termbroker daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termbroker/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("poll_interval_ms must be between 50 and 60000, got {0}")]
    InvalidPollInterval(u64),

    #[error("queue_capacity must be between 64 and 1048576, got {0}")]
    InvalidQueueCapacity(usize),

    #[error("scrollback_lines must be between 1 and 100000, got {0}")]
    InvalidScrollback(usize),

    #[error("default terminal size must be non-zero, got {0}x{1}")]
    InvalidTerminalSize(u16, u16),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("logcat_program must not be empty")]
    EmptyLogcatProgram,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the termbroker daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Broker loop tuning.
    pub broker: BrokerConfig,

    /// What sessions run and how much they remember.
    pub session: SessionConfig,

    /// Service lifecycle and socket placement.
    pub service: ServiceConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state (pid file).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// How often tracked processes are checked for liveness.
    pub poll_interval_ms: u64,

    /// Capacity of each session's input and output queue, in bytes.
    pub queue_capacity: usize,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to run in shell sessions.
    pub default_shell: String,

    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// Program run by logcat sessions as `<program> -C --pid=<pid>`.
    pub logcat_program: String,

    /// Lines of transcript kept per session.
    pub scrollback_lines: usize,

    /// Size used when a session is attached without one.
    pub default_cols: u16,
    pub default_rows: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Terminate once the last session is gone.
    pub stop_when_idle: bool,

    /// Directory for the broker and control sockets. Defaults to the
    /// runtime directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            queue_capacity: crate::byte_queue::SESSION_QUEUE_CAPACITY,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            shell_args: Vec::new(),
            logcat_program: "logcat".to_string(),
            scrollback_lines: crate::session::emulator::DEFAULT_SCROLLBACK_LINES,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl BrokerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termbroker")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termbroker")
}

fn default_shell() -> String {
    crate::session::detect_shell(None)
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Empty values are ignored. Supported variables:
    /// - TERMBROKER_LOG_LEVEL: Override log level
    /// - TERMBROKER_SHELL: Override the shell for shell sessions
    /// - TERMBROKER_POLL_INTERVAL_MS: Override the liveness poll interval
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMBROKER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(shell) = std::env::var("TERMBROKER_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding default_shell from environment: {}", shell);
                self.session.default_shell = shell;
            }
        }

        if let Ok(interval) = std::env::var("TERMBROKER_POLL_INTERVAL_MS") {
            match interval.trim().parse::<u64>() {
                Ok(ms) => {
                    tracing::info!("Overriding poll_interval_ms from environment: {}", ms);
                    self.broker.poll_interval_ms = ms;
                }
                Err(_) if interval.is_empty() => {}
                Err(_) => tracing::warn!(
                    "Ignoring TERMBROKER_POLL_INTERVAL_MS, not a number: {}",
                    interval
                ),
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.broker.poll_interval_ms;
        if !(50..=60_000).contains(&interval) {
            return Err(ConfigError::InvalidPollInterval(interval));
        }

        let capacity = self.broker.queue_capacity;
        if !(64..=1024 * 1024).contains(&capacity) {
            return Err(ConfigError::InvalidQueueCapacity(capacity));
        }

        let lines = self.session.scrollback_lines;
        if !(1..=100_000).contains(&lines) {
            return Err(ConfigError::InvalidScrollback(lines));
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize(
                self.session.default_cols,
                self.session.default_rows,
            ));
        }

        let shell_path = Path::new(&self.session.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(
                    self.session.default_shell.clone(),
                ));
            }
        } else if which::which(&self.session.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        // logcat may legitimately be absent; only an empty name is wrong.
        if self.session.logcat_program.trim().is_empty() {
            return Err(ConfigError::EmptyLogcatProgram);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("TERMBROKER_LOG_LEVEL");
        std::env::remove_var("TERMBROKER_SHELL");
        std::env::remove_var("TERMBROKER_POLL_INTERVAL_MS");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.broker.poll_interval_ms, 1000);
        assert_eq!(config.broker.queue_capacity, 4096);
        assert_eq!(config.session.logcat_program, "logcat");
        assert_eq!(config.session.scrollback_lines, 2000);
        assert_eq!((config.session.default_cols, config.session.default_rows), (80, 24));
        assert!(!config.service.stop_when_idle);
        assert!(config.service.socket_dir.is_none());
    }

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("termbroker"));
    }

    #[test]
    fn test_poll_interval_duration() {
        let config = BrokerConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[broker]
poll_interval_ms = 250
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.broker.poll_interval_ms, 250);
        // Other values should be defaults
        assert_eq!(config.broker.queue_capacity, 4096);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"

[broker]
poll_interval_ms = 500
queue_capacity = 8192

[session]
default_shell = "/bin/zsh"
shell_args = ["-l"]
logcat_program = "/system/bin/logcat"
scrollback_lines = 500
default_cols = 120
default_rows = 40

[service]
stop_when_idle = true
socket_dir = "/run/tb"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.broker.poll_interval_ms, 500);
        assert_eq!(config.broker.queue_capacity, 8192);
        assert_eq!(config.session.default_shell, "/bin/zsh");
        assert_eq!(config.session.shell_args, vec!["-l"]);
        assert_eq!(config.session.logcat_program, "/system/bin/logcat");
        assert_eq!(config.session.scrollback_lines, 500);
        assert_eq!(config.session.default_cols, 120);
        assert_eq!(config.session.default_rows, 40);
        assert!(config.service.stop_when_idle);
        assert_eq!(config.service.socket_dir, Some(PathBuf::from("/run/tb")));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[broker]
poll_interval_ms = "fast"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[daemon]
log_level = "warn"
unknown_field = "value"

[unknown_section]
key = "value"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.log_level, "warn");
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.session.shell_args = vec!["-i".to_string()];
        original.service.stop_when_idle = true;
        original.service.socket_dir = Some(PathBuf::from("/tmp/tb"));

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[service]"));
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.broker.poll_interval_ms = 200;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "this is not [valid").unwrap();

        let err = format!("{:#}", Config::load(&config_path).unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("termbroker/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        clear_env();
        std::env::set_var("TERMBROKER_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("TERMBROKER_LOG_LEVEL", "");
        std::env::set_var("TERMBROKER_SHELL", "");

        let mut config = Config::default();
        let original = config.clone();
        config.apply_env_overrides();
        assert_eq!(config, original);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_shell_and_interval() {
        clear_env();
        std::env::set_var("TERMBROKER_SHELL", "/bin/sh");
        std::env::set_var("TERMBROKER_POLL_INTERVAL_MS", "150");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.default_shell, "/bin/sh");
        assert_eq!(config.broker.poll_interval_ms, 150);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_bad_interval_ignored() {
        clear_env();
        std::env::set_var("TERMBROKER_POLL_INTERVAL_MS", "soon");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.broker.poll_interval_ms, 1000);

        clear_env();
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_default_config() {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_poll_interval_bounds() {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();

        config.broker.poll_interval_ms = 10;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(10)));

        config.broker.poll_interval_ms = 50;
        assert!(config.validate().is_ok());

        config.broker.poll_interval_ms = 60_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_queue_capacity() {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config.broker.queue_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidQueueCapacity(0)));
    }

    #[test]
    fn test_validate_terminal_size() {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config.session.default_rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize(80, 0))
        );
    }

    #[test]
    fn test_validate_shell_path_absolute_not_exists() {
        let mut config = Config::default();
        config.session.default_shell = "/nonexistent/path/to/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "/nonexistent/path/to/shell".to_string()
            ))
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_shell_path_in_path() {
        let mut config = Config::default();
        config.session.default_shell = "sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_logcat_program() {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config.session.logcat_program = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyLogcatProgram));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();

        config.daemon.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "warning".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("warning".to_string()))
        );
    }
}
