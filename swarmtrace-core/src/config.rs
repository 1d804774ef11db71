//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/swarmtrace/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/swarmtrace/` (~/.config/swarmtrace/)
//! - Data: `$XDG_DATA_HOME/swarmtrace/` (~/.local/share/swarmtrace/)
//! - State/Logs: `$XDG_STATE_HOME/swarmtrace/` (~/.local/state/swarmtrace/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Swarm backend connection and polling
    #[serde(default)]
    pub backend: BackendConfig,

    /// Token buffering and timeline shaping
    #[serde(default)]
    pub stream: StreamConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Swarm backend configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Base URL of the backend API (e.g., `http://localhost:8000/api`)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token sent with every request (optional)
    pub api_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Delay between poll requests in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Seconds without progress before the remote run is force-stopped
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Consecutive failed polls tolerated before giving up
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_secs: default_timeout(),
            poll_interval_ms: default_poll_interval(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            max_poll_errors: default_max_poll_errors(),
        }
    }
}

impl BackendConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(Error::Config("backend.base_url must not be empty".to_string()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "backend.base_url must be an http(s) URL, got {:?}",
                url
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "backend.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.inactivity_timeout_secs == 0 {
            return Err(Error::Config(
                "backend.inactivity_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "backend.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    500
}

fn default_inactivity_timeout() -> u64 {
    120
}

fn default_max_poll_errors() -> u32 {
    3
}

/// Streaming and timeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    /// Minimum spacing between two flushes of the same agent's text
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Only the trailing N characters of an agent's text are scanned for markers
    #[serde(default = "default_scan_window")]
    pub scan_window_chars: usize,

    /// Maximum number of timeline events kept in memory
    #[serde(default = "default_timeline_cap")]
    pub timeline_cap: usize,

    /// Length of the output preview attached to tool results
    #[serde(default = "default_output_preview")]
    pub output_preview_chars: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
            scan_window_chars: default_scan_window(),
            timeline_cap: default_timeline_cap(),
            output_preview_chars: default_output_preview(),
        }
    }
}

impl StreamConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn default_flush_interval() -> u64 {
    16
}

fn default_scan_window() -> usize {
    50_000
}

fn default_timeline_cap() -> usize {
    500
}

fn default_output_preview() -> usize {
    500
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/swarmtrace/config.toml` (~/.config/swarmtrace/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("swarmtrace").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/swarmtrace/` (~/.local/share/swarmtrace/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("swarmtrace")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/swarmtrace/` (~/.local/state/swarmtrace/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("swarmtrace")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/swarmtrace/state.db` (~/.local/share/swarmtrace/state.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("state.db")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
