//! File logging for swarmtrace
//!
//! `follow` streams chat text on stdout, so diagnostics go to dated files
//! under `$XDG_STATE_HOME/swarmtrace/` instead (`swarmtrace.YYYY-MM-DD.log`).
//! The HTTP stack is held at `warn` unless `RUST_LOG` asks for more, since
//! a poll every 500ms would otherwise bury the session's own events.

use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};

const LOG_PREFIX: &str = "swarmtrace";
const LOG_SUFFIX: &str = "log";

/// Crates that log every request at debug level.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Install the global subscriber writing to the XDG state dir.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    init_in(config, &Config::state_dir())
}

/// Install the global subscriber writing to `log_dir`.
///
/// Fails if the level is unknown or a subscriber is already installed.
pub fn init_in(config: &LoggingConfig, log_dir: &Path) -> Result<LoggingGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directives(&config.level)?)
            .map_err(|e| Error::Config(format!("invalid log filter: {}", e)))?,
    };

    std::fs::create_dir_all(log_dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix(LOG_SUFFIX)
        .max_log_files(config.max_files.max(1))
        .build(log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(log_dir = %log_dir.display(), level = %config.level, "logging initialized");

    Ok(LoggingGuard {
        _guard: guard,
        log_dir: log_dir.to_path_buf(),
    })
}

/// Filter directives for a configured level: the level itself, with the
/// HTTP stack capped at `warn`.
pub fn directives(level: &str) -> Result<String> {
    let level = level.trim().to_ascii_lowercase();
    if !LEVELS.contains(&level.as_str()) {
        return Err(Error::Config(format!(
            "logging.level must be one of {}, got {:?}",
            LEVELS.join(", "),
            level
        )));
    }

    let mut parts = vec![level.clone()];
    if !matches!(level.as_str(), "warn" | "error" | "off") {
        parts.extend(QUIET_TARGETS.iter().map(|target| format!("{}=warn", target)));
    }
    Ok(parts.join(","))
}

/// Keeps the background writer alive; pending lines are flushed on drop.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
    log_dir: PathBuf,
}

impl LoggingGuard {
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}
