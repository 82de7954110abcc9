//! Automatic logging module for ratssh.
//!
//! Provides file-based logging with automatic cleanup.
//! Logs are stored in ~/.ratssh/logs/ by default.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Default log retention in hours.
pub const DEFAULT_LOG_RETENTION_HOURS: u32 = 24;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log retention period in hours.
    pub retention_hours: u32,
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Whether logging is enabled.
    pub enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention_hours: DEFAULT_LOG_RETENTION_HOURS,
            level: DEFAULT_LOG_LEVEL.to_string(),
            enabled: true,
        }
    }
}

impl LogConfig {
    /// Parses log level from string.
    #[must_use]
    pub fn parse_level(value: &str) -> String {
        match value.to_lowercase().as_str() {
            "trace" => "trace".to_string(),
            "debug" => "debug".to_string(),
            "info" => "info".to_string(),
            "warn" | "warning" => "warn".to_string(),
            "error" => "error".to_string(),
            "off" | "none" | "disabled" => "off".to_string(),
            _ => DEFAULT_LOG_LEVEL.to_string(),
        }
    }

    /// Parses retention hours from string.
    #[must_use]
    pub fn parse_retention(value: &str) -> u32 {
        value.parse().unwrap_or(DEFAULT_LOG_RETENTION_HOURS)
    }
}

/// Returns the log directory inside a storage directory.
#[must_use]
pub fn log_directory(storage_dir: &Path) -> PathBuf {
    storage_dir.join("logs")
}

/// Returns a fresh log file name.
#[must_use]
pub fn log_file_name() -> String {
    let now = chrono::Local::now();
    format!("ratssh_{}.log", now.format("%Y-%m-%d_%H-%M-%S"))
}

/// Deletes `.log` files in `log_dir` older than the retention period.
///
/// # Errors
/// Returns error if directory cannot be read.
pub fn cleanup_old_logs(log_dir: &Path, retention_hours: u32) -> io::Result<u32> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let retention_duration = Duration::from_secs(u64::from(retention_hours) * 3600);
    let now = SystemTime::now();
    let mut deleted_count = 0;

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        // Only process .log files
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > retention_duration) && fs::remove_file(&path).is_ok() {
            deleted_count += 1;
        }
    }

    Ok(deleted_count)
}

/// Initializes the logging system.
///
/// Sets up file-based logging under `storage_dir/logs` and cleans up old
/// log files. The returned guard flushes the background writer on drop and
/// must be held for the life of the program. `RUST_LOG` overrides the
/// configured level.
///
/// # Errors
/// Returns error if the log directory cannot be prepared.
pub fn init(config: &LogConfig, storage_dir: &Path) -> io::Result<Option<WorkerGuard>> {
    if !config.enabled || config.level == "off" {
        return Ok(None);
    }

    let log_dir = log_directory(storage_dir);
    fs::create_dir_all(&log_dir)?;
    let deleted = cleanup_old_logs(&log_dir, config.retention_hours)?;

    let file_name = log_file_name();
    let appender = tracing_appender::rolling::never(&log_dir, &file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    // A subscriber may already be installed (tests, embedding applications).
    if tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        return Ok(None);
    }

    tracing::info!("ratssh logging initialized");
    tracing::info!("Log file: {}", log_dir.join(&file_name).display());
    tracing::info!("Log level: {}", config.level);
    tracing::info!("Log retention: {} hours", config.retention_hours);
    if deleted > 0 {
        tracing::info!("Cleaned up {} old log file(s)", deleted);
    }

    Ok(Some(guard))
}
