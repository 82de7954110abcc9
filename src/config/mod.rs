//! Configuration module for ratssh.
//!
//! Handles loading and parsing the .ratsshrc configuration file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::KdfParams;
use crate::logging::LogConfig;
use crate::pool::{HostKeyPolicy, PoolConfig};
use crate::session::SessionConfig;
use crate::store::CredentialStore;

/// Default .ratsshrc file content with all settings documented.
const DEFAULT_RATSSHRC: &str = r#"# ratssh Configuration File
# ==========================
# This file is read on start-up.
# Lines starting with '#' are comments.

# Storage
# -------
# Directory holding profiles, sealed credentials, and pinned host keys.
# storage_dir = ~/.ratssh

# Connection Pool
# ---------------
# max_connections = 16               # Global connection cap
# max_connections_per_host = 2       # Connections per user@host:port
# max_sessions_per_connection = 4    # Sessions multiplexed over one connection
# acquire_timeout_secs = 30          # Wait for a free slot before PoolExhausted
# connect_timeout_secs = 15          # TCP connect, handshake, and authentication
# connect_retries = 0                # Network retries on first connect
# idle_timeout_secs = 60             # Close unused connections after this long

# Health and Recovery
# -------------------
# keepalive_interval_secs = 30
# keepalive_max_failures = 3         # Consecutive failures before Degraded
# reconnect_max_attempts = 5
# reconnect_initial_delay_ms = 500
# reconnect_max_delay_ms = 10000
# grace_window_secs = 30             # Sessions stay recoverable this long

# Host Keys
# ---------
# strict: unknown keys must be accepted explicitly
# tofu:   unknown keys are pinned on first use
# host_key_policy = strict

# Commands
# --------
# cancel_grace_ms = 2000             # Interrupt-to-teardown grace
# close_grace_ms = 5000              # Session close waits this long for blocks
# output_limit_bytes = 1048576       # Retained output per block
# update_buffer = 1024               # Unread updates before a subscriber is cut off
# command_timeout_secs = 0           # One-shot command deadline (0 = none)

# Credential Encryption (Argon2id)
# --------------------------------
# kdf_memory_kib = 19456
# kdf_iterations = 2
# kdf_parallelism = 1

# Logging Configuration
# ---------------------
# Logs are stored in ~/.ratssh/logs/ with automatic cleanup.
#
# log_enabled = true       # Enable/disable file logging (true/false)
# log_level = info         # Log level: trace, debug, info, warn, error, off
# log_retention = 24       # Hours to keep log files (default: 24)
"#;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to config file.
    pub config_path: PathBuf,
    /// Storage directory.
    pub storage_dir: PathBuf,
    /// Pool limits and timers.
    pub pool: PoolConfig,
    /// Session and command settings.
    pub session: SessionConfig,
    /// Key derivation cost for new credentials.
    pub kdf: KdfParams,
    /// Logging configuration.
    pub log_config: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            storage_dir: CredentialStore::default_dir(),
            pool: PoolConfig::default(),
            session: SessionConfig::default(),
            kdf: KdfParams::default(),
            log_config: LogConfig::default(),
        }
    }
}

impl Config {
    /// Returns the default config file path (~/.ratsshrc).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ratsshrc")
    }

    /// Loads configuration from the default path, creating it if it doesn't exist.
    ///
    /// # Errors
    /// Returns error if config cannot be read.
    pub fn load() -> io::Result<Self> {
        let path = Self::default_config_path();
        Self::load_from(&path)
    }

    /// Loads configuration from a specific path.
    ///
    /// # Errors
    /// Returns error if config cannot be read.
    pub fn load_from(path: &Path) -> io::Result<Self> {
        // Create default config if it doesn't exist
        if !path.exists() {
            Self::create_default_config(path)?;
        }

        let content = fs::read_to_string(path)?;
        let mut config = Self {
            config_path: path.to_path_buf(),
            ..Self::default()
        };
        config.parse(&content);
        Ok(config)
    }

    /// Parses configuration from text without touching the filesystem.
    #[must_use]
    pub fn from_str_content(content: &str) -> Self {
        let mut config = Self::default();
        config.parse(content);
        config
    }

    /// Creates the default config file.
    fn create_default_config(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(DEFAULT_RATSSHRC.as_bytes())?;
        Ok(())
    }

    /// Parses the config file content.
    fn parse(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();

                // Remove inline comments
                let value = value.split('#').next().unwrap_or(value).trim();

                self.apply_setting(key, value);
            }
        }
    }

    /// Applies a single setting. Unparsable values keep the current value.
    fn apply_setting(&mut self, key: &str, value: &str) {
        let pool = &mut self.pool;
        let session = &mut self.session;
        match key {
            "storage_dir" => {
                if !value.is_empty() {
                    self.storage_dir = expand_home(value);
                }
            }
            "max_connections" => set_positive(&mut pool.max_connections, value),
            "max_connections_per_host" => set_positive(&mut pool.max_connections_per_host, value),
            "max_sessions_per_connection" => set_positive(&mut pool.max_sessions_per_connection, value),
            "acquire_timeout_secs" => set_secs(&mut pool.acquire_timeout, value),
            "connect_timeout_secs" => set_secs(&mut pool.connect_timeout, value),
            "connect_retries" => set_parsed(&mut pool.connect_retries, value),
            "idle_timeout_secs" => set_secs(&mut pool.idle_timeout, value),
            "keepalive_interval_secs" => set_secs(&mut pool.keepalive_interval, value),
            "keepalive_max_failures" => set_positive(&mut pool.keepalive_max_failures, value),
            "reconnect_max_attempts" => set_parsed(&mut pool.reconnect.max_retries, value),
            "reconnect_initial_delay_ms" => set_millis(&mut pool.reconnect.initial_delay, value),
            "reconnect_max_delay_ms" => set_millis(&mut pool.reconnect.max_delay, value),
            "grace_window_secs" => set_secs(&mut pool.grace_window, value),
            "host_key_policy" => pool.host_key_policy = HostKeyPolicy::parse(value),
            "cancel_grace_ms" => set_millis(&mut session.exec.cancel_grace, value),
            "close_grace_ms" => set_millis(&mut session.close_grace, value),
            "output_limit_bytes" => set_positive(&mut session.output_limit, value),
            "update_buffer" => set_positive(&mut session.update_buffer, value),
            "command_timeout_secs" => {
                if let Ok(secs) = value.parse::<u64>() {
                    session.exec.command_timeout = (secs > 0).then(|| Duration::from_secs(secs));
                }
            }
            "kdf_memory_kib" => set_positive(&mut self.kdf.memory_kib, value),
            "kdf_iterations" => set_positive(&mut self.kdf.iterations, value),
            "kdf_parallelism" => set_positive(&mut self.kdf.parallelism, value),
            "log_level" => {
                self.log_config.level = LogConfig::parse_level(value);
            }
            "log_retention" | "log_retention_hours" => {
                self.log_config.retention_hours = LogConfig::parse_retention(value);
            }
            "log_enabled" | "logging" => {
                self.log_config.enabled = parse_bool(value);
            }
            _ => {}
        }
    }

    /// Reloads the configuration from disk.
    ///
    /// # Errors
    /// Returns error if config cannot be read.
    pub fn reload(&mut self) -> io::Result<()> {
        let path = self.config_path.clone();
        *self = Self::load_from(&path)?;
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "yes" | "1" | "on")
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, value: &str) {
    if let Ok(parsed) = value.parse() {
        *slot = parsed;
    }
}

fn set_positive<T: std::str::FromStr + Default + PartialOrd>(slot: &mut T, value: &str) {
    match value.parse::<T>() {
        Ok(parsed) if parsed > T::default() => *slot = parsed,
        _ => {}
    }
}

fn set_secs(slot: &mut Duration, value: &str) {
    match value.parse::<u64>() {
        Ok(secs) if secs > 0 => *slot = Duration::from_secs(secs),
        _ => {}
    }
}

fn set_millis(slot: &mut Duration, value: &str) {
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 => *slot = Duration::from_millis(ms),
        _ => {}
    }
}

fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(rest),
        None if value == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        None => PathBuf::from(value),
    }
}
