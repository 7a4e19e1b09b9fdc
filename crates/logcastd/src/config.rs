//! Daemon configuration.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then command-line overrides applied by the binary. Every field has a
//! default, so an empty file is a valid configuration.
//!
//! ```toml
//! log_file = "/var/log/app.log"
//! host = "0.0.0.0"
//! port = 9211
//! strategy = "poll"
//! interval_ms = 250
//! ```

use std::fs;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::detector::DetectionStrategy;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "LOGCAST_CONFIG";

pub const DEFAULT_LOG_FILE: &str = "./log.log";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9211;

/// Poll interval, or throttle window for the event strategy.
pub const DEFAULT_INTERVAL_MS: u64 = 500;

/// Per-subscriber send timeout.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 10_000;

pub const DEFAULT_MAX_CONCURRENT_SENDS: usize = 32;
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 64;

/// Bytes scanned per read window (4 MiB).
pub const DEFAULT_MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// File to tail
    pub log_file: PathBuf,

    /// Listener host
    pub host: String,

    /// Listener port
    pub port: u16,

    /// Change detection strategy
    pub strategy: DetectionStrategy,

    /// Poll interval or throttle window, in milliseconds
    pub interval_ms: u64,

    /// Upper bound on a single send to one subscriber, in milliseconds
    pub send_timeout_ms: u64,

    /// Bound on in-flight sends while fanning out one line
    pub max_concurrent_sends: usize,

    /// Registry capacity
    pub max_subscribers: usize,

    /// Bytes read per scan window
    pub max_read_bytes: u64,

    /// Keep-alive ping cadence in seconds (0 disables pings)
    pub ping_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            strategy: DetectionStrategy::default(),
            interval_ms: DEFAULT_INTERVAL_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            max_concurrent_sends: DEFAULT_MAX_CONCURRENT_SENDS,
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
        }
    }
}

impl DaemonConfig {
    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                error,
            },
            other => other,
        })
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: None,
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every numeric knob is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_file.as_os_str().is_empty() {
            return Err(ConfigError::invalid("log_file", "must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("host", "must not be empty"));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::invalid("interval_ms", "must be greater than 0"));
        }
        if self.send_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "send_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.max_concurrent_sends == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_sends",
                "must be greater than 0",
            ));
        }
        if self.max_subscribers == 0 {
            return Err(ConfigError::invalid(
                "max_subscribers",
                "must be greater than 0",
            ));
        }
        if self.max_read_bytes == 0 {
            return Err(ConfigError::invalid(
                "max_read_bytes",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Keep-alive cadence, `None` when disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    /// Resolves `host:port` to a socket address.
    ///
    /// IP literals are used directly; names go through the system resolver
    /// and the first address wins.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::invalid("host", &e.to_string()))?
            .next()
            .ok_or_else(|| ConfigError::invalid("host", "resolved to no addresses"))
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config{}: {error}", path.as_ref().map(|p| format!(" file {}", p.display())).unwrap_or_default())]
    Parse { path: Option<PathBuf>, error: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: &str) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}
