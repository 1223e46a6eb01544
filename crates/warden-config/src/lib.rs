#![deny(unsafe_code)]

//! Configuration loading and validation for the warden daemon.
//!
//! Loads TOML configuration files and validates them against expected ranges.
//! Provides the [`AppConfig`] type as the central configuration structure.
//! Every section has defaults, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / IPC configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Scan engine and scan path configuration.
    #[serde(default)]
    pub scanning: ScanningConfig,

    /// Event pipeline sampling.
    #[serde(default)]
    pub events: EventsConfig,

    /// Initial firewall state.
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the core daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unix socket the IPC server listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Seconds between periodic health checks (0 = only at startup).
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/warden/defense.sock")
}

fn default_health_interval_secs() -> u64 {
    300
}

/// Scan engine connection and scan path configuration.
///
/// ## TOML Example
///
/// ```toml
/// [scanning]
/// engine_socket = "/run/clamav/clamd.ctl"
/// quick_scan_paths = ["/tmp", "/home/alice/Downloads"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanningConfig {
    /// Unix socket of the local scan engine daemon.
    #[serde(default = "default_engine_socket")]
    pub engine_socket: PathBuf,

    /// Directories walked by a quick scan.
    #[serde(default = "default_quick_scan_paths")]
    pub quick_scan_paths: Vec<PathBuf>,

    /// Deadline for a liveness probe, in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Deadline for scanning one file, in seconds.
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            engine_socket: default_engine_socket(),
            quick_scan_paths: default_quick_scan_paths(),
            probe_timeout_secs: default_probe_timeout_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
        }
    }
}

impl ScanningConfig {
    /// Probe deadline as a [`Duration`].
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Per-file scan deadline as a [`Duration`].
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

fn default_engine_socket() -> PathBuf {
    PathBuf::from("/run/clamav/clamd.ctl")
}

fn default_quick_scan_paths() -> Vec<PathBuf> {
    ["/tmp", "/var/tmp", "/dev/shm"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_scan_timeout_secs() -> u64 {
    60
}

/// Event pipeline configuration.
///
/// Failed and slow operations are always emitted; `sample_rate` only
/// thins out successful fast ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Fraction of successful fast events to emit (0.0–1.0).
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Events at or above this duration always pass sampling.
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            slow_threshold_ms: default_slow_threshold_ms(),
        }
    }
}

impl EventsConfig {
    /// Slow threshold as a [`Duration`].
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_slow_threshold_ms() -> u64 {
    1000
}

/// Firewall configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Whether the firewall starts enabled.
    #[serde(default)]
    pub enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Loading configuration");
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "daemon.socket_path must not be empty".to_string(),
            ));
        }
        if self.scanning.engine_socket.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "scanning.engine_socket must not be empty".to_string(),
            ));
        }
        for (i, path) in self.scanning.quick_scan_paths.iter().enumerate() {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "scanning.quick_scan_paths[{i}] must not be empty"
                )));
            }
        }
        if self.scanning.probe_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "scanning.probe_timeout_secs must be non-zero".to_string(),
            ));
        }
        if self.scanning.scan_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "scanning.scan_timeout_secs must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.events.sample_rate) {
            return Err(ConfigError::Validation(format!(
                "events.sample_rate must be in [0.0, 1.0], got {}",
                self.events.sample_rate
            )));
        }
        Ok(())
    }
}
