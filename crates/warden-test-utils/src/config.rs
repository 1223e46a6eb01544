//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::path::PathBuf;

use warden_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .socket_path(dir.path().join("defense.sock"))
///     .quick_scan_paths([dir.path().join("inbox")])
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.daemon.socket_path = path.into();
        self
    }

    pub fn health_interval_secs(mut self, secs: u64) -> Self {
        self.config.daemon.health_interval_secs = secs;
        self
    }

    pub fn engine_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.scanning.engine_socket = path.into();
        self
    }

    pub fn quick_scan_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.config.scanning.quick_scan_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Probe and per-file scan timeouts, in seconds.
    pub fn engine_timeouts(mut self, probe_secs: u64, scan_secs: u64) -> Self {
        self.config.scanning.probe_timeout_secs = probe_secs;
        self.config.scanning.scan_timeout_secs = scan_secs;
        self
    }

    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.config.events.sample_rate = rate;
        self
    }

    pub fn slow_threshold_ms(mut self, ms: u64) -> Self {
        self.config.events.slow_threshold_ms = ms;
        self
    }

    pub fn firewall_enabled(mut self, enabled: bool) -> Self {
        self.config.firewall.enabled = enabled;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
