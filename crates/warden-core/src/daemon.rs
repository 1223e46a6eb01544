//! Core daemon process: shared context, health checks, and the run loop.

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{info, warn};

use warden_config::AppConfig;

use crate::engine::{EngineClient, ScanEngine};
use crate::events::{Emitter, HealthCheckEvent, StateChangeEvent};
use crate::firewall::{FirewallControl, FirewallFlag};
use crate::ipc::{IpcError, IpcServer};
use crate::state::{ProtectionState, StateMachine};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// State shared by every request handler and scan job.
pub struct Daemon {
    config: AppConfig,
    state: Arc<StateMachine>,
    firewall: Arc<dyn FirewallControl>,
    engine: Arc<dyn ScanEngine>,
    events: Arc<Emitter>,
    last_scan: RwLock<Option<DateTime<Utc>>>,
    rules_updated: RwLock<Option<DateTime<Utc>>>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl Daemon {
    /// Create a daemon wired to the scan engine and event settings in `config`.
    pub fn new(config: AppConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            state: Arc::new(StateMachine::default()),
            firewall: Arc::new(FirewallFlag::new(config.firewall.enabled)),
            engine: Arc::new(EngineClient::from_config(&config.scanning)),
            events: Arc::new(Emitter::from_config(&config.events)),
            last_scan: RwLock::new(None),
            rules_updated: RwLock::new(None),
            shutdown_tx,
            config,
        }
    }

    /// Replace the scan engine.
    pub fn with_engine(mut self, engine: Arc<dyn ScanEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Replace the firewall backend.
    pub fn with_firewall(mut self, firewall: Arc<dyn FirewallControl>) -> Self {
        self.firewall = firewall;
        self
    }

    /// Replace the event emitter.
    pub fn with_emitter(mut self, events: Emitter) -> Self {
        self.events = Arc::new(events);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn current_state(&self) -> ProtectionState {
        self.state.current()
    }

    pub fn engine(&self) -> &Arc<dyn ScanEngine> {
        &self.engine
    }

    pub fn events(&self) -> &Emitter {
        &self.events
    }

    /// Move to `new` and emit a `state_change` event tagged with `reason`.
    pub fn transition(&self, new: ProtectionState, reason: &str) -> ProtectionState {
        let event = StateChangeEvent::start(new.as_str()).reason(reason);
        let old = self.state.set_state(new);
        info!(from = %old, to = %new, reason, "Protection state changed");
        self.events.emit(event.from_state(old.as_str()).end());
        old
    }

    pub fn firewall_enabled(&self) -> bool {
        self.firewall.enabled()
    }

    pub fn set_firewall_enabled(&self, enabled: bool) {
        self.firewall.set_enabled(enabled);
        info!(enabled, "Firewall toggled");
    }

    pub fn last_scan(&self) -> Option<DateTime<Utc>> {
        *self
            .last_scan
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_last_scan(&self, at: DateTime<Utc>) {
        *self
            .last_scan
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(at);
    }

    /// When signature rules were last refreshed. Nothing in the daemon
    /// updates rules itself; an updater reports through `set_rules_updated`.
    pub fn rules_updated(&self) -> Option<DateTime<Utc>> {
        *self
            .rules_updated
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_rules_updated(&self, at: DateTime<Utc>) {
        *self
            .rules_updated
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(at);
    }

    /// Probe the scan engine and emit a `health_check` event.
    ///
    /// Returns whether the engine answered.
    pub async fn health_check(&self) -> bool {
        let event = HealthCheckEvent::start();
        let available = self.engine.is_available().await;
        let firewall = self.firewall_enabled();
        if !available {
            warn!("Scan engine not reachable during health check");
        }
        self.events.emit(
            event
                .engine_available(available)
                .firewall_enabled(firewall)
                .version(&crate::build_info::version_string())
                .end(),
        );
        available
    }

    /// Serve IPC on the configured socket until shutdown or Ctrl-C.
    pub async fn run(self: &Arc<Self>) -> Result<(), DaemonError> {
        self.run_at(&self.config.daemon.socket_path).await
    }

    /// Serve IPC on `socket_path` until shutdown or Ctrl-C.
    pub async fn run_at(self: &Arc<Self>, socket_path: &Path) -> Result<(), DaemonError> {
        info!(
            socket = %socket_path.display(),
            version = %crate::build_info::version_string(),
            "Warden daemon starting"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let server = Arc::new(IpcServer::bind(socket_path, Arc::clone(self))?);

        let serve = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve().await })
        };
        let health = {
            let daemon = Arc::clone(self);
            let period = self.config.daemon.health_interval_secs;
            tokio::spawn(async move { daemon.health_loop(period).await })
        };

        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping daemon");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
            }
        }

        health.abort();
        server.close()?;
        if let Err(e) = serve.await {
            warn!(error = %e, "IPC accept loop ended abnormally");
        }

        info!("Daemon stopped");
        Ok(())
    }

    async fn health_loop(&self, period_secs: u64) {
        if period_secs == 0 {
            self.health_check().await;
            return;
        }
        // The first tick completes immediately, covering the startup check.
        let mut ticker = tokio::time::interval(Duration::from_secs(period_secs));
        loop {
            ticker.tick().await;
            self.health_check().await;
        }
    }

    /// Request a graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }
}

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ScanResult, Verdict};
    use crate::events::{EVENT_TARGET, fields};
    use crate::logging::LogCollector;
    use crate::BoxFuture;
    use pretty_assertions::assert_eq;
    use tracing_subscriber::layer::SubscriberExt;

    struct StaticEngine(bool);

    impl ScanEngine for StaticEngine {
        fn is_available(&self) -> BoxFuture<'_, bool> {
            Box::pin(async move { self.0 })
        }

        fn scan_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, ScanResult> {
            Box::pin(async move { ScanResult::new(path, Ok(Verdict::Clean)) })
        }
    }

    fn collecting_daemon(engine_up: bool) -> (Daemon, crate::logging::LogReader) {
        let collector = LogCollector::new(64);
        let reader = collector.reader();
        let dispatch = tracing::Dispatch::new(tracing_subscriber::registry().with(collector));
        let daemon = Daemon::new(AppConfig::default())
            .with_engine(Arc::new(StaticEngine(engine_up)))
            .with_emitter(Emitter::default().with_dispatch(dispatch));
        (daemon, reader)
    }

    #[tokio::test]
    async fn test_daemon_creation() {
        let daemon = Daemon::new(AppConfig::default());
        assert_eq!(daemon.current_state(), ProtectionState::Protected);
        assert!(!daemon.firewall_enabled());
        assert!(daemon.last_scan().is_none());
        assert!(daemon.rules_updated().is_none());
    }

    #[tokio::test]
    async fn test_daemon_shutdown() {
        let daemon = Daemon::new(AppConfig::default());
        // No run loop is listening; shutdown must not panic.
        daemon.shutdown();
    }

    #[test]
    fn test_firewall_initial_flag_from_config() {
        let mut config = AppConfig::default();
        config.firewall.enabled = true;
        let daemon = Daemon::new(config);
        assert!(daemon.firewall_enabled());
        daemon.set_firewall_enabled(false);
        assert!(!daemon.firewall_enabled());
    }

    #[test]
    fn test_transition_emits_state_change() {
        let (daemon, reader) = collecting_daemon(true);

        let old = daemon.transition(ProtectionState::Paused, "ipc:pause");
        assert_eq!(old, ProtectionState::Protected);
        assert_eq!(daemon.current_state(), ProtectionState::Paused);

        let records = reader.for_target(EVENT_TARGET);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("event_type"), Some("state_change"));
        let body = records[0].field("fields").unwrap();
        assert!(body.contains(r#""from_state":"protected""#));
        assert!(body.contains(r#""to_state":"paused""#));
        assert!(body.contains(r#""reason":"ipc:pause""#));
    }

    #[test]
    fn test_scan_timestamps() {
        let daemon = Daemon::new(AppConfig::default());
        let now = Utc::now();
        daemon.set_last_scan(now);
        daemon.set_rules_updated(now);
        assert_eq!(daemon.last_scan(), Some(now));
        assert_eq!(daemon.rules_updated(), Some(now));
    }

    #[tokio::test]
    async fn test_health_check_reports_engine() {
        let (daemon, reader) = collecting_daemon(false);
        assert!(!daemon.health_check().await);

        let records = reader.for_target(EVENT_TARGET);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("event_type"), Some("health_check"));
        let body = records[0].field("fields").unwrap();
        assert!(body.contains(&format!(r#""{}":false"#, fields::ENGINE_AVAILABLE)));
        assert!(body.contains(crate::build_info::VERSION));
    }
}
