//! Daemon test helpers.
//!
//! [`TestServer`] binds a real IPC server on a socket inside a temp
//! directory and serves it on a background task, so integration tests can
//! drive the daemon through [`IpcClient`] exactly as the CLI does.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use warden_config::AppConfig;
use warden_core::engine::ScanEngine;
use warden_core::events::Emitter;
use warden_core::ipc::{IpcClient, IpcServer};
use warden_core::Daemon;

/// A served daemon with an owned temp directory for its socket.
///
/// The server is closed and the temp directory deleted when this value is
/// dropped, guaranteeing cleanup even on panic.
pub struct TestServer {
    pub daemon: Arc<Daemon>,
    pub server: Arc<IpcServer>,
    serve: JoinHandle<()>,
    _temp_dir: TempDir,
}

impl TestServer {
    /// Serve a daemon built from `config`. The socket path in `config` is
    /// replaced by one inside a fresh temp directory.
    pub async fn start(config: AppConfig) -> Self {
        Self::start_with(config, |daemon| daemon).await
    }

    /// Serve with a custom scan engine and event emitter.
    pub async fn with_engine_and_emitter(
        config: AppConfig,
        engine: Arc<dyn ScanEngine>,
        emitter: Emitter,
    ) -> Self {
        Self::start_with(config, move |daemon| {
            daemon.with_engine(engine).with_emitter(emitter)
        })
        .await
    }

    async fn start_with(mut config: AppConfig, customize: impl FnOnce(Daemon) -> Daemon) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        config.daemon.socket_path = temp_dir.path().join("run").join("defense.sock");

        let daemon = Arc::new(customize(Daemon::new(config)));
        let server = Arc::new(
            IpcServer::bind(&daemon.config().daemon.socket_path, Arc::clone(&daemon))
                .expect("failed to bind test IPC server"),
        );
        let serve = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve().await })
        };

        Self {
            daemon,
            server,
            serve,
            _temp_dir: temp_dir,
        }
    }

    pub fn socket_path(&self) -> &Path {
        self.server.socket_path()
    }

    /// Open a new client connection.
    pub async fn client(&self) -> IpcClient {
        IpcClient::connect(self.socket_path())
            .await
            .expect("failed to connect to test server")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.server.close();
        self.serve.abort();
    }
}
