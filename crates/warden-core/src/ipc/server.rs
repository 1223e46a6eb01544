//! IPC server: newline-delimited JSON over a Unix domain socket.
//!
//! Each accepted connection gets a reader loop and a writer task joined by
//! a bounded queue. Responses and push events both go through that queue,
//! so a connection sees its responses in request order and a stalled client
//! only ever blocks its own reader.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::broadcast::{Broadcaster, SubscriberId};
use super::types::*;
use super::IpcError;
use crate::daemon::Daemon;
use crate::events::IpcRequestEvent;
use crate::scan::{ScanOrchestrator, ScanPolicy, ScanType};
use crate::state::{ProtectionState, StateObserver};

/// Lines queued for one connection's writer.
const OUTBOUND_QUEUE: usize = 64;

/// Socket file mode; clients run as other users than the daemon.
const SOCKET_MODE: u32 = 0o666;

/// Shared state accessible to all command handlers.
pub struct IpcState {
    pub daemon: Arc<Daemon>,
    pub scans: ScanOrchestrator,
    pub subscribers: Arc<Broadcaster<String>>,
}

impl IpcState {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        let policy = ScanPolicy::from_config(&daemon.config().scanning);
        Self {
            scans: ScanOrchestrator::new(Arc::clone(&daemon), policy),
            subscribers: Arc::new(Broadcaster::new()),
            daemon,
        }
    }

    /// Forward every state transition to the subscriber set.
    fn attach_broadcast(&self) {
        self.daemon.state().on_change(Arc::new(BroadcastObserver {
            subscribers: Arc::downgrade(&self.subscribers),
        }));
    }
}

/// The requesting side of a dispatch: who asked and where pushes go.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: SubscriberId,
    pub outbound: mpsc::Sender<String>,
}

struct BroadcastObserver {
    subscribers: Weak<Broadcaster<String>>,
}

impl StateObserver for BroadcastObserver {
    fn on_transition(&self, old: ProtectionState, new: ProtectionState) {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return;
        };
        let change = StateChange {
            old_state: old,
            new_state: new,
        };
        match Response::event(&change).to_line() {
            Ok(line) => {
                let delivered = subscribers.broadcast_all(&line);
                debug!(old = %old, new = %new, delivered, "State change pushed");
            }
            Err(e) => warn!(error = %e, "Failed to encode state change event"),
        }
    }
}

/// A bound IPC listener.
pub struct IpcServer {
    socket_path: PathBuf,
    // Taken by `serve` while accepting; `None` once closed.
    listener: Mutex<Option<UnixListener>>,
    state: Arc<IpcState>,
    shutdown_tx: watch::Sender<bool>,
    next_conn: AtomicU64,
}

impl IpcServer {
    /// Bind `socket_path`, replacing any stale socket file.
    ///
    /// Creates the parent directory if needed and opens the socket to all
    /// local users. Must be called from within a tokio runtime.
    pub fn bind(socket_path: &Path, daemon: Arc<Daemon>) -> Result<Self, IpcError> {
        let bind_err = |source| IpcError::Bind {
            path: socket_path.to_path_buf(),
            source,
        };

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }
        match std::fs::remove_file(socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }

        let listener = UnixListener::bind(socket_path).map_err(bind_err)?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(bind_err)?;

        let state = Arc::new(IpcState::new(daemon));
        state.attach_broadcast();

        let (shutdown_tx, _) = watch::channel(false);
        info!(path = %socket_path.display(), "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener: Mutex::new(Some(listener)),
            state,
            shutdown_tx,
            next_conn: AtomicU64::new(1),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn take_listener(&self) -> Option<UnixListener> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub fn state(&self) -> &Arc<IpcState> {
        &self.state
    }

    /// Accept connections until [`close`](Self::close) is called, then drop
    /// the listener.
    ///
    /// Returns at once if the server is already closed or another task is
    /// serving it.
    pub async fn serve(&self) {
        let Some(listener) = self.take_listener() else {
            debug!("IPC server has no listener to serve");
            return;
        };
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
                        debug!(conn = id, "Client connected");
                        tokio::spawn(handle_connection(
                            stream,
                            id,
                            Arc::clone(&self.state),
                            self.shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
        drop(listener);
        info!("IPC server stopped accepting connections");
    }

    /// Stop accepting, end every connection loop, and remove the socket file.
    ///
    /// An idle listener is closed here; one held by [`serve`](Self::serve)
    /// is closed as soon as the accept loop sees the signal.
    pub fn close(&self) -> Result<(), IpcError> {
        self.shutdown_tx.send_replace(true);
        drop(self.take_listener());
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(IpcError::Io(e)),
        }
        info!(path = %self.socket_path.display(), "IPC server closed");
        Ok(())
    }
}

async fn handle_connection(
    stream: UnixStream,
    conn_id: SubscriberId,
    state: Arc<IpcState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    let writer = {
        let subscribers = Arc::clone(&state.subscribers);
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    debug!(conn = conn_id, error = %e, "Write failed");
                    subscribers.remove(conn_id);
                    break;
                }
            }
        })
    };

    let conn = Connection {
        id: conn_id,
        outbound: tx,
    };
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        // Raw bytes: a line that is not UTF-8 is a bad request, not a dead peer.
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(conn = conn_id, error = %e, "Read failed");
                    break;
                }
            },
        }

        let response = handle_line(&state, &buf, &conn);
        let encoded = match response.to_line() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(conn = conn_id, error = %e, "Failed to encode response");
                break;
            }
        };
        if conn.outbound.send(encoded).await.is_err() {
            break;
        }
    }

    state.subscribers.remove(conn_id);
    drop(conn);
    let _ = writer.await;
    debug!(conn = conn_id, "Client disconnected");
}

// ── Command handlers ────────────────────────────────────────────────────

/// Decode one line and dispatch it. Malformed input, including bytes that
/// are not UTF-8, yields an `invalid JSON` error response with an empty id.
pub fn handle_line(state: &IpcState, line: &[u8], conn: &Connection) -> Response {
    match serde_json::from_slice::<Request>(line) {
        Ok(request) => dispatch(state, &request, conn),
        Err(e) => {
            debug!(conn = conn.id, error = %e, "Malformed request");
            let response = Response::error("", "invalid JSON");
            state
                .daemon
                .events()
                .emit(IpcRequestEvent::start("", "").error("invalid JSON").end());
            response
        }
    }
}

/// Check the protocol version, run the command, and report the request as
/// an `ipc_request` event.
pub fn dispatch(state: &IpcState, request: &Request, conn: &Connection) -> Response {
    let event = IpcRequestEvent::start(&request.command, &request.id)
        .client_version(request.version);

    let response = respond(state, request, conn);

    let event = event.response_size(response.data_len());
    let event = match &response.error {
        Some(message) => event.error(message),
        None => event,
    };
    state.daemon.events().emit(event.end());
    response
}

fn respond(state: &IpcState, request: &Request, conn: &Connection) -> Response {
    let id = request.id.as_str();
    if request.version != LEGACY_VERSION && request.version != PROTOCOL_VERSION {
        return Response::error(
            id,
            format!(
                "protocol version mismatch: client={}, server={}",
                request.version, PROTOCOL_VERSION
            ),
        );
    }

    let command = match request.command.parse::<Command>() {
        Ok(command) => command,
        Err(message) => return Response::error(id, message),
    };

    match command {
        Command::Ping => Response::ok(id, "pong"),
        Command::Status => handle_status(state, id),
        Command::FirewallEnable => {
            state.daemon.set_firewall_enabled(true);
            Response::ok(id, "firewall enabled")
        }
        Command::FirewallDisable => {
            state.daemon.set_firewall_enabled(false);
            Response::ok(id, "firewall disabled")
        }
        Command::FirewallStatus => Response::ok(
            id,
            FirewallStatus {
                enabled: state.daemon.firewall_enabled(),
            },
        ),
        Command::ScanQuick => handle_scan(state, id, ScanType::Quick),
        Command::ScanFull => handle_scan(state, id, ScanType::Full),
        Command::Pause => {
            state.daemon.transition(ProtectionState::Paused, "ipc:pause");
            Response::ok(id, "protection paused")
        }
        Command::Resume => {
            state
                .daemon
                .transition(ProtectionState::Protected, "ipc:resume");
            Response::ok(id, "protection resumed")
        }
        Command::Subscribe => {
            state.subscribers.add(conn.id, conn.outbound.clone());
            Response::ok(id, "subscribed")
        }
    }
}

fn handle_status(state: &IpcState, id: &str) -> Response {
    let daemon = &state.daemon;
    Response::ok(
        id,
        StatusReport {
            state: daemon.current_state(),
            firewall_enabled: daemon.firewall_enabled(),
            last_scan: daemon.last_scan(),
            rules_updated: daemon.rules_updated(),
        },
    )
}

fn handle_scan(state: &IpcState, id: &str, scan_type: ScanType) -> Response {
    match state.scans.start(scan_type) {
        Ok(job_id) => Response::ok(id, ScanStarted { job_id }),
        Err(e) => Response::error(id, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EVENT_TARGET, Emitter};
    use crate::logging::{LogCollector, LogReader};
    use pretty_assertions::assert_eq;
    use tracing_subscriber::layer::SubscriberExt;
    use warden_config::AppConfig;

    fn test_state() -> (IpcState, LogReader) {
        let collector = LogCollector::new(64);
        let reader = collector.reader();
        let dispatch = tracing::Dispatch::new(tracing_subscriber::registry().with(collector));
        let daemon = Daemon::new(AppConfig::default())
            .with_emitter(Emitter::default().with_dispatch(dispatch));
        let state = IpcState::new(Arc::new(daemon));
        state.attach_broadcast();
        (state, reader)
    }

    fn conn(id: SubscriberId) -> (Connection, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(8);
        (Connection { id, outbound }, rx)
    }

    fn request(id: &str, command: Command) -> Request {
        Request::new(id, command)
    }

    // ── Commands ────────────────────────────────────────────────────

    #[test]
    fn test_ping() {
        let (state, _) = test_state();
        let (c, _rx) = conn(1);
        let resp = dispatch(&state, &request("1", Command::Ping), &c);
        assert_eq!(resp, Response::ok("1", "pong"));
    }

    #[test]
    fn test_status_is_idempotent() {
        let (state, _) = test_state();
        let (c, _rx) = conn(1);
        let first = dispatch(&state, &request("s", Command::Status), &c);
        let second = dispatch(&state, &request("s", Command::Status), &c);
        assert_eq!(first, second);

        let report: StatusReport = first.data_as().unwrap();
        assert_eq!(report.state, ProtectionState::Protected);
        assert!(!report.firewall_enabled);
        assert!(report.last_scan.is_none());
    }

    #[test]
    fn test_firewall_commands() {
        let (state, _) = test_state();
        let (c, _rx) = conn(1);

        let resp = dispatch(&state, &request("1", Command::FirewallEnable), &c);
        assert_eq!(resp.data, serde_json::json!("firewall enabled"));
        let resp = dispatch(&state, &request("2", Command::FirewallStatus), &c);
        assert_eq!(resp.data_as::<FirewallStatus>().unwrap(), FirewallStatus { enabled: true });

        let resp = dispatch(&state, &request("3", Command::FirewallDisable), &c);
        assert_eq!(resp.data, serde_json::json!("firewall disabled"));
        assert!(!state.daemon.firewall_enabled());
    }

    #[test]
    fn test_pause_and_resume() {
        let (state, _) = test_state();
        let (c, _rx) = conn(1);

        let resp = dispatch(&state, &request("p", Command::Pause), &c);
        assert_eq!(resp.data, serde_json::json!("protection paused"));
        assert_eq!(state.daemon.current_state(), ProtectionState::Paused);

        let resp = dispatch(&state, &request("r", Command::Resume), &c);
        assert_eq!(resp.data, serde_json::json!("protection resumed"));
        assert_eq!(state.daemon.current_state(), ProtectionState::Protected);
    }

    #[test]
    fn test_unknown_command() {
        let (state, _) = test_state();
        let (c, _rx) = conn(1);
        let req = Request {
            id: "x".to_string(),
            command: "self_destruct".to_string(),
            version: PROTOCOL_VERSION,
            ..Default::default()
        };
        let resp = dispatch(&state, &req, &c);
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("unknown command: self_destruct"));
    }

    // ── Protocol version ────────────────────────────────────────────

    #[test]
    fn test_version_negotiation() {
        let (state, _) = test_state();
        let (c, _rx) = conn(1);

        let legacy = request("a", Command::Ping).with_version(LEGACY_VERSION);
        assert!(dispatch(&state, &legacy, &c).success);

        let current = request("b", Command::Ping);
        assert!(dispatch(&state, &current, &c).success);

        let future = request("c", Command::Ping).with_version(PROTOCOL_VERSION + 1);
        let resp = dispatch(&state, &future, &c);
        assert!(!resp.success);
        assert_eq!(resp.id, "c");
        assert_eq!(
            resp.error.as_deref(),
            Some("protocol version mismatch: client=2, server=1")
        );
    }

    #[test]
    fn test_malformed_line() {
        let (state, reader) = test_state();
        let (c, _rx) = conn(1);
        let resp = handle_line(&state, b"{not json", &c);
        assert_eq!(resp, Response::error("", "invalid JSON"));

        let records = reader.for_target(EVENT_TARGET);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("event_type"), Some("ipc_request"));
        assert_eq!(records[0].field("error"), Some("invalid JSON"));
    }

    #[test]
    fn test_non_utf8_line_is_invalid_json() {
        let (state, _) = test_state();
        let (c, _rx) = conn(1);
        let resp = handle_line(&state, b"{\"id\":\"1\",\"command\":\"p\xffng\"}\n", &c);
        assert_eq!(resp, Response::error("", "invalid JSON"));
    }

    #[test]
    fn test_null_version_accepted() {
        let (state, _) = test_state();
        let (c, _rx) = conn(1);
        let resp = handle_line(&state, br#"{"id":"v","command":"ping","version":null}"#, &c);
        assert_eq!(resp, Response::ok("v", "pong"));
    }

    // ── Events ──────────────────────────────────────────────────────

    #[test]
    fn test_every_request_is_reported() {
        let (state, reader) = test_state();
        let (c, _rx) = conn(1);
        dispatch(&state, &request("1", Command::Ping), &c);
        dispatch(
            &state,
            &request("2", Command::Ping).with_version(99),
            &c,
        );

        let records = reader.for_target(EVENT_TARGET);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field("success"), Some("true"));
        let body = records[0].field("fields").unwrap();
        assert!(body.contains(r#""command":"ping""#));
        assert!(body.contains(r#""request_id":"1""#));
        assert!(body.contains(r#""response_size_bytes":6"#));
        assert_eq!(records[1].field("success"), Some("false"));
    }

    // ── Subscriptions ───────────────────────────────────────────────

    #[test]
    fn test_subscribe_receives_transitions() {
        let (state, _) = test_state();
        let (subscriber, mut pushes) = conn(1);
        let (other, mut quiet) = conn(2);

        let resp = dispatch(&state, &request("s", Command::Subscribe), &subscriber);
        assert_eq!(resp.data, serde_json::json!("subscribed"));
        assert!(state.subscribers.contains(1));

        dispatch(&state, &request("p", Command::Pause), &other);

        let line = pushes.try_recv().unwrap();
        let event: Response = serde_json::from_str(line.trim_end()).unwrap();
        assert!(event.is_event());
        assert_eq!(
            event.data_as::<StateChange>().unwrap(),
            StateChange {
                old_state: ProtectionState::Protected,
                new_state: ProtectionState::Paused,
            }
        );
        assert!(quiet.try_recv().is_err());
    }
}
