//! End-to-end tests for the IPC server over a real Unix socket.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use warden_core::ipc::{
    Command, IpcClient, IpcError, IpcServer, Request, Response, StateChange, PROTOCOL_VERSION,
};
use warden_core::{Daemon, ProtectionState};
use warden_test_utils::config::TestConfigBuilder;
use warden_test_utils::daemon::TestServer;

async fn server() -> TestServer {
    TestServer::start(TestConfigBuilder::new().build()).await
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ── Basic commands ──────────────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_ping() {
    let server = server().await;
    let mut client = server.client().await;
    assert_eq!(client.ping().await.unwrap(), "pong");
}

#[test_log::test(tokio::test)]
async fn test_status_reflects_changes_from_other_connections() {
    let server = server().await;
    let mut a = server.client().await;
    let mut b = server.client().await;

    let before = a.status().await.unwrap();
    assert_eq!(before.state, ProtectionState::Protected);
    assert!(!before.firewall_enabled);
    assert_eq!(a.status().await.unwrap(), before);

    assert_eq!(b.set_firewall(true).await.unwrap(), "firewall enabled");
    assert_eq!(b.pause().await.unwrap(), "protection paused");

    let after = a.status().await.unwrap();
    assert_eq!(after.state, ProtectionState::Paused);
    assert!(after.firewall_enabled);
    assert!(a.firewall_status().await.unwrap().enabled);

    assert_eq!(b.resume().await.unwrap(), "protection resumed");
    assert_eq!(a.status().await.unwrap().state, ProtectionState::Protected);
}

#[test_log::test(tokio::test)]
async fn test_unknown_command_is_rejected() {
    let server = server().await;
    let mut client = server.client().await;
    let response = client
        .send_line("{\"id\":\"u1\",\"command\":\"reboot\",\"version\":1}\n")
        .await
        .unwrap();
    assert_eq!(response, Response::error("u1", "unknown command: reboot"));
}

// ── Protocol robustness ─────────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_malformed_json_keeps_connection_open() {
    let server = server().await;
    let mut client = server.client().await;

    let response = client.send_line("this is not json\n").await.unwrap();
    assert_eq!(response, Response::error("", "invalid JSON"));

    assert_eq!(client.ping().await.unwrap(), "pong");
}

#[test_log::test(tokio::test)]
async fn test_non_utf8_line_answered_and_connection_kept() {
    let server = server().await;
    let stream = UnixStream::connect(server.socket_path()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"{\"id\":\"1\",\"command\":\"p\xffng\"}\n")
        .await
        .unwrap();
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .expect("connection closed instead of replying");
    let response: Response = serde_json::from_str(&line).unwrap();
    assert_eq!(response, Response::error("", "invalid JSON"));

    write_half
        .write_all(b"{\"id\":\"2\",\"command\":\"ping\",\"version\":1}\n")
        .await
        .unwrap();
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .expect("connection dropped after a bad line");
    let response: Response = serde_json::from_str(&line).unwrap();
    assert_eq!(response, Response::ok("2", "pong"));
}

#[test_log::test(tokio::test)]
async fn test_null_version_is_legacy() {
    let server = server().await;
    let mut client = server.client().await;
    let response = client
        .send_line("{\"id\":\"n\",\"command\":\"ping\",\"version\":null}\n")
        .await
        .unwrap();
    assert_eq!(response, Response::ok("n", "pong"));
}

#[test_log::test(tokio::test)]
async fn test_protocol_versions() {
    let server = server().await;
    let mut client = server.client().await;

    let legacy = client
        .send(&Request::new("l", Command::Ping).with_version(0))
        .await
        .unwrap();
    assert!(legacy.success);

    let current = client.send(&Request::new("c", Command::Ping)).await.unwrap();
    assert!(current.success);

    let future = client
        .send(&Request::new("f", Command::Ping).with_version(PROTOCOL_VERSION + 41))
        .await
        .unwrap();
    assert!(!future.success);
    assert_eq!(future.id, "f");
    assert!(future.error.unwrap().contains("protocol version mismatch"));
}

#[test_log::test(tokio::test)]
async fn test_pipelined_requests_answered_in_order() {
    let server = server().await;
    let stream = UnixStream::connect(server.socket_path()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();

    let batch: String = (1..=5)
        .map(|i| format!("{{\"id\":\"{i}\",\"command\":\"status\",\"version\":1}}\n"))
        .collect();
    write_half.write_all(batch.as_bytes()).await.unwrap();

    let mut lines = BufReader::new(read_half).lines();
    for i in 1..=5 {
        let line = lines.next_line().await.unwrap().unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(response.id, i.to_string());
        assert!(response.success);
    }
}

// ── Push subscriptions ──────────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_subscriber_receives_transitions() {
    let server = server().await;
    let mut watcher = server.client().await;
    let mut actor = server.client().await;

    watcher.subscribe().await.unwrap();
    actor.pause().await.unwrap();
    actor.resume().await.unwrap();

    assert_eq!(
        watcher.next_event().await.unwrap(),
        StateChange {
            old_state: ProtectionState::Protected,
            new_state: ProtectionState::Paused,
        }
    );
    assert_eq!(
        watcher.next_event().await.unwrap(),
        StateChange {
            old_state: ProtectionState::Paused,
            new_state: ProtectionState::Protected,
        }
    );
}

#[test_log::test(tokio::test)]
async fn test_non_subscriber_gets_no_events() {
    let server = server().await;
    let mut quiet = server.client().await;
    let mut actor = server.client().await;

    quiet.ping().await.unwrap();
    actor.pause().await.unwrap();

    let waited = tokio::time::timeout(Duration::from_millis(200), quiet.next_event()).await;
    assert!(waited.is_err(), "unsubscribed connection received a push event");
}

#[test_log::test(tokio::test)]
async fn test_disconnected_subscriber_is_removed() {
    let server = server().await;
    let subscribers = Arc::clone(&server.server.state().subscribers);
    let mut actor = server.client().await;

    {
        let mut watcher = server.client().await;
        watcher.subscribe().await.unwrap();
        assert_eq!(subscribers.len(), 1);
    }

    assert!(eventually(|| subscribers.is_empty()).await);

    // Transitions with a departed subscriber still succeed.
    assert_eq!(actor.pause().await.unwrap(), "protection paused");
    assert_eq!(server.daemon.current_state(), ProtectionState::Paused);
}

// ── Lifecycle ───────────────────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_socket_is_world_accessible() {
    let server = server().await;
    let mode = std::fs::metadata(server.socket_path())
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o666);
}

#[test_log::test(tokio::test)]
async fn test_bind_replaces_stale_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("defense.sock");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"stale").unwrap();

    let daemon = Arc::new(Daemon::new(TestConfigBuilder::new().build()));
    let server = Arc::new(IpcServer::bind(&path, daemon).unwrap());
    let serve = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve().await })
    };

    let mut client = IpcClient::connect(&path).await.unwrap();
    assert_eq!(client.ping().await.unwrap(), "pong");

    server.close().unwrap();
    tokio::time::timeout(Duration::from_secs(2), serve)
        .await
        .expect("accept loop did not stop")
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn test_close_releases_listener() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("defense.sock");
    let daemon = Arc::new(Daemon::new(TestConfigBuilder::new().build()));
    let server = Arc::new(IpcServer::bind(&path, daemon).unwrap());
    // A second name for the same socket survives the unlink in `close`.
    let alias = dir.path().join("alias.sock");
    std::fs::hard_link(&path, &alias).unwrap();

    let serve = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve().await })
    };
    UnixStream::connect(&alias).await.unwrap();

    server.close().unwrap();
    tokio::time::timeout(Duration::from_secs(2), serve)
        .await
        .expect("accept loop did not stop")
        .unwrap();

    // The server value is still alive, but nothing is listening.
    let err = UnixStream::connect(&alias).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);

    // Serving a closed server returns at once.
    tokio::time::timeout(Duration::from_secs(1), server.serve())
        .await
        .expect("serve on a closed server blocked");
}

#[test_log::test(tokio::test)]
async fn test_close_removes_socket_and_ends_connections() {
    let server = server().await;
    let path = server.socket_path().to_path_buf();
    let mut client = server.client().await;
    client.ping().await.unwrap();

    server.server.close().unwrap();
    assert!(!path.exists());

    // The open connection's loop exits, so the next exchange fails.
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, IpcError::Closed | IpcError::Io(_)));

    assert!(matches!(
        IpcClient::connect(&path).await,
        Err(IpcError::NotRunning(_))
    ));
}
