//! A scripted stand-in for the external scan engine.
//!
//! [`MockEngine`] listens on a Unix socket in its own temp directory and
//! answers each command line with whatever the supplied closure returns.
//! It speaks the same one-command-per-connection protocol as the real
//! engine, so it exercises the production client end to end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

enum Mode {
    Reply(Responder),
    Silent,
}

/// A scan engine socket with scripted replies.
///
/// The listener task and socket directory are torn down on drop.
pub struct MockEngine {
    socket_path: PathBuf,
    task: JoinHandle<()>,
    _temp_dir: TempDir,
}

impl MockEngine {
    /// Answer each command (without its trailing newline, non-UTF-8 bytes
    /// replaced) with `respond`.
    ///
    /// `None` closes the connection without replying.
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self::spawn(Mode::Reply(Arc::new(respond)))
    }

    /// Accept connections and read commands but never reply.
    pub async fn silent() -> Self {
        Self::spawn(Mode::Silent)
    }

    /// Behave like a healthy engine: `PING` gets `PONG`, and a `SCAN` of
    /// any path whose file name contains `eicar` reports a threat.
    pub async fn clamd() -> Self {
        Self::start(|line| {
            if line == "PING" {
                return Some("PONG".to_string());
            }
            let path = line.strip_prefix("SCAN ")?;
            let name = Path::new(path).file_name()?.to_string_lossy();
            if name.contains("eicar") {
                Some(format!("{path}: Eicar-Test-Signature FOUND"))
            } else {
                Some(format!("{path}: OK"))
            }
        })
        .await
    }

    fn spawn(mode: Mode) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let socket_path = temp_dir.path().join("clamd.ctl");
        let listener = UnixListener::bind(&socket_path).expect("failed to bind mock engine");
        let mode = Arc::new(mode);

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_one(stream, Arc::clone(&mode)));
            }
        });

        Self {
            socket_path,
            task,
            _temp_dir: temp_dir,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(stream: UnixStream, mode: Arc<Mode>) {
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    if reader.read_until(b'\n', &mut raw).await.unwrap_or(0) == 0 {
        return;
    }
    // Paths are raw bytes on the wire; responders see them lossily decoded.
    let line = String::from_utf8_lossy(&raw);
    match mode.as_ref() {
        Mode::Reply(respond) => {
            if let Some(mut reply) = respond(line.trim_end()) {
                if !reply.ends_with('\n') {
                    reply.push('\n');
                }
                let _ = reader.get_mut().write_all(reply.as_bytes()).await;
            }
        }
        Mode::Silent => {
            // Hold the connection until the client gives up.
            let mut sink = Vec::new();
            let _ = reader.read_to_end(&mut sink).await;
        }
    }
}
