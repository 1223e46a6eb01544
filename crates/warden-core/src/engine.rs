//! Client for the local scan-engine daemon.
//!
//! Speaks the engine's line protocol over a unix socket: `PING` answered by
//! `PONG`, and `SCAN <path>` answered by one verdict line. Every call opens a
//! fresh connection and runs under its own deadline.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;
use warden_config::ScanningConfig;

use crate::BoxFuture;

/// Deadline for establishing a connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default deadline for a liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default deadline for scanning one file.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors talking to the scan engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("connect to scan engine at {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("send {command}: {source}")]
    Send {
        command: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("read reply: {0}")]
    Read(#[source] io::Error),

    #[error("scan engine closed the connection without replying")]
    Closed,

    #[error("scan engine timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("path cannot be sent to the scan engine: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("scan engine error: {0}")]
    Engine(String),
}

/// A successfully parsed scan reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// `<path>: OK`
    Clean,
    /// `<path>: <threat> FOUND`
    Infected { threat: String },
    /// Any line that is none of the known shapes.
    Unrecognized { line: String },
}

/// Classify one reply line from a `SCAN` command.
pub fn parse_scan_reply(line: &str) -> Result<Verdict, EngineError> {
    let line = line.trim();
    if line.ends_with(" OK") {
        return Ok(Verdict::Clean);
    }
    if let Some(head) = line.strip_suffix(" FOUND") {
        let threat = match head.rsplit_once(": ") {
            Some((_, name)) => name,
            None => head,
        };
        return Ok(Verdict::Infected {
            threat: threat.to_string(),
        });
    }
    if line.contains("ERROR") {
        return Err(EngineError::Engine(line.to_string()));
    }
    Ok(Verdict::Unrecognized {
        line: line.to_string(),
    })
}

/// Outcome of scanning one file.
#[derive(Debug)]
pub struct ScanResult {
    pub path: PathBuf,
    pub outcome: Result<Verdict, EngineError>,
    pub scanned_at: DateTime<Utc>,
}

impl ScanResult {
    /// Record `outcome` for `path`, stamped now.
    pub fn new(path: &Path, outcome: Result<Verdict, EngineError>) -> Self {
        Self {
            path: path.to_path_buf(),
            outcome,
            scanned_at: Utc::now(),
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self.outcome, Ok(Verdict::Clean))
    }

    /// Threat name, if the engine reported one.
    pub fn threat(&self) -> Option<&str> {
        match &self.outcome {
            Ok(Verdict::Infected { threat }) => Some(threat),
            _ => None,
        }
    }

    /// Protocol, transport or engine-reported failure.
    pub fn error(&self) -> Option<&EngineError> {
        self.outcome.as_ref().err()
    }
}

/// Something that can check files for malware.
///
/// [`EngineClient`] is the production implementation.
pub trait ScanEngine: Send + Sync {
    /// True when the engine is reachable and answers a liveness probe.
    fn is_available(&self) -> BoxFuture<'_, bool>;

    /// Scan one file. Failures are reported in the result, never by panicking.
    fn scan_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, ScanResult>;
}

/// Line-protocol client for a clamd-style daemon.
#[derive(Debug, Clone)]
pub struct EngineClient {
    socket_path: PathBuf,
    probe_timeout: Duration,
    scan_timeout: Duration,
}

impl EngineClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            probe_timeout: PROBE_TIMEOUT,
            scan_timeout: SCAN_TIMEOUT,
        }
    }

    pub fn from_config(config: &ScanningConfig) -> Self {
        Self::new(config.engine_socket.clone())
            .with_timeouts(config.probe_timeout(), config.scan_timeout())
    }

    pub fn with_timeouts(mut self, probe: Duration, scan: Duration) -> Self {
        self.probe_timeout = probe;
        self.scan_timeout = scan;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send `PING` and require `PONG`.
    pub async fn probe(&self) -> Result<(), EngineError> {
        let reply = self
            .exchange("PING", b"PING\n".to_vec(), self.probe_timeout)
            .await?;
        if reply.trim() == "PONG" {
            Ok(())
        } else {
            Err(EngineError::UnexpectedReply(reply.trim().to_string()))
        }
    }

    /// Socket exists and the probe succeeds.
    pub async fn available(&self) -> bool {
        if !self.socket_path.exists() {
            return false;
        }
        match self.probe().await {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Scan engine probe failed"
                );
                false
            }
        }
    }

    /// Send `SCAN <path>` and classify the reply.
    pub async fn scan(&self, path: &Path) -> ScanResult {
        let outcome = match scan_command(path) {
            Ok(command) => match self.exchange("SCAN", command, self.scan_timeout).await {
                Ok(reply) => parse_scan_reply(&reply),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        ScanResult::new(path, outcome)
    }

    async fn exchange(
        &self,
        name: &'static str,
        command: Vec<u8>,
        deadline: Duration,
    ) -> Result<String, EngineError> {
        let connect = UnixStream::connect(&self.socket_path);
        let stream = timeout(CONNECT_TIMEOUT.min(deadline), connect)
            .await
            .map_err(|_| EngineError::Timeout(CONNECT_TIMEOUT.min(deadline)))?
            .map_err(|source| EngineError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;

        let io = async move {
            let mut reader = BufReader::new(stream);
            reader
                .get_mut()
                .write_all(&command)
                .await
                .map_err(|source| EngineError::Send {
                    command: name,
                    source,
                })?;

            // Replies echo the path, which need not be UTF-8.
            let mut line = Vec::new();
            let n = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(EngineError::Read)?;
            if n == 0 {
                return Err(EngineError::Closed);
            }
            Ok(String::from_utf8_lossy(&line).into_owned())
        };
        timeout(deadline, io)
            .await
            .map_err(|_| EngineError::Timeout(deadline))?
    }
}

impl ScanEngine for EngineClient {
    fn is_available(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.available())
    }

    fn scan_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, ScanResult> {
        Box::pin(self.scan(path))
    }
}

/// `SCAN <raw path bytes>\n`. Only line breaks make a path unsendable.
fn scan_command(path: &Path) -> Result<Vec<u8>, EngineError> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.iter().any(|b| matches!(b, b'\n' | b'\r')) {
        return Err(EngineError::InvalidPath(path.to_path_buf()));
    }
    let mut command = Vec::with_capacity(bytes.len() + 6);
    command.extend_from_slice(b"SCAN ");
    command.extend_from_slice(bytes);
    command.push(b'\n');
    Ok(command)
}
