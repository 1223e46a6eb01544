//! IPC client: connects to the daemon over a Unix domain socket.
//!
//! Provides a typed client for the CLI. Requests on one connection are
//! strictly paired with responses, so the client reads until it sees the
//! next non-event message. Push events that arrive in between are buffered
//! and handed out by [`IpcClient::next_event`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

use super::IpcError;
use super::types::*;
use crate::scan::ScanType;

/// Client for communicating with the warden daemon via Unix socket.
pub struct IpcClient {
    socket_path: PathBuf,
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
    pending: VecDeque<StateChange>,
}

impl IpcClient {
    /// Connect to the daemon listening on `socket_path`.
    pub async fn connect(socket_path: impl Into<PathBuf>) -> Result<Self, IpcError> {
        let socket_path = socket_path.into();
        if !socket_path.exists() {
            return Err(IpcError::NotRunning(socket_path));
        }
        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|source| IpcError::Connect {
                path: socket_path.clone(),
                source,
            })?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            socket_path,
            reader: BufReader::new(read_half).lines(),
            writer,
            next_id: 1,
            pending: VecDeque::new(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send `command` with a fresh id and return the daemon's response,
    /// whether or not it reports success.
    pub async fn request(&mut self, command: Command) -> Result<Response, IpcError> {
        let id = self.next_id.to_string();
        self.next_id += 1;
        self.send(&Request::new(id, command)).await
    }

    /// Send an arbitrary request.
    pub async fn send(&mut self, request: &Request) -> Result<Response, IpcError> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.send_line(&line).await
    }

    /// Write `line` verbatim and read the response to it.
    pub async fn send_line(&mut self, line: &str) -> Result<Response, IpcError> {
        debug!(request = line.trim_end(), "IPC request");
        self.writer.write_all(line.as_bytes()).await?;
        loop {
            let message = self.read_message().await?;
            if message.is_event() {
                self.buffer_event(&message);
                continue;
            }
            return Ok(message);
        }
    }

    /// Wait for the next push event. Requires a prior [`subscribe`](Self::subscribe).
    pub async fn next_event(&mut self) -> Result<StateChange, IpcError> {
        loop {
            if let Some(change) = self.pending.pop_front() {
                return Ok(change);
            }
            let message = self.read_message().await?;
            if message.is_event() {
                self.buffer_event(&message);
            } else {
                debug!(id = %message.id, "Discarding unsolicited response");
            }
        }
    }

    async fn read_message(&mut self) -> Result<Response, IpcError> {
        match self.reader.next_line().await? {
            Some(line) => Ok(serde_json::from_str(&line)?),
            None => Err(IpcError::Closed),
        }
    }

    fn buffer_event(&mut self, message: &Response) {
        match message.data_as::<StateChange>() {
            Ok(change) => self.pending.push_back(change),
            Err(e) => warn!(error = %e, "Ignoring malformed push event"),
        }
    }

    async fn call<T: DeserializeOwned>(&mut self, command: Command) -> Result<T, IpcError> {
        let response = self.request(command).await?;
        if !response.success {
            return Err(IpcError::Daemon(response.error.unwrap_or_default()));
        }
        Ok(response.data_as()?)
    }

    // ── Typed API methods ──────────────────────────────────────────────

    /// Liveness check; returns the daemon's reply (`"pong"`).
    pub async fn ping(&mut self) -> Result<String, IpcError> {
        self.call(Command::Ping).await
    }

    pub async fn status(&mut self) -> Result<StatusReport, IpcError> {
        self.call(Command::Status).await
    }

    pub async fn firewall_status(&mut self) -> Result<FirewallStatus, IpcError> {
        self.call(Command::FirewallStatus).await
    }

    /// Turn the firewall on or off; returns the daemon's confirmation.
    pub async fn set_firewall(&mut self, enabled: bool) -> Result<String, IpcError> {
        let command = if enabled {
            Command::FirewallEnable
        } else {
            Command::FirewallDisable
        };
        self.call(command).await
    }

    /// Start a scan job; returns its id once the daemon has accepted it.
    pub async fn scan(&mut self, scan_type: ScanType) -> Result<ScanStarted, IpcError> {
        let command = match scan_type {
            ScanType::Quick => Command::ScanQuick,
            ScanType::Full => Command::ScanFull,
        };
        self.call(command).await
    }

    pub async fn pause(&mut self) -> Result<String, IpcError> {
        self.call(Command::Pause).await
    }

    pub async fn resume(&mut self) -> Result<String, IpcError> {
        self.call(Command::Resume).await
    }

    /// Register this connection for push events.
    pub async fn subscribe(&mut self) -> Result<(), IpcError> {
        let _: String = self.call(Command::Subscribe).await?;
        Ok(())
    }
}
