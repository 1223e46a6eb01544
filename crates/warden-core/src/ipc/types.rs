//! Shared request/response types for daemon IPC.
//!
//! Every message is one JSON object on its own line. Requests carry an
//! opaque `id` that the matching response echoes; push events use the
//! reserved id [`EVENT_ID`]. Both the IPC server (daemon) and client (CLI)
//! use these types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::state::ProtectionState;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: i64 = 1;

/// Version sent by clients that predate negotiation; always accepted.
pub const LEGACY_VERSION: i64 = 0;

/// Response id reserved for server-initiated push events.
pub const EVENT_ID: &str = "event";

/// A client request.
///
/// Missing fields decode to their defaults, so `{"command":"ping"}` is a
/// legacy (version 0) ping with an empty id. A `null` version is legacy too. Unknown fields are kept in
/// `args` and ignored by every current command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, deserialize_with = "version_or_legacy")]
    pub version: i64,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

impl Request {
    /// A request at the current protocol version.
    pub fn new(id: impl Into<String>, command: Command) -> Self {
        Self {
            id: id.into(),
            command: command.as_str().to_string(),
            version: PROTOCOL_VERSION,
            args: Map::new(),
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }
}

fn version_or_legacy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or(LEGACY_VERSION))
}

/// The closed set of commands the daemon understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    Status,
    FirewallEnable,
    FirewallDisable,
    FirewallStatus,
    ScanQuick,
    ScanFull,
    Pause,
    Resume,
    Subscribe,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Ping,
        Command::Status,
        Command::FirewallEnable,
        Command::FirewallDisable,
        Command::FirewallStatus,
        Command::ScanQuick,
        Command::ScanFull,
        Command::Pause,
        Command::Resume,
        Command::Subscribe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Status => "status",
            Command::FirewallEnable => "firewall_enable",
            Command::FirewallDisable => "firewall_disable",
            Command::FirewallStatus => "firewall_status",
            Command::ScanQuick => "scan_quick",
            Command::ScanFull => "scan_full",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown command: {s}"))
    }
}

/// A response or push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A successful response carrying `data`.
    pub fn ok(id: &str, data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                id: id.to_string(),
                success: true,
                data,
                error: None,
            },
            Err(e) => Self::error(id, format!("failed to encode response: {e}")),
        }
    }

    /// A failed response.
    pub fn error(id: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            success: false,
            data: Value::Null,
            error: Some(message.into()),
        }
    }

    /// A push event announcing a state transition.
    pub fn event(change: &StateChange) -> Self {
        Self::ok(EVENT_ID, change)
    }

    pub fn is_event(&self) -> bool {
        self.id == EVENT_ID
    }

    /// Decode `data` into a typed payload.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    /// Size in bytes of the encoded `data` payload; 0 when there is none.
    pub fn data_len(&self) -> usize {
        if self.data.is_null() {
            0
        } else {
            self.data.to_string().len()
        }
    }

    /// Encode as one newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// `status` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: ProtectionState,
    pub firewall_enabled: bool,
    pub last_scan: Option<DateTime<Utc>>,
    pub rules_updated: Option<DateTime<Utc>>,
}

/// `firewall_status` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallStatus {
    pub enabled: bool,
}

/// `scan_quick` / `scan_full` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStarted {
    pub job_id: String,
}

/// Push event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub old_state: ProtectionState,
    pub new_state: ProtectionState,
}
