//! Wide-event pipeline.
//!
//! Every logical operation (one IPC request, one scan job, one state
//! transition, one detected threat) produces exactly one [`Event`]. Builders
//! in [`builder`] accumulate context while the operation runs; the
//! [`Emitter`] decides whether the finished event is worth a log record and
//! renders it through `tracing`.

pub mod builder;
pub mod emitter;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

pub use builder::{
    EventBuilder, HealthCheckEvent, IpcRequestEvent, ScanEvent, StateChangeEvent, ThreatEvent,
};
pub use emitter::{Emitter, EVENT_TARGET};

/// The kind of operation an [`Event`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Scan,
    IpcRequest,
    StateChange,
    ThreatDetected,
    HealthCheck,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Scan => "scan",
            EventType::IpcRequest => "ipc_request",
            EventType::StateChange => "state_change",
            EventType::ThreatDetected => "threat_detected",
            EventType::HealthCheck => "health_check",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One canonical record for one logical operation.
///
/// Built by [`EventBuilder::end`]; immutable afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub operation_id: String,
    pub component: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    pub duration: Duration,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl Event {
    /// Duration in whole milliseconds.
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Look up an operation-specific field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Field names shared by all event producers.
pub mod fields {
    pub const SCAN_TYPE: &str = "scan_type";
    pub const JOB_ID: &str = "job_id";
    pub const PATH: &str = "path";
    pub const FILES_SCANNED: &str = "files_scanned";
    pub const THREATS_FOUND: &str = "threats_found";
    pub const FILES_SKIPPED: &str = "files_skipped";
    pub const FILE_SIZE_BYTES: &str = "file_size_bytes";
    pub const COMMAND: &str = "command";
    pub const REQUEST_ID: &str = "request_id";
    pub const CLIENT_VERSION: &str = "client_version";
    pub const RESPONSE_SIZE: &str = "response_size_bytes";
    pub const FROM_STATE: &str = "from_state";
    pub const TO_STATE: &str = "to_state";
    pub const REASON: &str = "reason";
    pub const THREAT_NAME: &str = "threat_name";
    pub const ACTION: &str = "action";
    pub const ENGINE_AVAILABLE: &str = "engine_available";
    pub const FIREWALL_ENABLED: &str = "firewall_enabled";
    pub const VERSION: &str = "version";
}
