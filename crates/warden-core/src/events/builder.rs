//! Fluent builders that accumulate context for one operation.
//!
//! A builder is started when the operation begins and consumed by `end()`
//! when it finishes, so each operation yields exactly one [`Event`].

use std::fmt;
use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};

use super::{fields, Event, EventType};

/// Generic event builder. Typed wrappers below fix the type and component.
#[derive(Debug)]
#[must_use = "an event is only produced by calling `end()`"]
pub struct EventBuilder {
    event_type: EventType,
    operation_id: String,
    component: String,
    started: Instant,
    started_at: chrono::DateTime<Utc>,
    error: Option<String>,
    fields: Map<String, Value>,
}

impl EventBuilder {
    /// Start timing a new operation.
    pub fn start(event_type: EventType, component: &str) -> Self {
        Self {
            event_type,
            operation_id: uuid::Uuid::new_v4().to_string(),
            component: component.to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            error: None,
            fields: Map::new(),
        }
    }

    /// Attach an operation-specific field. Later values overwrite earlier ones.
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Mark the operation as failed.
    pub fn error(mut self, err: impl fmt::Display) -> Self {
        self.error = Some(err.to_string());
        self
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Finish the operation and freeze the event.
    pub fn end(self) -> Event {
        Event {
            event_type: self.event_type,
            operation_id: self.operation_id,
            component: self.component,
            started_at: self.started_at,
            duration: self.started.elapsed(),
            success: self.error.is_none(),
            error: self.error,
            fields: self.fields,
        }
    }
}

macro_rules! typed_builder {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        #[must_use = "an event is only produced by calling `end()`"]
        pub struct $name(EventBuilder);

        impl $name {
            /// Attach an arbitrary field.
            pub fn field(self, key: &str, value: impl Into<Value>) -> Self {
                Self(self.0.field(key, value))
            }

            /// Mark the operation as failed.
            pub fn error(self, err: impl fmt::Display) -> Self {
                Self(self.0.error(err))
            }

            pub fn operation_id(&self) -> &str {
                self.0.operation_id()
            }

            /// Finish the operation and freeze the event.
            pub fn end(self) -> Event {
                self.0.end()
            }
        }
    };
}

typed_builder!(
    /// One scan job, from start to terminal state transition.
    ScanEvent
);

impl ScanEvent {
    pub fn start(scan_type: &str, job_id: &str) -> Self {
        Self(
            EventBuilder::start(EventType::Scan, "scanner")
                .field(fields::SCAN_TYPE, scan_type)
                .field(fields::JOB_ID, job_id),
        )
    }

    pub fn files_scanned(self, count: u64) -> Self {
        self.field(fields::FILES_SCANNED, count)
    }

    pub fn threats_found(self, count: u64) -> Self {
        self.field(fields::THREATS_FOUND, count)
    }

    pub fn files_skipped(self, count: u64) -> Self {
        self.field(fields::FILES_SKIPPED, count)
    }
}

typed_builder!(
    /// One IPC request, from decode to response.
    IpcRequestEvent
);

impl IpcRequestEvent {
    pub fn start(command: &str, request_id: &str) -> Self {
        Self(
            EventBuilder::start(EventType::IpcRequest, "ipc")
                .field(fields::COMMAND, command)
                .field(fields::REQUEST_ID, request_id),
        )
    }

    pub fn client_version(self, version: i64) -> Self {
        self.field(fields::CLIENT_VERSION, version)
    }

    pub fn response_size(self, bytes: usize) -> Self {
        self.field(fields::RESPONSE_SIZE, bytes)
    }
}

typed_builder!(
    /// One protection state transition.
    StateChangeEvent
);

impl StateChangeEvent {
    /// Start before the transition is applied; the previous state is only
    /// known once it has been committed.
    pub fn start(to: &str) -> Self {
        Self(EventBuilder::start(EventType::StateChange, "daemon").field(fields::TO_STATE, to))
    }

    pub fn from_state(self, from: &str) -> Self {
        self.field(fields::FROM_STATE, from)
    }

    pub fn reason(self, reason: &str) -> Self {
        self.field(fields::REASON, reason)
    }
}

typed_builder!(
    /// One detected threat.
    ThreatEvent
);

impl ThreatEvent {
    pub fn start(path: &Path, threat_name: &str) -> Self {
        Self(
            EventBuilder::start(EventType::ThreatDetected, "scanner")
                .field(fields::PATH, path.display().to_string())
                .field(fields::THREAT_NAME, threat_name),
        )
    }

    pub fn action(self, action: &str) -> Self {
        self.field(fields::ACTION, action)
    }

    pub fn file_size(self, bytes: u64) -> Self {
        self.field(fields::FILE_SIZE_BYTES, bytes)
    }
}

typed_builder!(
    /// One daemon health check.
    HealthCheckEvent
);

impl HealthCheckEvent {
    pub fn start() -> Self {
        Self(EventBuilder::start(EventType::HealthCheck, "daemon"))
    }

    pub fn engine_available(self, available: bool) -> Self {
        self.field(fields::ENGINE_AVAILABLE, available)
    }

    pub fn firewall_enabled(self, enabled: bool) -> Self {
        self.field(fields::FIREWALL_ENABLED, enabled)
    }

    pub fn version(self, version: &str) -> Self {
        self.field(fields::VERSION, version)
    }
}
