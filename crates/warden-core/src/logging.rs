//! In-memory record collector.
//!
//! Provides a [`LogCollector`] layer that captures `tracing` records, with all
//! of their structured fields, into a bounded ring buffer, and a [`LogReader`]
//! handle for reading them back. A tray or status UI can attach it to show
//! recent events; tests use it to observe the event pipeline.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// A single captured record.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Timestamp as seconds since the collector was created.
    pub elapsed_secs: f64,
    /// Log level.
    pub level: Level,
    /// Target module path.
    pub target: String,
    /// The formatted message.
    pub message: String,
    /// Every other field, rendered as text.
    pub fields: BTreeMap<String, String>,
}

impl LogEntry {
    /// Look up a captured field by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug)]
struct LogBuffer {
    entries: Vec<LogEntry>,
    capacity: usize,
    start_time: std::time::Instant,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            start_time: std::time::Instant::now(),
        }
    }

    fn push(&mut self, level: Level, target: String, visitor: FieldVisitor) {
        if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(LogEntry {
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
            level,
            target,
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

/// A `tracing` layer that captures records into a shared ring buffer.
#[derive(Debug, Clone)]
pub struct LogCollector {
    buffer: Arc<Mutex<LogBuffer>>,
}

impl LogCollector {
    /// Create a new collector with the given ring buffer capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::new(capacity))),
        }
    }

    /// Get a reader handle for the captured entries.
    pub fn reader(&self) -> LogReader {
        LogReader {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCollector {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Ok(mut buf) = self.buffer.lock() {
            buf.push(*metadata.level(), metadata.target().to_string(), visitor);
        }
    }
}

/// A read handle for the collector's buffer.
#[derive(Debug, Clone)]
pub struct LogReader {
    buffer: Arc<Mutex<LogBuffer>>,
}

impl LogReader {
    /// Return a snapshot of all captured entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.buffer
            .lock()
            .map(|buf| buf.entries.clone())
            .unwrap_or_default()
    }

    /// Return the captured entries logged under `target`.
    pub fn for_target(&self, target: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.target == target)
            .collect()
    }

    /// Return the number of entries currently in the buffer.
    pub fn len(&self) -> usize {
        self.buffer.lock().map(|buf| buf.entries.len()).unwrap_or(0)
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn test_log_collector_captures_fields() {
        let collector = LogCollector::new(100);
        let reader = collector.reader();

        let _guard = tracing_subscriber::registry().with(collector).set_default();

        tracing::info!(socket = "/run/warden/defense.sock", "IPC server listening");
        tracing::warn!(count = 3u64, ok = false, "a warning");

        let entries = reader.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, Level::INFO);
        assert_eq!(entries[0].message, "IPC server listening");
        assert_eq!(entries[0].field("socket"), Some("/run/warden/defense.sock"));
        assert_eq!(entries[1].level, Level::WARN);
        assert_eq!(entries[1].field("count"), Some("3"));
        assert_eq!(entries[1].field("ok"), Some("false"));
    }

    #[test]
    fn test_log_collector_ring_buffer() {
        let collector = LogCollector::new(3);
        let reader = collector.reader();

        let _guard = tracing_subscriber::registry().with(collector).set_default();

        tracing::info!("one");
        tracing::info!("two");
        tracing::info!("three");
        tracing::info!("four");

        let entries = reader.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "two");
    }

    #[test]
    fn test_for_target_filters() {
        let collector = LogCollector::new(10);
        let reader = collector.reader();

        let _guard = tracing_subscriber::registry().with(collector).set_default();

        tracing::info!(target: "warden::events", "scan");
        tracing::info!(target: "other", "noise");

        assert_eq!(reader.for_target("warden::events").len(), 1);
        assert!(!reader.is_empty());
    }
}
