//! Sampling and rendering of finished events.

use std::time::Duration;

use tracing::{Dispatch, error, info};
use warden_config::EventsConfig;

use super::Event;

/// `tracing` target used for every rendered event.
pub const EVENT_TARGET: &str = "warden::events";

/// Decides which events are logged and renders them as one record each.
///
/// Failed events and events at or above the slow threshold are always
/// emitted. Everything else is sampled at `sample_rate`.
#[derive(Debug, Clone)]
pub struct Emitter {
    sample_rate: f64,
    slow_threshold: Duration,
    dispatch: Option<Dispatch>,
}

impl Emitter {
    /// Create an emitter. `sample_rate` is clamped to `[0.0, 1.0]`.
    pub fn new(sample_rate: f64, slow_threshold: Duration) -> Self {
        Self {
            sample_rate: sample_rate.clamp(0.0, 1.0),
            slow_threshold,
            dispatch: None,
        }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        Self::new(config.sample_rate, config.slow_threshold())
    }

    /// Route records to `dispatch` instead of the ambient default subscriber.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Emit `event` if it passes sampling. Returns whether a record was written.
    pub fn emit(&self, event: Event) -> bool {
        if !self.should_emit(&event) {
            return false;
        }
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, || render(&event)),
            None => render(&event),
        }
        true
    }

    /// Sampling decision for one event.
    pub fn should_emit(&self, event: &Event) -> bool {
        self.decide(event, rand::random::<f64>)
    }

    fn decide(&self, event: &Event, roll: impl FnOnce() -> f64) -> bool {
        if !event.success || event.duration >= self.slow_threshold {
            return true;
        }
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        roll() < self.sample_rate
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new(1.0, Duration::from_secs(1))
    }
}

fn render(event: &Event) {
    let fields = serde_json::to_string(&event.fields).unwrap_or_default();
    let duration_ms = event.duration_ms();
    if event.success {
        info!(
            target: EVENT_TARGET,
            event_type = %event.event_type,
            operation_id = %event.operation_id,
            component = %event.component,
            duration_ms,
            success = true,
            fields = %fields,
            "{}",
            event.event_type
        );
    } else {
        error!(
            target: EVENT_TARGET,
            event_type = %event.event_type,
            operation_id = %event.operation_id,
            component = %event.component,
            duration_ms,
            success = false,
            error = event.error.as_deref().unwrap_or_default(),
            fields = %fields,
            "{}",
            event.event_type
        );
    }
}
