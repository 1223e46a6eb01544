//! Protection state machine.
//!
//! Holds the single current [`ProtectionState`] and notifies registered
//! [`StateObserver`]s after every transition. Any state may move to any
//! other state.
//!
//! Observers run synchronously on the thread that called
//! [`StateMachine::set_state`], after the new value is committed, in
//! registration order. They must not call back into `set_state`; doing so
//! deadlocks on the transition lock.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

/// The daemon's protection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionState {
    Protected,
    Scanning,
    Paused,
    Alert,
    Warning,
}

impl ProtectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionState::Protected => "protected",
            ProtectionState::Scanning => "scanning",
            ProtectionState::Paused => "paused",
            ProtectionState::Alert => "alert",
            ProtectionState::Warning => "warning",
        }
    }
}

impl fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtectionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "protected" => Ok(ProtectionState::Protected),
            "scanning" => Ok(ProtectionState::Scanning),
            "paused" => Ok(ProtectionState::Paused),
            "alert" => Ok(ProtectionState::Alert),
            "warning" => Ok(ProtectionState::Warning),
            other => Err(format!("unknown protection state: {other}")),
        }
    }
}

/// Receives `(old, new)` after each committed transition.
pub trait StateObserver: Send + Sync {
    fn on_transition(&self, old: ProtectionState, new: ProtectionState);
}

impl<F> StateObserver for F
where
    F: Fn(ProtectionState, ProtectionState) + Send + Sync,
{
    fn on_transition(&self, old: ProtectionState, new: ProtectionState) {
        self(old, new)
    }
}

/// The current protection state plus its observers.
pub struct StateMachine {
    current: RwLock<ProtectionState>,
    observers: RwLock<Vec<Arc<dyn StateObserver>>>,
    // Serializes transitions so observers see them in commit order.
    transition: Mutex<()>,
}

impl StateMachine {
    pub fn new(initial: ProtectionState) -> Self {
        Self {
            current: RwLock::new(initial),
            observers: RwLock::new(Vec::new()),
            transition: Mutex::new(()),
        }
    }

    /// The current state. Never waits on observers.
    pub fn current(&self) -> ProtectionState {
        *self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Commit `new` and notify every observer with `(old, new)`.
    ///
    /// Returns the previous state.
    pub fn set_state(&self, new: ProtectionState) -> ProtectionState {
        let _transition = self
            .transition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let old = {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *current, new)
        };

        let observers: Vec<Arc<dyn StateObserver>> = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for observer in observers {
            observer.on_transition(old, new);
        }
        old
    }

    /// Register an observer. There is no unregistration.
    pub fn on_change(&self, observer: Arc<dyn StateObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(ProtectionState::Protected)
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}
