//! Subscriber set for push events.
//!
//! Owns the live subscribers behind one lock and knows nothing about
//! sockets: each subscriber is a bounded channel drained by its connection's
//! writer task. Delivery never waits, so a slow or dead subscriber is
//! dropped instead of stalling the transition that triggered the broadcast.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Identifies one subscribed connection.
pub type SubscriberId = u64;

pub struct Broadcaster<M> {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<M>>>,
}

impl<M: Clone> Broadcaster<M> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register `tx` under `id`, replacing any previous registration.
    pub fn add(&self, id: SubscriberId, tx: mpsc::Sender<M>) {
        self.lock().insert(id, tx);
        debug!(subscriber = id, "Subscriber added");
    }

    /// Returns whether `id` was subscribed.
    pub fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber = id, "Subscriber removed");
        }
        removed
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer `message` to every subscriber and return how many accepted it.
    ///
    /// A subscriber whose queue is full or closed is removed.
    pub fn broadcast_all(&self, message: &M) -> usize {
        let mut delivered = 0;
        self.lock().retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = *id, "Subscriber not keeping up, unsubscribing");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = *id, "Subscriber gone, unsubscribing");
                false
            }
        });
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<M>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<M: Clone> Default for Broadcaster<M> {
    fn default() -> Self {
        Self::new()
    }
}
