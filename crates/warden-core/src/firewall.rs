//! Firewall on/off control surface.
//!
//! Rule management lives outside the daemon; the control plane only needs a
//! boolean it can read and flip.

use std::sync::atomic::{AtomicBool, Ordering};

/// Read and toggle the host firewall.
pub trait FirewallControl: Send + Sync {
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
}

/// In-process flag used when no external firewall backend is attached.
#[derive(Debug, Default)]
pub struct FirewallFlag(AtomicBool);

impl FirewallFlag {
    pub fn new(enabled: bool) -> Self {
        Self(AtomicBool::new(enabled))
    }
}

impl FirewallControl for FirewallFlag {
    fn enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}
