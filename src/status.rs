//! Shared connection/update status (spec.md §6 `connected`,
//! `updatesEnabled`, `updatesPending`): the session task updates this
//! lock-free snapshot at the relevant state transitions, and any `Client`
//! clone reads it synchronously with no command-channel round-trip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Inner {
    connected: AtomicBool,
    updates_enabled: AtomicBool,
    updates_pending: AtomicBool,
}

/// Cheaply cloneable; every clone observes the same atomics.
#[derive(Clone)]
pub struct SharedStatus(Arc<Inner>);

impl SharedStatus {
    pub fn new(updates_enabled: bool) -> Self {
        Self(Arc::new(Inner {
            connected: AtomicBool::new(false),
            updates_enabled: AtomicBool::new(updates_enabled),
            updates_pending: AtomicBool::new(false),
        }))
    }

    pub fn connected(&self) -> bool {
        self.0.connected.load(Ordering::Relaxed)
    }

    pub fn updates_enabled(&self) -> bool {
        self.0.updates_enabled.load(Ordering::Relaxed)
    }

    pub fn updates_pending(&self) -> bool {
        self.0.updates_pending.load(Ordering::Relaxed)
    }

    pub(crate) fn set_connected(&self, value: bool) {
        self.0.connected.store(value, Ordering::Relaxed);
    }

    pub(crate) fn set_updates_enabled(&self, value: bool) {
        self.0.updates_enabled.store(value, Ordering::Relaxed);
    }

    pub(crate) fn set_updates_pending(&self, value: bool) {
        self.0.updates_pending.store(value, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_reflect_the_latest_write_through_any_clone() {
        let status = SharedStatus::new(true);
        let reader = status.clone();
        assert!(reader.updates_enabled());
        assert!(!reader.connected());

        status.set_connected(true);
        status.set_updates_enabled(false);
        status.set_updates_pending(true);

        assert!(reader.connected());
        assert!(!reader.updates_enabled());
        assert!(reader.updates_pending());
    }
}
