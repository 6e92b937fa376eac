//! Observer sinks for container and group mutations.
//!
//! Subscribers register plain callbacks and are notified synchronously at the
//! exit of mutating operations (or once per explicit batch boundary for
//! group changes). No threading assumptions are made about subscribers; the
//! session's single-writer rule serialises all notifications.

use std::collections::BTreeMap;

/// Whether a mutating call should notify observers on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    Yes,
    No,
}

/// Handle returned by [`ObserverRegistry::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObserverHandle(u64);

/// A registry of change callbacks.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: BTreeMap<u64, Box<dyn Fn() + Send + Sync>>,
    next_handle: u64,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; runs on every notification until unsubscribed.
    pub fn subscribe(&mut self, callback: Box<dyn Fn() + Send + Sync>) -> ObserverHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.observers.insert(handle, callback);
        ObserverHandle(handle)
    }

    /// Remove a callback. Returns whether it was present.
    pub fn unsubscribe(&mut self, handle: ObserverHandle) -> bool {
        self.observers.remove(&handle.0).is_some()
    }

    /// Invoke every registered callback, in subscription order.
    pub fn notify(&self) {
        for callback in self.observers.values() {
            callback();
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observer_count", &self.observers.len())
            .finish()
    }
}
