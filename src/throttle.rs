//! Per-resource-id minimum-interval rate limiting.
//!
//! DESIGN
//! ======
//! One `Throttle` holds a last-sent instant per key behind a `Mutex`. Keys are
//! logical resource ids: the cursor throttle keys on the owning user, the drag
//! throttle keys on the dragged entity. Keying per resource means one user
//! dragging N selected entities never has one entity's throttle starve
//! another's, and two users' gestures never share a window.

#[cfg(test)]
#[path = "throttle_test.rs"]
mod throttle_test;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum-interval limiter keyed per resource id.
pub struct Throttle<K> {
    last: Mutex<HashMap<K, Instant>>,
    interval: Duration,
}

impl<K: Eq + Hash> Throttle<K> {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { last: Mutex::new(HashMap::new()), interval }
    }

    /// Whether a broadcast for `key` may go out now. Records the instant when
    /// it answers yes.
    pub fn allow(&self, key: K) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Internal: check + record with explicit instant (for testing).
    fn allow_at(&self, key: K, now: Instant) -> bool {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match last.get(&key) {
            Some(&sent) if now.duration_since(sent) < self.interval => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }

    /// Forget a key's window, e.g. when its gesture ends. The next broadcast
    /// for the key goes out immediately.
    pub fn reset(&self, key: &K) {
        self.last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }
}
