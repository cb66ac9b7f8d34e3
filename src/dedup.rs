//! Time-bounded de-duplication cache.
//!
//! Guards the event log against flooding with the same message. Entries expire
//! after a fixed window and the whole cache lives only in memory.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default window during which a repeated key is suppressed
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(60);

pub struct DedupCache {
    window: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records `key` and returns `true` if it was not seen within the window.
    pub fn check_and_insert(&self, key: &str) -> bool {
        self.check_and_insert_at(key, Instant::now())
    }

    /// Same as [`check_and_insert`](Self::check_and_insert) with an explicit clock.
    ///
    /// Expired entries are purged first, so the map never grows past the set of
    /// keys seen during one window.
    pub fn check_and_insert_at(&self, key: &str, now: Instant) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.window;
        entries.retain(|_, seen| now.saturating_duration_since(*seen) <= window);

        if let Some(seen) = entries.get(key) {
            if now.saturating_duration_since(*seen) < window {
                return false;
            }
        }

        entries.insert(key.to_string(), now);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .is_some_and(|seen| seen.elapsed() < self.window)
    }

    pub fn purge_expired(&self, now: Instant) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.window;
        entries.retain(|_, seen| now.saturating_duration_since(*seen) <= window);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
