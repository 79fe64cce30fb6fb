//! Debouncer (spec §4.5): a per-path cooldown that collapses bursts of
//! filesystem events, plus the cold-start grace-window predicate that keeps
//! a fresh watcher from treating pre-existing files as "new".

use std::time::{Duration, Instant, SystemTime};

use camino::Utf8Path;
use dashmap::DashMap;

pub struct Debouncer {
    cooldown: Duration,
    last_dispatched: DashMap<String, Instant>,
}

impl Debouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_dispatched: DashMap::new(),
        }
    }

    /// True iff no prior dispatch for `path` occurred within the cooldown
    /// window. Always updates the timestamp on a `true` return (spec §4.5),
    /// so a caller that gets `true` owns the dispatch.
    pub fn should_process(&self, path: &Utf8Path) -> bool {
        let key = path.as_str().to_string();
        let now = Instant::now();
        match self.last_dispatched.get(&key) {
            Some(last) if now.duration_since(*last) < self.cooldown => false,
            _ => {
                self.last_dispatched.insert(key, now);
                true
            }
        }
    }
}

/// Grace window for the cold-start predicate (spec §4.5): a file whose
/// on-disk mtime precedes the watcher's start time by more than this is
/// treated as pre-existing, not a genuine "create" event.
pub const COLD_START_GRACE: Duration = Duration::from_secs(2);

/// Rejects events for files whose mtime precedes `watcher_started_at` by
/// more than [`COLD_START_GRACE`] (spec §4.5, open question in §9: the
/// Reconciler, not the watcher, is responsible for bulk upload of
/// pre-existing files).
pub fn is_within_cold_start_grace(mtime: SystemTime, watcher_started_at: SystemTime) -> bool {
    match watcher_started_at.duration_since(mtime) {
        // mtime is at or after watcher start: definitely a fresh event.
        Err(_) => true,
        Ok(age) => age <= COLD_START_GRACE,
    }
}
