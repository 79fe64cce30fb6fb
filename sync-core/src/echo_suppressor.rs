//! Echo Suppressor (spec §4.4): a time-windowed set of recently-downloaded
//! (or reconciler-uploaded) paths used to veto spurious upload triggers, so
//! the pipeline's own writes are never mistaken for user intent (spec
//! glossary: "Echo").

use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;

/// Both the original and the canonicalized form of a path are tracked
/// (spec §4.4: "mapping from absolute path (both original and
/// canonicalized)"), since filesystem events can report either. Backed by
/// a sharded [`DashMap`] rather than a single mutex, since this map is hit
/// from the File Watcher's dispatch loop and the Coordinator's
/// post-reconcile tree walk concurrently.
pub struct EchoSuppressor {
    ttl: Duration,
    entries: DashMap<Utf8PathBuf, Instant>,
}

impl EchoSuppressor {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Marks `path` (and its canonicalized form, if resolvable and
    /// different) as a recent echo.
    pub fn mark(&self, path: &Utf8Path) {
        let now = Instant::now();
        self.entries.insert(path.to_path_buf(), now);
        if let Some(canonical) = canonicalize(path) {
            if canonical != path {
                self.entries.insert(canonical, now);
            }
        }
    }

    /// True iff an entry exists for `path` (or its canonical form) whose
    /// age is less than the TTL (spec §4.4, property P1).
    pub fn is_recent(&self, path: &Utf8Path) -> bool {
        let fresh = |p: &Utf8PathBuf| {
            self.entries
                .get(p)
                .is_some_and(|inserted| inserted.elapsed() < self.ttl)
        };
        if fresh(&path.to_path_buf()) {
            return true;
        }
        if let Some(canonical) = canonicalize(path) {
            if fresh(&canonical) {
                return true;
            }
        }
        false
    }

    /// Evicts every entry older than the TTL. Intended to run on a
    /// background interval (spec §4.4: "A background sweep evicts expired
    /// entries").
    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, inserted| inserted.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn canonicalize(path: &Utf8Path) -> Option<Utf8PathBuf> {
    let canonical = std::fs::canonicalize(path.as_std_path()).ok()?;
    Utf8PathBuf::try_from(canonical).ok()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn marked_path_is_recent_until_ttl() {
        let es = EchoSuppressor::new(Duration::from_millis(50));
        let path = Utf8Path::new("/tmp/does/not/exist/a.txt");
        assert!(!es.is_recent(path));
        es.mark(path);
        assert!(es.is_recent(path));
    }

    #[test]
    fn expired_entry_is_no_longer_recent() {
        let es = EchoSuppressor::new(Duration::from_millis(1));
        let path = Utf8Path::new("/tmp/does/not/exist/b.txt");
        es.mark(path);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!es.is_recent(path));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let es = EchoSuppressor::new(Duration::from_millis(1));
        es.mark(Utf8Path::new("/tmp/c.txt"));
        std::thread::sleep(Duration::from_millis(20));
        es.sweep();
        assert!(es.is_empty());
    }

    /// Property P1: a path marked as an echo stays vetoed at every
    /// checkpoint before the TTL elapses, regardless of path shape or how
    /// finely the checkpoints are spaced.
    #[rstest]
    #[case::deep_path("/tmp/p1/a/b/c.txt", &[20, 40, 60, 60])]
    #[case::shallow_path("/tmp/p1-shallow.txt", &[50, 50])]
    #[case::many_small_checkpoints("/tmp/p1/fine.txt", &[10, 10, 10, 10, 10, 10])]
    fn property_p1_marked_path_vetoed_at_every_checkpoint_under_ttl(
        #[case] path: &str,
        #[case] checkpoints_ms: &[u64],
    ) {
        let ttl = Duration::from_millis(200);
        let es = EchoSuppressor::new(ttl);
        let path = Utf8Path::new(path);
        es.mark(path);
        let mut elapsed = Duration::ZERO;
        for &step in checkpoints_ms {
            std::thread::sleep(Duration::from_millis(step));
            elapsed += Duration::from_millis(step);
            assert!(
                es.is_recent(path),
                "expected recent after {elapsed:?} elapsed (ttl {ttl:?})"
            );
        }
    }
}
