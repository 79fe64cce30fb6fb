//! Event interface to the UI (spec §6, §9). Modeled as an observer with a
//! bounded channel per subscriber, per the redesign note in spec §9 ("Event
//! delegates... modeled as an observer interface with a bounded channel per
//! subscriber; subscribers cannot block producers").

use camino::Utf8PathBuf;
use tokio::sync::broadcast;

/// `{stage, percentage, current_path}` progress events (spec §6), plus the
/// pipeline's richer per-transfer fields (spec §4.7: filename, bytes-sent,
/// bytes-total, rolling MiB/s, estimated-remaining).
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub path: Utf8PathBuf,
    pub bytes_sent: u64,
    pub bytes_total: u64,
    pub mib_per_sec: f64,
    pub estimated_remaining_secs: Option<f64>,
}

impl ProgressEvent {
    pub fn percentage(&self) -> f64 {
        if self.bytes_total == 0 {
            100.0
        } else {
            (self.bytes_sent as f64 / self.bytes_total as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Uploading,
    Downloading,
}

#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub stage: Stage,
    pub path: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub path: Utf8PathBuf,
    pub message: String,
}

/// `{added|changed|removed|renamed, path[, old_path]}` (spec §6).
#[derive(Debug, Clone)]
pub enum FsChangeEvent {
    Added { path: Utf8PathBuf },
    Changed { path: Utf8PathBuf },
    Removed { path: Utf8PathBuf },
    Renamed { path: Utf8PathBuf, old_path: Utf8PathBuf },
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Progress(ProgressEvent),
    Completion(CompletionEvent),
    Error(ErrorEvent),
    FsChange(FsChangeEvent),
}

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Bounded broadcast bus: producers never block on a slow subscriber past
/// the channel capacity (spec §5: "Subscribers receive synchronously on the
/// emitting task; they must not block"). A lagging subscriber drops the
/// oldest events rather than stalling the core.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Best-effort emit: no subscribers is not an error (spec treats UI as
    /// an optional external collaborator, §1).
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SyncEvent::FsChange(FsChangeEvent::Added {
            path: Utf8PathBuf::from("/tmp/a.txt"),
        }));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SyncEvent::FsChange(FsChangeEvent::Added { .. })));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(SyncEvent::Error(ErrorEvent {
            path: Utf8PathBuf::from("/tmp/a.txt"),
            message: "oops".into(),
        }));
    }

    #[test]
    fn percentage_is_saturating_for_empty_total() {
        let progress = ProgressEvent {
            stage: Stage::Uploading,
            path: Utf8PathBuf::from("/tmp/a.txt"),
            bytes_sent: 0,
            bytes_total: 0,
            mib_per_sec: 0.0,
            estimated_remaining_secs: None,
        };
        assert_eq!(progress.percentage(), 100.0);
    }
}
