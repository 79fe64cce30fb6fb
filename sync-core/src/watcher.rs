//! Translates raw filesystem events into the five logical handlers, after an
//! ordered filter chain: a `notify::recommended_watcher` closure forwards
//! events into an `mpsc` channel, drained by a `tokio::select!` loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::debouncer::Debouncer;
use crate::echo_suppressor::EchoSuppressor;
use crate::error::FilesystemError;
use crate::events::{ErrorEvent, EventBus, SyncEvent};
use crate::metadata_store::{record_now, MetadataStore};
use crate::model::{EntryId, LocalRecord, WorkspaceId};
use crate::pipeline::Pipeline;
use crate::remote_client::{sanitize_filename, RemoteClient};

/// Spec §4.6 filter 1: system/noise names dropped regardless of directory.
pub fn is_noise_name(name: &str) -> bool {
    if name.starts_with('.') {
        return true;
    }
    if name.eq_ignore_ascii_case("desktop.ini") || name.eq_ignore_ascii_case("thumbs.db") {
        return true;
    }
    if let Some(stripped) = name.strip_prefix("~$") {
        let _ = stripped;
        return true;
    }
    name.ends_with(".tmp") || name.ends_with(".temp")
}

/// Spec §4.6 filter 2: VCS/build directory names, also used by the
/// Reconciler's own local walk so both components agree on what "inside the
/// sync root" means.
const EXCLUDED_DIR_NAMES: &[&str] = &[".git", "node_modules", ".vs", ".idea", "bin", "obj", "__pycache__"];

pub fn is_excluded_dir_name(name: &str) -> bool {
    EXCLUDED_DIR_NAMES.iter().any(|n| n.eq_ignore_ascii_case(name))
}

fn is_inside_excluded_dir(relative: &Utf8Path) -> bool {
    relative
        .components()
        .any(|c| is_excluded_dir_name(c.as_str()))
}

/// How long a folder's Created handler waits for an ancestor folder creation
/// to settle before giving up (spec §4.6: "waits up to ~15 s").
const PARENT_RETRY_BUDGET: Duration = Duration::from_secs(15);
const PARENT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Modified-event tolerance (spec §4.6): within this of the Metadata Store's
/// recorded size/mtime, a Modified event is treated as a no-op.
const MODIFIED_TOLERANCE: Duration = Duration::from_secs(5);

enum ParentLookup {
    Root,
    Folder(EntryId),
    Unresolved,
}

pub struct FileWatcher {
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn MetadataStore>,
    pipeline: Arc<Pipeline>,
    echo: Arc<EchoSuppressor>,
    debouncer: Arc<Debouncer>,
    events: EventBus,
    active_workspace: Arc<AtomicI64>,
    workspace: WorkspaceId,
    sync_root: Utf8PathBuf,
    started_at: SystemTime,
    in_progress: Mutex<HashSet<String>>,
    /// Shutdown signal shared with the coordinator (mirrors [`Pipeline`]'s
    /// `cancel` field); threaded into every remote call the handlers make so
    /// `SyncCoordinator::stop`/`shutdown` actually cuts off in-flight retries
    /// instead of letting them run to completion regardless.
    cancel: CancellationToken,
}

pub struct FileWatcherHandle {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl FileWatcherHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

impl FileWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        store: Arc<dyn MetadataStore>,
        pipeline: Arc<Pipeline>,
        echo: Arc<EchoSuppressor>,
        debouncer: Arc<Debouncer>,
        events: EventBus,
        active_workspace: Arc<AtomicI64>,
        workspace: WorkspaceId,
        sync_root: Utf8PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            remote,
            store,
            pipeline,
            echo,
            debouncer,
            events,
            active_workspace,
            workspace,
            sync_root,
            started_at: SystemTime::now(),
            in_progress: Mutex::new(HashSet::new()),
            cancel,
        }
    }

    /// Starts the `notify` backend and a draining task. The returned handle
    /// must be stopped before a reconcile pass begins (spec §4.9).
    pub fn spawn(self: Arc<Self>) -> Result<FileWatcherHandle, FilesystemError> {
        let (tx, mut rx) = mpsc::channel::<Event>(1024);
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.blocking_send(event);
                }
            })
            .map_err(|e| FilesystemError::Io {
                path: self.sync_root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;

        watcher
            .watch(self.sync_root.as_std_path(), RecursiveMode::Recursive)
            .map_err(|e| FilesystemError::Io {
                path: self.sync_root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let this = self;
        let join = tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(event) => this.dispatch(event).await,
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(FileWatcherHandle { cancel, join })
    }

    fn relative_path(&self, path: &Utf8Path) -> Option<Utf8PathBuf> {
        path.strip_prefix(&self.sync_root).ok().map(|p| p.to_path_buf())
    }

    /// Runs filters 1-5 (spec §4.6); filter 6 (in-progress guard) is applied
    /// separately around the actual handler dispatch.
    fn passes_filters(&self, path: &Utf8Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        if is_noise_name(name) {
            return false;
        }
        let Some(relative) = self.relative_path(path) else {
            return false;
        };
        if is_inside_excluded_dir(&relative) {
            return false;
        }
        if !self.debouncer.should_process(path) {
            return false;
        }
        if self.echo.is_recent(path) {
            return false;
        }
        if self.active_workspace.load(Ordering::SeqCst) != self.workspace {
            return false;
        }
        true
    }

    async fn resolve_parent_via_store(&self, path: &Utf8Path) -> ParentLookup {
        let Some(parent_dir) = path.parent() else {
            return ParentLookup::Root;
        };
        if parent_dir == self.sync_root {
            return ParentLookup::Root;
        }
        match self.store.get_by_path(parent_dir).await {
            Ok(Some(record)) if record.entry.is_folder() => ParentLookup::Folder(record.id()),
            _ => ParentLookup::Unresolved,
        }
    }

    #[instrument(skip(self, event))]
    async fn dispatch(&self, event: Event) {
        match event.kind {
            EventKind::Create(kind) => self.dispatch_create(kind, &event.paths).await,
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                self.dispatch_rename(&event.paths[0], &event.paths[1]).await;
            }
            EventKind::Modify(_) => self.dispatch_modified(&event.paths).await,
            EventKind::Remove(kind) => self.dispatch_remove(kind, &event.paths).await,
            _ => {}
        }
    }

    async fn dispatch_create(&self, kind: CreateKind, paths: &[std::path::PathBuf]) {
        for raw in paths {
            let Ok(path) = Utf8PathBuf::try_from(raw.clone()) else { continue };
            if !self.passes_filters(&path) {
                continue;
            }
            let Some(_guard) = self.guard(&path) else { continue };
            match kind {
                CreateKind::File => self.handle_created_file(&path).await,
                CreateKind::Folder => self.handle_created_folder(&path).await,
                _ => {
                    // Ambiguous backend report: stat the path to decide.
                    match tokio::fs::metadata(path.as_std_path()).await {
                        Ok(m) if m.is_dir() => self.handle_created_folder(&path).await,
                        Ok(m) if m.is_file() => self.handle_created_file(&path).await,
                        _ => {}
                    }
                }
            }
        }
    }

    async fn dispatch_remove(&self, _kind: RemoveKind, paths: &[std::path::PathBuf]) {
        for raw in paths {
            let Ok(path) = Utf8PathBuf::try_from(raw.clone()) else { continue };
            if !self.passes_filters(&path) {
                continue;
            }
            let Some(_guard) = self.guard(&path) else { continue };
            self.handle_deleted(&path).await;
        }
    }

    async fn dispatch_modified(&self, paths: &[std::path::PathBuf]) {
        for raw in paths {
            let Ok(path) = Utf8PathBuf::try_from(raw.clone()) else { continue };
            if !self.passes_filters(&path) {
                continue;
            }
            let Some(_guard) = self.guard(&path) else { continue };
            self.handle_modified(&path).await;
        }
    }

    async fn dispatch_rename(&self, old_raw: &std::path::Path, new_raw: &std::path::Path) {
        let (Ok(old_path), Ok(new_path)) = (
            Utf8PathBuf::try_from(old_raw.to_path_buf()),
            Utf8PathBuf::try_from(new_raw.to_path_buf()),
        ) else {
            return;
        };
        if !self.passes_filters(&new_path) {
            return;
        }
        let Some(_guard) = self.guard(&new_path) else { return };

        let existing = self.store.get_by_path(&old_path).await.ok().flatten();
        match existing {
            Some(record) if record.entry.is_folder() => {
                self.handle_renamed_folder(&old_path, &new_path, record).await;
            }
            Some(record) => {
                self.handle_renamed_file(&new_path, record).await;
            }
            None => {
                match tokio::fs::metadata(new_path.as_std_path()).await {
                    Ok(m) if m.is_dir() => self.handle_created_folder(&new_path).await,
                    _ => self.handle_created_file(&new_path).await,
                }
            }
        }
    }

    /// Per-path in-progress guard (spec §4.6 filter 6): returns `None` if a
    /// handler for this path is already running.
    fn guard(&self, path: &Utf8Path) -> Option<InProgressGuard<'_>> {
        let key = path.as_str().to_string();
        let mut guard = self.in_progress.lock();
        if !guard.insert(key.clone()) {
            return None;
        }
        drop(guard);
        Some(InProgressGuard { set: &self.in_progress, key })
    }

    async fn handle_created_file(&self, path: &Utf8Path) {
        if self.store.get_by_path(path).await.ok().flatten().is_some() {
            return;
        }
        let metadata = match tokio::fs::metadata(path.as_std_path()).await {
            Ok(m) => m,
            Err(_) => return,
        };
        let mtime = metadata.modified().unwrap_or(SystemTime::now());
        if !crate::debouncer::is_within_cold_start_grace(mtime, self.started_at) {
            // Spec §4.5/§9: a pre-existing file surfaced by a cold-start
            // scan is not a genuine create; bulk upload of such files is
            // the Reconciler's job, not the watcher's.
            return;
        }
        let size = metadata.len();

        let parent = match self.resolve_parent_via_store(path).await {
            ParentLookup::Root => None,
            ParentLookup::Folder(id) => Some(id),
            ParentLookup::Unresolved => {
                warn!(path = %path, "created-file: parent unresolved, deferring to next reconcile");
                return;
            }
        };

        let name = path.file_name().unwrap_or_default().to_string();
        if let Ok(Some(existing)) = self.store.find(&name, parent, size).await {
            // Same identity already tracked under a different local path:
            // adopt this path instead of re-uploading (spec §4.6 "merge").
            let mut merged = existing;
            merged.local_path = path.to_path_buf();
            let _ = self.store.upsert(merged).await;
            return;
        }

        match self.pipeline.upload(self.workspace, path, parent).await {
            Ok(entry) => {
                let _ = self.store.upsert(record_now(entry, path.to_path_buf())).await;
                self.echo.mark(path);
            }
            Err(err) => warn!(path = %path, error = %err, "created-file upload failed"),
        }
    }

    async fn handle_created_folder(&self, path: &Utf8Path) {
        let deadline = Instant::now() + PARENT_RETRY_BUDGET;
        let parent = loop {
            match self.resolve_parent_via_store(path).await {
                ParentLookup::Root => break None,
                ParentLookup::Folder(id) => break Some(id),
                ParentLookup::Unresolved if Instant::now() < deadline => {
                    tokio::time::sleep(PARENT_RETRY_INTERVAL).await;
                }
                ParentLookup::Unresolved => {
                    warn!(path = %path, "created-folder: parent never resolved, deferring");
                    return;
                }
            }
        };

        let name = path.file_name().unwrap_or_default().to_string();
        match self.remote.create_folder(self.workspace, &name, parent, &self.cancel).await {
            Ok(entry) => {
                let _ = self.store.upsert(record_now(entry, path.to_path_buf())).await;
            }
            Err(err) => warn!(path = %path, error = %err, "created-folder failed"),
        }
    }

    async fn handle_modified(&self, path: &Utf8Path) {
        let Some(record) = self.store.get_by_path(path).await.ok().flatten() else {
            return;
        };
        let metadata = match tokio::fs::metadata(path.as_std_path()).await {
            Ok(m) => m,
            Err(_) => return,
        };
        let size = metadata.len();
        let mtime = metadata.modified().unwrap_or(SystemTime::now());
        let mtime_delta = mtime
            .duration_since(record.entry.updated_at)
            .or_else(|_| record.entry.updated_at.duration_since(mtime))
            .unwrap_or_default();

        if size == record.entry.size && mtime_delta <= MODIFIED_TOLERANCE {
            return;
        }

        if let Err(err) = self.remote.delete(self.workspace, record.id(), &self.cancel).await {
            warn!(path = %path, error = %err, "modified: delete of stale remote entry failed");
        }

        match self.pipeline.upload(self.workspace, path, record.entry.parent_id).await {
            Ok(entry) => {
                let _ = self.store.upsert(record_now(entry, path.to_path_buf())).await;
                self.echo.mark(path);
            }
            Err(err) => warn!(path = %path, error = %err, "modified: re-upload failed"),
        }
    }

    async fn handle_deleted(&self, path: &Utf8Path) {
        let Some(record) = self.store.get_by_path(path).await.ok().flatten() else {
            return;
        };
        if let Err(err) = self.remote.delete(self.workspace, record.id(), &self.cancel).await {
            warn!(path = %path, error = %err, "deleted: remote delete failed");
        }
        let _ = self.store.delete_by_path(path).await;
    }

    async fn handle_renamed_file(&self, new_path: &Utf8Path, mut record: LocalRecord) {
        let new_name = sanitize_filename(new_path.file_name().unwrap_or_default());
        match self
            .remote
            .rename(self.workspace, record.id(), &new_name, &self.cancel)
            .await
        {
            Ok(true) => {
                record.entry.name = new_name;
                record.local_path = new_path.to_path_buf();
                let _ = self.store.upsert(record).await;
            }
            Ok(false) => warn!(path = %new_path, "renamed-file: remote entry not found"),
            Err(err) => warn!(path = %new_path, error = %err, "renamed-file: rename failed"),
        }
    }

    /// Spec §4.6: folder renames are refused outright; the previous name is
    /// restored on disk when possible and the user is notified.
    async fn handle_renamed_folder(&self, old_path: &Utf8Path, new_path: &Utf8Path, _record: LocalRecord) {
        warn!(old = %old_path, new = %new_path, "folder rename refused, reverting");
        if let Err(err) = tokio::fs::rename(new_path.as_std_path(), old_path.as_std_path()).await {
            warn!(path = %new_path, error = %err, "could not revert folder rename on disk");
        }
        self.events.emit(SyncEvent::Error(ErrorEvent {
            path: new_path.to_path_buf(),
            message: "folder renames are not synced; the previous name has been restored".to_string(),
        }));
    }
}

struct InProgressGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_client::MockRemoteClient;
    use std::time::Duration as StdDuration;

    fn watcher(sync_root: Utf8PathBuf) -> (Arc<FileWatcher>, Arc<MockRemoteClient>, Arc<dyn MetadataStore>) {
        watcher_with_debounce(sync_root, StdDuration::from_millis(1))
    }

    fn watcher_with_debounce(
        sync_root: Utf8PathBuf,
        debounce: StdDuration,
    ) -> (Arc<FileWatcher>, Arc<MockRemoteClient>, Arc<dyn MetadataStore>) {
        let remote = Arc::new(MockRemoteClient::new(1, 10_000_000));
        // Hidden dotfile: outside the set of paths the filter chain ever
        // considers, so it can live inside the same sync root as the test's
        // watched files without a second tempdir.
        let store: Arc<dyn MetadataStore> =
            Arc::new(crate::metadata_store::JsonFileMetadataStore::open(sync_root.join(".ms-test.json")).unwrap());
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&remote) as Arc<dyn RemoteClient>,
            4,
            EventBus::new(),
            3 * 1024 * 1024,
        ));
        let fw = Arc::new(FileWatcher::new(
            Arc::clone(&remote) as Arc<dyn RemoteClient>,
            Arc::clone(&store),
            pipeline,
            Arc::new(EchoSuppressor::new(StdDuration::from_secs(7200))),
            Arc::new(Debouncer::new(debounce)),
            EventBus::new(),
            Arc::new(AtomicI64::new(1)),
            1,
            sync_root,
            CancellationToken::new(),
        ));
        (fw, remote, store)
    }

    #[test]
    fn noise_names_are_dropped() {
        assert!(is_noise_name(".DS_Store"));
        assert!(is_noise_name("Thumbs.db"));
        assert!(is_noise_name("~$report.docx"));
        assert!(is_noise_name("draft.tmp"));
        assert!(!is_noise_name("report.docx"));
    }

    #[test]
    fn excluded_dirs_are_recognized_anywhere_in_the_path() {
        assert!(is_inside_excluded_dir(Utf8Path::new("project/.git/HEAD")));
        assert!(is_inside_excluded_dir(Utf8Path::new("a/node_modules/pkg/index.js")));
        assert!(!is_inside_excluded_dir(Utf8Path::new("Docs/notes.md")));
    }

    #[tokio::test]
    async fn created_file_uploads_and_records_metadata() {
        let dir = camino_tempfile::tempdir().unwrap();
        let (fw, remote, store) = watcher(dir.path().to_path_buf());
        let file_path = dir.path().join("a.txt");
        tokio::fs::write(file_path.as_std_path(), b"hello").await.unwrap();

        fw.handle_created_file(&file_path).await;

        assert_eq!(remote.entry_count(), 1);
        assert!(store.get_by_path(&file_path).await.unwrap().is_some());
    }

    // P5 (single-watcher half): a Created event whose (name, parent_id,
    // size) identity already exists under a different local path is a
    // merge, not a second upload.
    #[tokio::test]
    async fn created_file_with_matching_identity_merges_instead_of_reuploading() {
        let dir = camino_tempfile::tempdir().unwrap();
        let (fw, remote, store) = watcher(dir.path().to_path_buf());
        let original_path = dir.path().join("a.txt");
        tokio::fs::write(original_path.as_std_path(), b"hello").await.unwrap();
        fw.handle_created_file(&original_path).await;
        assert_eq!(remote.entry_count(), 1);

        // Same name/size reappears at a different path (e.g. a move the
        // watcher saw as a separate create rather than a rename event).
        let moved_path = dir.path().join("moved").join("a.txt");
        tokio::fs::create_dir_all(moved_path.parent().unwrap().as_std_path())
            .await
            .unwrap();
        tokio::fs::write(moved_path.as_std_path(), b"hello").await.unwrap();
        fw.handle_created_file(&moved_path).await;

        assert_eq!(remote.entry_count(), 1, "merge must not issue a second upload");
        let merged = store.find("a.txt", None, 5).await.unwrap().unwrap();
        assert_eq!(merged.local_path, moved_path);
    }

    #[tokio::test]
    async fn modified_within_tolerance_is_a_no_op() {
        let dir = camino_tempfile::tempdir().unwrap();
        let (fw, remote, store) = watcher(dir.path().to_path_buf());
        let file_path = dir.path().join("a.txt");
        tokio::fs::write(file_path.as_std_path(), b"hello").await.unwrap();
        fw.handle_created_file(&file_path).await;
        assert_eq!(remote.entry_count(), 1);

        fw.handle_modified(&file_path).await;
        assert_eq!(remote.entry_count(), 1);
        let _ = store;
    }

    #[tokio::test]
    async fn deleted_removes_remote_entry_and_ms_row() {
        let dir = camino_tempfile::tempdir().unwrap();
        let (fw, remote, store) = watcher(dir.path().to_path_buf());
        let file_path = dir.path().join("a.txt");
        tokio::fs::write(file_path.as_std_path(), b"hello").await.unwrap();
        fw.handle_created_file(&file_path).await;

        fw.handle_deleted(&file_path).await;
        assert_eq!(remote.entry_count(), 0);
        assert!(store.get_by_path(&file_path).await.unwrap().is_none());
    }

    // S5: a burst of rapid Modified events within the debounce window
    // collapses to exactly one re-upload, carrying the final size.
    #[tokio::test]
    async fn scenario_s5_rapid_modify_burst_uploads_once_with_final_size() {
        let dir = camino_tempfile::tempdir().unwrap();
        let (fw, remote, _store) =
            watcher_with_debounce(dir.path().to_path_buf(), StdDuration::from_millis(1000));
        let file_path = dir.path().join("report.pdf");

        tokio::fs::write(file_path.as_std_path(), vec![0u8; 10]).await.unwrap();
        fw.handle_created_file(&file_path).await;
        assert_eq!(remote.entry_count(), 1);

        // Both writes land on disk before either raw event is dispatched,
        // as in practice the kernel reports modifications well after the
        // write syscall returns; the handler that does run always reads
        // the file's true current content, not a snapshot of either write.
        tokio::fs::write(file_path.as_std_path(), vec![1u8; 20]).await.unwrap();
        tokio::fs::write(file_path.as_std_path(), vec![1u8; 30]).await.unwrap();

        let event_paths = vec![file_path.as_std_path().to_path_buf()];
        fw.dispatch_modified(&event_paths).await;
        fw.dispatch_modified(&event_paths).await;

        assert_eq!(remote.entry_count(), 1);
        let roots = remote.list_root(1, &CancellationToken::new()).await.unwrap();
        assert_eq!(roots[0].size, 30);
    }
}
