//! Reconciler (spec §4.8): the initial/periodic bidirectional sync driver.
//! Builds a full remote tree snapshot, compares it with the local tree, and
//! schedules work through the Upload/Download Pipeline.
//!
//! Grounded on `tenant.rs`'s reconciliation-loop shape (a captured
//! generation/workspace id checked before every mutating step,
//! per-operation `thiserror` variants) composed with `remote_storage`'s
//! concurrent listing fan-out.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::echo_suppressor::EchoSuppressor;
use crate::error::{Deferred, ReconcileError};
use crate::metadata_store::{record_now, MetadataStore};
use crate::model::{normalize_path, EntryId, EntryKind, RemoteEntry, RemoteTreeMap, WorkspaceId};
use crate::path_resolver::{resolve_parent, split_path, ResolvedParent};
use crate::pipeline::Pipeline;
use crate::remote_client::RemoteClient;

/// Conflict tolerance band (spec §1, §4.8): within this, local wins.
const CONFLICT_TOLERANCE: Duration = Duration::from_secs(2);

/// Sentinel id for an in-flight upload placeholder (spec §4.8 Phase B).
const IN_FLIGHT_PLACEHOLDER_ID: EntryId = -1;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileSummary {
    pub uploaded: u32,
    pub downloaded: u32,
    pub folders_created: u32,
    pub deferred: u32,
    pub errors: u32,
    /// One entry per deferral this pass (spec §4.8 invariant I5, §7 class
    /// 7), kept alongside the plain `deferred` count for diagnostics.
    pub deferred_items: Vec<Deferred>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Winner {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeVerdict {
    RemoteNewer,
    LocalNewer,
    Equal,
}

/// Same-path, different-size conflict (spec §4.8 Phase B, §1 conflict rule):
/// remote wins only if clearly newer; ties and local-newer both favor local.
fn size_mismatch_winner(local_mtime: SystemTime, remote_mtime: SystemTime) -> Winner {
    match remote_mtime.duration_since(local_mtime) {
        Ok(remote_ahead) if remote_ahead > CONFLICT_TOLERANCE => Winner::Remote,
        _ => Winner::Local,
    }
}

/// Same-path, same-size timestamp check (spec §4.8 Phase C): used only to
/// detect genuine drift, not to re-litigate an unchanged file every pass.
fn time_verdict(local_mtime: SystemTime, remote_mtime: SystemTime) -> TimeVerdict {
    if let Ok(remote_ahead) = remote_mtime.duration_since(local_mtime) {
        if remote_ahead > CONFLICT_TOLERANCE {
            return TimeVerdict::RemoteNewer;
        }
    }
    if let Ok(local_ahead) = local_mtime.duration_since(remote_mtime) {
        if local_ahead > CONFLICT_TOLERANCE {
            return TimeVerdict::LocalNewer;
        }
    }
    TimeVerdict::Equal
}

pub struct Reconciler {
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn MetadataStore>,
    pipeline: Arc<Pipeline>,
    echo: Arc<EchoSuppressor>,
    /// Shared with the Sync Coordinator; read before every mutating step
    /// (spec §4.8 "workspace guard", §3 invariant I3).
    active_workspace: Arc<AtomicI64>,
}

impl Reconciler {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        store: Arc<dyn MetadataStore>,
        pipeline: Arc<Pipeline>,
        echo: Arc<EchoSuppressor>,
        active_workspace: Arc<AtomicI64>,
    ) -> Self {
        Self {
            remote,
            store,
            pipeline,
            echo,
            active_workspace,
        }
    }

    fn check_workspace(&self, expected: WorkspaceId) -> Result<(), ReconcileError> {
        let actual = self.active_workspace.load(Ordering::SeqCst);
        if actual != expected {
            return Err(ReconcileError::WorkspaceChanged { expected, actual });
        }
        Ok(())
    }

    #[instrument(skip(self, sync_root, cancel), fields(workspace))]
    pub async fn run_pass(
        &self,
        workspace: WorkspaceId,
        sync_root: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<ReconcileSummary, ReconcileError> {
        self.check_workspace(workspace)?;
        let mut summary = ReconcileSummary::default();

        // Phase A: snapshot.
        let mut tree = self.snapshot(workspace, cancel).await?;
        self.check_workspace(workspace)?;
        self.materialize_folders(&tree, sync_root, workspace).await?;

        let usage = self.remote.space_usage(workspace, cancel).await?;
        let mut enqueued_bytes: u64 = 0;

        // Every path this pass has already resolved one way or another;
        // Phase C skips these so a file just uploaded or downloaded in
        // Phase B is never re-litigated by the timestamp check (spec §8 P3).
        let mut resolved_this_pass: HashSet<String> = HashSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut local_newer: Vec<(String, RemoteEntry)> = Vec::new();

        // Phase B: upload local-only files and new folders.
        self.check_workspace(workspace)?;
        self.upload_new_local_entries(
            workspace,
            sync_root,
            &mut tree,
            &mut in_flight,
            &mut resolved_this_pass,
            usage.available,
            &mut enqueued_bytes,
            &mut summary,
            cancel,
        )
        .await?;

        // Phase C: download remote-newer or remote-only files.
        self.check_workspace(workspace)?;
        self.download_remote_newer_or_only(
            workspace,
            sync_root,
            &tree,
            &resolved_this_pass,
            &mut local_newer,
            &mut summary,
        )
        .await?;

        // Phase D: upload local-newer files flagged by Phase C.
        self.check_workspace(workspace)?;
        self.upload_local_newer(
            workspace,
            sync_root,
            &mut tree,
            &local_newer,
            usage.available,
            &mut enqueued_bytes,
            &mut summary,
        )
        .await?;

        Ok(summary)
    }

    /// Phase A: `list_root` then recursively `list_folder` for every
    /// discovered folder, one level at a time, with each level's listings
    /// fanned out concurrently (spec §4.8).
    async fn snapshot(
        &self,
        workspace: WorkspaceId,
        cancel: &CancellationToken,
    ) -> Result<RemoteTreeMap, ReconcileError> {
        let mut tree = RemoteTreeMap::new();
        let root_entries = self.remote.list_root(workspace, cancel).await?;

        let mut frontier: Vec<(String, EntryId)> = Vec::new();
        for entry in root_entries {
            let path = entry.name.clone();
            if entry.is_folder() {
                frontier.push((path.clone(), entry.id));
            }
            tree.insert(path, entry);
        }

        while !frontier.is_empty() {
            let listings = futures::future::join_all(frontier.iter().map(|(prefix, folder_id)| {
                let remote = Arc::clone(&self.remote);
                let prefix = prefix.clone();
                let folder_id = *folder_id;
                let cancel = cancel.clone();
                async move {
                    let children = remote.list_folder(workspace, folder_id, &cancel).await;
                    (prefix, children)
                }
            }))
            .await;

            let mut next_frontier = Vec::new();
            for (prefix, children) in listings {
                let children = children?;
                for child in children {
                    let path = normalize_path(&[&prefix, &child.name]);
                    if child.is_folder() {
                        next_frontier.push((path.clone(), child.id));
                    }
                    tree.insert(path, child);
                }
            }
            frontier = next_frontier;
        }

        Ok(tree)
    }

    /// Ensures every remote folder has a corresponding local directory and
    /// Metadata Store row, independent of whether any file inside it needs
    /// transferring (spec scenario S1: the folder itself gets a LocalRecord).
    async fn materialize_folders(
        &self,
        tree: &RemoteTreeMap,
        sync_root: &Utf8Path,
        workspace: WorkspaceId,
    ) -> Result<(), ReconcileError> {
        for (relative_path, entry) in tree.folders() {
            let local_path = sync_root.join(relative_path);
            tokio::fs::create_dir_all(local_path.as_std_path())
                .await
                .map_err(|e| ReconcileError::Remote(crate::error::RemoteClientError::Other(e.into())))?;
            debug_assert_eq!(entry.workspace_id, workspace);
            self.store
                .upsert(record_now(entry.clone(), local_path))
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_new_local_entries(
        &self,
        workspace: WorkspaceId,
        sync_root: &Utf8Path,
        tree: &mut RemoteTreeMap,
        in_flight: &mut HashSet<String>,
        resolved_this_pass: &mut HashSet<String>,
        available: u64,
        enqueued_bytes: &mut u64,
        summary: &mut ReconcileSummary,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        let (mut dirs, files) = walk_local_tree(sync_root).await?;
        dirs.sort_by_key(|(relative, _)| relative.matches('/').count());

        for (relative, _local_path) in &dirs {
            self.check_workspace(workspace)?;
            if tree.contains(relative) {
                continue;
            }
            match resolve_parent(relative, tree) {
                ResolvedParent::Unresolved => {
                    summary.deferred += 1;
                    summary.deferred_items.push(Deferred {
                        path: relative.clone(),
                        reason: "parent folder not yet resolved".to_string(),
                        since: SystemTime::now(),
                    });
                    warn!(path = %relative, "deferring folder creation: parent not yet resolved");
                    continue;
                }
                resolved => {
                    let (_, basename) = split_path(relative);
                    let parent_id = match resolved {
                        ResolvedParent::Root => None,
                        ResolvedParent::Folder(id) => Some(id),
                        ResolvedParent::Unresolved => unreachable!(),
                    };
                    match self.remote.create_folder(workspace, basename, parent_id, cancel).await {
                        Ok(entry) => {
                            tree.insert(relative.clone(), entry.clone());
                            let local_path = sync_root.join(relative);
                            self.store.upsert(record_now(entry, local_path)).await?;
                            summary.folders_created += 1;
                        }
                        Err(err) => {
                            summary.errors += 1;
                            warn!(path = %relative, error = %err, "folder creation failed");
                        }
                    }
                }
            }
        }

        for (relative, local_path) in &files {
            self.check_workspace(workspace)?;
            if in_flight.contains(relative) {
                continue;
            }
            let metadata = match tokio::fs::metadata(local_path.as_std_path()).await {
                Ok(m) => m,
                Err(e) => {
                    summary.errors += 1;
                    warn!(path = %relative, error = %e, "filesystem access error during upload walk");
                    continue;
                }
            };
            let local_size = metadata.len();
            let local_mtime = metadata.modified().unwrap_or(SystemTime::now());

            if let Some(existing) = tree.get(relative) {
                if existing.is_folder() {
                    continue;
                }
                if existing.size == local_size {
                    // Matching size (spec §4.8 Phase B: "record it locally
                    // and skip"); timestamp drift, if any, is left for
                    // Phase C to catch.
                    self.store
                        .upsert(record_now(existing.clone(), local_path.to_path_buf()))
                        .await?;
                    continue;
                }
                match size_mismatch_winner(local_mtime, existing.updated_at) {
                    Winner::Local => {
                        self.do_upload(
                            workspace,
                            tree,
                            relative,
                            local_path,
                            local_size,
                            available,
                            enqueued_bytes,
                            summary,
                        )
                        .await?;
                    }
                    Winner::Remote => {
                        let entry = existing.clone();
                        self.do_download(sync_root, &entry, relative, summary).await;
                    }
                }
                resolved_this_pass.insert(relative.clone());
                continue;
            }

            match resolve_parent(relative, tree) {
                ResolvedParent::Unresolved => {
                    summary.deferred += 1;
                    summary.deferred_items.push(Deferred {
                        path: relative.clone(),
                        reason: "parent folder not yet resolved".to_string(),
                        since: SystemTime::now(),
                    });
                    warn!(path = %relative, "deferring upload: parent not yet resolved");
                    continue;
                }
                _ => {
                    in_flight.insert(relative.clone());
                    self.do_upload(
                        workspace,
                        tree,
                        relative,
                        local_path,
                        local_size,
                        available,
                        enqueued_bytes,
                        summary,
                    )
                    .await?;
                    in_flight.remove(relative);
                    resolved_this_pass.insert(relative.clone());
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn do_upload(
        &self,
        workspace: WorkspaceId,
        tree: &mut RemoteTreeMap,
        relative: &str,
        local_path: &Utf8Path,
        local_size: u64,
        available: u64,
        enqueued_bytes: &mut u64,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        if self.echo.is_recent(local_path) {
            return Ok(());
        }
        if *enqueued_bytes + local_size > available {
            return Err(ReconcileError::QuotaExceeded {
                used: *enqueued_bytes,
                available,
            });
        }

        // Placeholder so a concurrent walk never double-enqueues the same
        // path (spec §4.8: "placeholders with id=-1 ... replaced or removed
        // at completion").
        let placeholder = placeholder_entry(workspace, relative, local_size);
        tree.insert(relative.to_string(), placeholder);

        let parent_id = match resolve_parent(relative, tree) {
            ResolvedParent::Folder(id) => Some(id),
            _ => None,
        };

        match self.pipeline.upload(workspace, local_path, parent_id).await {
            Ok(entry) => {
                *enqueued_bytes += local_size;
                tree.insert(relative.to_string(), entry.clone());
                self.echo.mark(local_path);
                self.store
                    .upsert(record_now(entry, local_path.to_path_buf()))
                    .await?;
                summary.uploaded += 1;
            }
            Err(err) => {
                tree.remove(relative);
                summary.errors += 1;
                warn!(path = %relative, error = %err, "upload failed");
            }
        }
        Ok(())
    }

    async fn do_download(
        &self,
        sync_root: &Utf8Path,
        entry: &RemoteEntry,
        relative: &str,
        summary: &mut ReconcileSummary,
    ) {
        let dest_dir = match split_path(relative).0 {
            Some(dir) => sync_root.join(dir),
            None => sync_root.to_path_buf(),
        };
        match self.pipeline.download(entry.workspace_id, entry, &dest_dir).await {
            Ok(path) => {
                self.echo.mark(&path);
                if let Err(err) = self.store.upsert(record_now(entry.clone(), path)).await {
                    warn!(path = %relative, error = %err, "metadata store upsert failed after download");
                }
                summary.downloaded += 1;
            }
            Err(err) => {
                summary.errors += 1;
                warn!(path = %relative, error = %err, "download failed");
            }
        }
    }

    async fn download_remote_newer_or_only(
        &self,
        workspace: WorkspaceId,
        sync_root: &Utf8Path,
        tree: &RemoteTreeMap,
        resolved_this_pass: &HashSet<String>,
        local_newer: &mut Vec<(String, RemoteEntry)>,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        for (relative, entry) in tree.iter() {
            if entry.kind != EntryKind::File || resolved_this_pass.contains(relative) {
                continue;
            }
            self.check_workspace(workspace)?;
            let local_path = sync_root.join(relative);
            let metadata = tokio::fs::metadata(local_path.as_std_path()).await;

            match metadata {
                Err(_) => {
                    self.do_download(sync_root, entry, relative, summary).await;
                }
                Ok(m) if m.len() == entry.size => {
                    let local_mtime = m.modified().unwrap_or(SystemTime::now());
                    match time_verdict(local_mtime, entry.updated_at) {
                        TimeVerdict::RemoteNewer => {
                            self.do_download(sync_root, entry, relative, summary).await;
                        }
                        TimeVerdict::LocalNewer => {
                            local_newer.push((relative.to_string(), entry.clone()));
                        }
                        TimeVerdict::Equal => {
                            self.store
                                .upsert(record_now(entry.clone(), local_path.clone()))
                                .await?;
                        }
                    }
                }
                Ok(_) => {
                    // Size mismatch: already resolved directly in Phase B.
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_local_newer(
        &self,
        workspace: WorkspaceId,
        sync_root: &Utf8Path,
        tree: &mut RemoteTreeMap,
        local_newer: &[(String, RemoteEntry)],
        available: u64,
        enqueued_bytes: &mut u64,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        for (relative, _entry) in local_newer {
            self.check_workspace(workspace)?;
            let local_path = sync_root.join(relative);
            let metadata = match tokio::fs::metadata(local_path.as_std_path()).await {
                Ok(m) => m,
                Err(e) => {
                    summary.errors += 1;
                    warn!(path = %relative, error = %e, "filesystem access error in Phase D");
                    continue;
                }
            };
            self.do_upload(
                workspace,
                tree,
                relative,
                &local_path,
                metadata.len(),
                available,
                enqueued_bytes,
                summary,
            )
            .await?;
        }
        Ok(())
    }
}

fn placeholder_entry(workspace: WorkspaceId, relative: &str, size: u64) -> RemoteEntry {
    let (_, basename) = split_path(relative);
    RemoteEntry {
        id: IN_FLIGHT_PLACEHOLDER_ID,
        name: basename.to_string(),
        kind: EntryKind::File,
        parent_id: None,
        size,
        hash: None,
        updated_at: SystemTime::now(),
        workspace_id: workspace,
    }
}

/// Walks `sync_root`, returning `(relative_path, absolute_path)` pairs for
/// directories and files separately, filtering the noise/VCS names spec
/// §4.6 lists (the Reconciler's own walk is subject to the same exclusions
/// as the File Watcher's).
async fn walk_local_tree(
    sync_root: &Utf8Path,
) -> Result<(Vec<(String, Utf8PathBuf)>, Vec<(String, Utf8PathBuf)>), ReconcileError> {
    let sync_root = sync_root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(sync_root.as_std_path())
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !crate::watcher::is_excluded_dir_name(e.file_name().to_string_lossy().as_ref()))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let Ok(abs) = Utf8PathBuf::try_from(entry.path().to_path_buf()) else {
                continue;
            };
            let Ok(relative) = abs.strip_prefix(&sync_root) else {
                continue;
            };
            let relative = relative.as_str().replace('\\', "/");
            if crate::watcher::is_noise_name(entry.file_name().to_string_lossy().as_ref()) {
                continue;
            }
            if entry.file_type().is_dir() {
                dirs.push((relative, abs));
            } else if entry.file_type().is_file() {
                files.push((relative, abs));
            }
        }
        (dirs, files)
    })
    .await
    .map_err(|e| ReconcileError::Remote(crate::error::RemoteClientError::Other(e.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::metadata_store::JsonFileMetadataStore;
    use crate::remote_client::MockRemoteClient;
    use std::sync::atomic::AtomicI64;
    use std::time::Duration as StdDuration;

    fn fixture(
        workspace: WorkspaceId,
    ) -> (
        Arc<MockRemoteClient>,
        Arc<JsonFileMetadataStore>,
        Arc<Pipeline>,
        Arc<EchoSuppressor>,
        Arc<AtomicI64>,
        camino_tempfile::Utf8TempDir,
        camino_tempfile::Utf8TempDir,
    ) {
        let remote = Arc::new(MockRemoteClient::new(workspace, 10_000_000));
        let store_dir = camino_tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileMetadataStore::open(store_dir.path().join("ms.json")).unwrap());
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&remote) as Arc<dyn RemoteClient>,
            8,
            EventBus::new(),
            3 * 1024 * 1024,
        ));
        let echo = Arc::new(EchoSuppressor::new(StdDuration::from_secs(7200)));
        let active_workspace = Arc::new(AtomicI64::new(workspace));
        let sync_root_dir = camino_tempfile::tempdir().unwrap();
        (remote, store, pipeline, echo, active_workspace, store_dir, sync_root_dir)
    }

    fn reconciler(
        remote: &Arc<MockRemoteClient>,
        store: &Arc<JsonFileMetadataStore>,
        pipeline: &Arc<Pipeline>,
        echo: &Arc<EchoSuppressor>,
        active_workspace: &Arc<AtomicI64>,
    ) -> Reconciler {
        Reconciler::new(
            Arc::clone(remote) as Arc<dyn RemoteClient>,
            Arc::clone(store) as Arc<dyn MetadataStore>,
            Arc::clone(pipeline),
            Arc::clone(echo),
            Arc::clone(active_workspace),
        )
    }

    // S1: remote-only folder+file downloads; second pass is a no-op.
    #[tokio::test]
    async fn scenario_s1_downloads_then_is_idempotent() {
        let (remote, store, pipeline, echo, active_workspace, _sd, sync_root) = fixture(1);
        let docs = remote.seed_folder("Docs", None);
        remote.seed_file("a.txt", Some(docs.id), &b"hello"[..], SystemTime::now());
        let rx = reconciler(&remote, &store, &pipeline, &echo, &active_workspace);
        let cancel = CancellationToken::new();

        let summary = rx.run_pass(1, sync_root.path(), &cancel).await.unwrap();
        assert_eq!(summary.downloaded, 1);
        assert!(sync_root.path().join("Docs/a.txt").exists());

        let records = store.get_all().await.unwrap();
        assert!(records.iter().any(|r| r.id() == docs.id));
        assert!(records.iter().any(|r| r.local_path.ends_with("Docs/a.txt")));

        let second = rx.run_pass(1, sync_root.path(), &cancel).await.unwrap();
        assert_eq!(second.uploaded, 0);
        assert_eq!(second.downloaded, 0);
    }

    // S2: new local folder+file upload, folder created before its child.
    #[tokio::test]
    async fn scenario_s2_uploads_folder_then_file() {
        let (remote, store, pipeline, echo, active_workspace, _sd, sync_root) = fixture(1);
        tokio::fs::create_dir_all(sync_root.path().join("Meeting").as_std_path())
            .await
            .unwrap();
        tokio::fs::write(
            sync_root.path().join("Meeting/notes.md").as_std_path(),
            b"hello world!",
        )
        .await
        .unwrap();

        let rx = reconciler(&remote, &store, &pipeline, &echo, &active_workspace);
        let cancel = CancellationToken::new();
        let summary = rx.run_pass(1, sync_root.path(), &cancel).await.unwrap();

        assert_eq!(summary.folders_created, 1);
        assert_eq!(summary.uploaded, 1);

        let listed = remote.entry_count();
        assert_eq!(listed, 2);
        let roots = remote.list_root(1, &cancel).await.unwrap();
        let folder = roots.iter().find(|e| e.name == "Meeting").unwrap();
        let file_record = store
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.entry.name == "notes.md")
            .unwrap();
        assert_eq!(file_record.entry.parent_id, Some(folder.id));
    }

    // Regression: a local file already matching the remote copy by path and
    // size at the time of the very first pass must still get a LocalRecord
    // (spec §4.8 Phase B: "record it locally and skip"). Without it, the
    // Watcher's Modified handler has nothing to look up and silently drops
    // every future edit to that path.
    #[tokio::test]
    async fn pre_matching_local_file_is_recorded_on_first_pass() {
        let (remote, store, pipeline, echo, active_workspace, _sd, sync_root) = fixture(1);
        let local_path = sync_root.path().join("a.txt");
        let content = b"unchanged";
        tokio::fs::write(local_path.as_std_path(), &content[..]).await.unwrap();
        remote.seed_file("a.txt", None, &content[..], SystemTime::now());

        let rx = reconciler(&remote, &store, &pipeline, &echo, &active_workspace);
        let cancel = CancellationToken::new();
        let summary = rx.run_pass(1, sync_root.path(), &cancel).await.unwrap();

        assert_eq!(summary.uploaded, 0);
        assert_eq!(summary.downloaded, 0);

        let record = store
            .get_by_path(&local_path)
            .await
            .unwrap()
            .expect("a pre-matching local file must still be recorded in the Metadata Store");
        assert_eq!(record.local_path, local_path);
    }

    // S3: remote copy wins a size conflict; the path lands in the Echo
    // Suppressor so a later Modified event would not re-upload it.
    #[tokio::test]
    async fn scenario_s3_remote_wins_size_conflict_and_marks_echo() {
        let (remote, store, pipeline, echo, active_workspace, _sd, sync_root) = fixture(1);
        let local_path = sync_root.path().join("x.bin");
        tokio::fs::write(local_path.as_std_path(), vec![0u8; 100]).await.unwrap();
        let old_mtime = filetime::FileTime::from_system_time(SystemTime::now() - StdDuration::from_secs(600));
        filetime::set_file_mtime(local_path.as_std_path(), old_mtime).unwrap();

        remote.seed_file(
            "x.bin",
            None,
            vec![1u8; 120],
            SystemTime::now(),
        );

        let rx = reconciler(&remote, &store, &pipeline, &echo, &active_workspace);
        let cancel = CancellationToken::new();
        let summary = rx.run_pass(1, sync_root.path(), &cancel).await.unwrap();

        assert_eq!(summary.downloaded, 1);
        let content = tokio::fs::read(local_path.as_std_path()).await.unwrap();
        assert_eq!(content.len(), 120);
        assert!(echo.is_recent(&local_path));
    }

    // S4: workspace switches mid-pass; the guard aborts before Phase B
    // issues more work and leaves the Metadata Store untouched.
    #[tokio::test]
    async fn scenario_s4_workspace_drift_aborts_pass() {
        let (remote, store, pipeline, echo, active_workspace, _sd, sync_root) = fixture(1);
        active_workspace.store(2, Ordering::SeqCst);
        let rx = reconciler(&remote, &store, &pipeline, &echo, &active_workspace);
        let cancel = CancellationToken::new();

        let result = rx.run_pass(1, sync_root.path(), &cancel).await;
        assert!(matches!(
            result,
            Err(ReconcileError::WorkspaceChanged { expected: 1, actual: 2 })
        ));
        assert!(store.get_all().await.unwrap().is_empty());
    }

    // S6: a remote subtree absent locally is never deleted remotely; it
    // simply re-downloads on the next pass.
    #[tokio::test]
    async fn scenario_s6_absence_is_never_propagated_as_deletion() {
        let (remote, store, pipeline, echo, active_workspace, _sd, sync_root) = fixture(1);
        let a = remote.seed_folder("A", None);
        let b = remote.seed_folder("B", Some(a.id));
        remote.seed_file("file.txt", Some(b.id), &b"payload"[..], SystemTime::now());

        let rx = reconciler(&remote, &store, &pipeline, &echo, &active_workspace);
        let cancel = CancellationToken::new();
        rx.run_pass(1, sync_root.path(), &cancel).await.unwrap();
        assert!(sync_root.path().join("A/B/file.txt").exists());

        tokio::fs::remove_dir_all(sync_root.path().join("A").as_std_path())
            .await
            .unwrap();

        let summary = rx.run_pass(1, sync_root.path(), &cancel).await.unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(remote.entry_count(), 3);
        assert!(sync_root.path().join("A/B/file.txt").exists());
    }
}
