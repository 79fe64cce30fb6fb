//! Sync Coordinator (spec §4.9): owns the File Watcher's stop/restart
//! bracket around a reconcile pass, the periodic timer, and workspace
//! switches.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::SyncAgentConfig;
use crate::debouncer::Debouncer;
use crate::echo_suppressor::EchoSuppressor;
use crate::error::ReconcileError;
use crate::events::EventBus;
use crate::metadata_store::MetadataStore;
use crate::model::WorkspaceId;
use crate::pipeline::Pipeline;
use crate::reconciler::{ReconcileSummary, Reconciler};
use crate::remote_client::RemoteClient;
use crate::watcher::{FileWatcher, FileWatcherHandle};

/// Settle delay between a reconcile pass finishing and the File Watcher
/// restarting (spec §4.9: "a short settle delay").
const SETTLE_DELAY: Duration = Duration::from_millis(500);

struct WorkspaceState {
    workspace_id: WorkspaceId,
    workspace_name: String,
    sync_root: Utf8PathBuf,
    watcher_handle: Option<FileWatcherHandle>,
}

pub struct SyncCoordinator {
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn MetadataStore>,
    pipeline: Arc<Pipeline>,
    echo: Arc<EchoSuppressor>,
    debouncer: Arc<Debouncer>,
    events: EventBus,
    active_workspace: Arc<AtomicI64>,
    config: SyncAgentConfig,
    base_dir: Utf8PathBuf,
    state: Mutex<Option<WorkspaceState>>,
    shutdown: CancellationToken,
    echo_sweep_spawned: AtomicBool,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        store: Arc<dyn MetadataStore>,
        pipeline: Arc<Pipeline>,
        echo: Arc<EchoSuppressor>,
        debouncer: Arc<Debouncer>,
        events: EventBus,
        config: SyncAgentConfig,
        base_dir: Utf8PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            store,
            pipeline,
            echo,
            debouncer,
            events,
            active_workspace: Arc::new(AtomicI64::new(-1)),
            config,
            base_dir,
            state: Mutex::new(None),
            shutdown: CancellationToken::new(),
            echo_sweep_spawned: AtomicBool::new(false),
        })
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.store),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.echo),
            Arc::clone(&self.active_workspace),
        )
    }

    /// Starts syncing `workspace_id`: computes its local root, runs an
    /// initial reconcile pass, starts the File Watcher, and begins the
    /// periodic timer (spec §4.9).
    #[instrument(skip(self, workspace_name), fields(workspace_id))]
    pub async fn start(
        self: &Arc<Self>,
        workspace_id: WorkspaceId,
        workspace_name: &str,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let sync_root = self
            .base_dir
            .join(SyncAgentConfig::workspace_dir_name(workspace_id, workspace_name));
        tokio::fs::create_dir_all(sync_root.as_std_path())
            .await
            .map_err(|e| ReconcileError::Remote(crate::error::RemoteClientError::Other(e.into())))?;

        self.active_workspace.store(workspace_id, Ordering::SeqCst);
        *self.state.lock() = Some(WorkspaceState {
            workspace_id,
            workspace_name: workspace_name.to_string(),
            sync_root,
            watcher_handle: None,
        });

        let summary = self.run_pass_bracketed(workspace_id).await?;
        self.start_watcher(workspace_id);
        self.spawn_periodic_timer();
        self.spawn_echo_sweep();
        Ok(summary)
    }

    /// Stops the periodic timer and the File Watcher, without touching
    /// anything already on disk or in the Metadata Store.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.state.lock().as_mut().and_then(|s| s.watcher_handle.take());
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.pipeline.shutdown(Duration::from_secs(5)).await;
    }

    fn start_watcher(self: &Arc<Self>, workspace_id: WorkspaceId) {
        let sync_root = match self.state.lock().as_ref() {
            Some(s) if s.workspace_id == workspace_id => s.sync_root.clone(),
            _ => return,
        };
        let watcher = Arc::new(FileWatcher::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.store),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.echo),
            Arc::clone(&self.debouncer),
            self.events.clone(),
            Arc::clone(&self.active_workspace),
            workspace_id,
            sync_root,
            self.shutdown.clone(),
        ));
        match watcher.spawn() {
            Ok(handle) => {
                if let Some(state) = self.state.lock().as_mut() {
                    if state.workspace_id == workspace_id {
                        state.watcher_handle = Some(handle);
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to start file watcher"),
        }
    }

    /// Bracket-a-pass (spec §4.9): stop FW, run the reconciler, mark the
    /// whole tree as a fresh echo, restart FW after a settle delay.
    #[instrument(skip(self), fields(workspace_id))]
    async fn run_pass_bracketed(&self, workspace_id: WorkspaceId) -> Result<ReconcileSummary, ReconcileError> {
        let handle = self.state.lock().as_mut().and_then(|s| s.watcher_handle.take());
        if let Some(handle) = handle {
            handle.stop().await;
        }

        let sync_root = match self.state.lock().as_ref() {
            Some(s) if s.workspace_id == workspace_id => s.sync_root.clone(),
            _ => return Err(ReconcileError::WorkspaceChanged { expected: workspace_id, actual: -1 }),
        };

        let cancel = CancellationToken::new();
        let summary = self.reconciler().run_pass(workspace_id, &sync_root, &cancel).await?;
        info!(
            uploaded = summary.uploaded,
            downloaded = summary.downloaded,
            folders_created = summary.folders_created,
            deferred = summary.deferred,
            errors = summary.errors,
            "reconcile pass complete"
        );

        mark_tree_as_echo(&self.echo, &sync_root).await;
        tokio::time::sleep(SETTLE_DELAY).await;
        Ok(summary)
    }

    fn spawn_periodic_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let interval = this.config.effective_periodic_interval();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let workspace_id = this.active_workspace.load(Ordering::SeqCst);
                        if workspace_id < 0 {
                            continue;
                        }
                        if let Err(err) = this.run_pass_bracketed(workspace_id).await {
                            warn!(error = %err, "periodic reconcile pass failed");
                        }
                        this.start_watcher(workspace_id);
                    }
                }
            }
        });
    }

    /// Background sweep evicting expired Echo Suppressor entries (spec
    /// §4.4: "A background sweep evicts expired entries"). Runs once per
    /// coordinator lifetime; `start`/`switch_workspace` re-entering this
    /// method is a no-op.
    fn spawn_echo_sweep(self: &Arc<Self>) {
        if self.echo_sweep_spawned.swap(true, Ordering::SeqCst) {
            return;
        }
        let echo = Arc::clone(&self.echo);
        let shutdown = self.shutdown.clone();
        let interval = (self.config.echo_ttl / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => echo.sweep(),
                }
            }
        });
    }

    /// Orchestrates a workspace switch (spec §4.9): cancels in-flight work,
    /// updates the workspace-scoped local root, and re-runs reconcile.
    #[instrument(skip(self, workspace_name), fields(workspace_id))]
    pub async fn switch_workspace(
        self: &Arc<Self>,
        workspace_id: WorkspaceId,
        workspace_name: &str,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let handle = self.state.lock().as_mut().and_then(|s| s.watcher_handle.take());
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.pipeline.cancel_all();
        self.pipeline.shutdown(Duration::from_secs(5)).await;

        self.start(workspace_id, workspace_name).await
    }

    /// Detects a remote workspace rename and performs the corresponding
    /// local directory move, updating all derived paths atomically (spec
    /// §4.9).
    #[instrument(skip(self, new_name))]
    pub async fn handle_workspace_renamed(&self, new_name: &str) -> Result<(), ReconcileError> {
        let (workspace_id, old_root, old_name) = {
            let guard = self.state.lock();
            let Some(state) = guard.as_ref() else {
                return Ok(());
            };
            (state.workspace_id, state.sync_root.clone(), state.workspace_name.clone())
        };
        if old_name == new_name {
            return Ok(());
        }
        let new_root = self
            .base_dir
            .join(SyncAgentConfig::workspace_dir_name(workspace_id, new_name));

        tokio::fs::rename(old_root.as_std_path(), new_root.as_std_path())
            .await
            .map_err(|e| ReconcileError::Remote(crate::error::RemoteClientError::Other(e.into())))?;

        if let Some(state) = self.state.lock().as_mut() {
            state.sync_root = new_root;
            state.workspace_name = new_name.to_string();
        }
        Ok(())
    }

    pub fn active_workspace(&self) -> WorkspaceId {
        self.active_workspace.load(Ordering::SeqCst)
    }
}

async fn mark_tree_as_echo(echo: &EchoSuppressor, sync_root: &camino::Utf8Path) {
    let sync_root = sync_root.to_path_buf();
    let paths = tokio::task::spawn_blocking(move || {
        walkdir::WalkDir::new(sync_root.as_std_path())
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| camino::Utf8PathBuf::try_from(e.path().to_path_buf()).ok())
            .collect::<Vec<_>>()
    })
    .await
    .unwrap_or_default();

    for path in paths {
        echo.mark(&path);
    }
}
