//! In-memory [`RemoteClient`] used by the integration scenarios (S1-S6),
//! the property tests (P1-P7) and as a testing seam anywhere a real HTTP
//! endpoint would otherwise be required.
//!
//! Grounded on `remote_storage`'s `LocalFs` (an in-process stand-in for a
//! real backend) composed with its `UnreliableWrapper` (fault injection by
//! failing the first N calls), both from `remote_storage::lib`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::error::RemoteClientError;
use crate::model::{EntryId, EntryKind, RemoteEntry, WorkspaceId};

use super::{names_match_for_duplicate, sanitize_filename, RemoteClient, SpaceUsage};

#[derive(Clone)]
struct StoredEntry {
    entry: RemoteEntry,
    /// File content, absent for folders.
    content: Option<Bytes>,
}

struct State {
    entries: HashMap<EntryId, StoredEntry>,
    next_id: AtomicI64,
}

/// Deterministic in-memory remote. `available_bytes` models the workspace
/// quota consulted by `space_usage` (spec §4.2, §7 class 6).
pub struct MockRemoteClient {
    state: Mutex<State>,
    workspace_id: WorkspaceId,
    available_bytes: u64,
    /// Number of upcoming calls (across all operations) that should fail
    /// with a retryable error before succeeding, mirroring
    /// `UnreliableWrapper::fail_first`.
    fail_first: AtomicU32,
}

impl MockRemoteClient {
    pub fn new(workspace_id: WorkspaceId, available_bytes: u64) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                next_id: AtomicI64::new(1),
            }),
            workspace_id,
            available_bytes,
            fail_first: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` operations fail with a transient error,
    /// exercising the backoff helper the way `UnreliableWrapper` does for
    /// `remote_storage`.
    pub fn fail_next(&self, count: u32) {
        self.fail_first.store(count, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<(), RemoteClientError> {
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(RemoteClientError::ConnectionReset);
        }
        Ok(())
    }

    fn check_workspace(&self, workspace: WorkspaceId) -> Result<(), RemoteClientError> {
        if workspace != self.workspace_id {
            return Err(RemoteClientError::Other(anyhow::anyhow!(
                "workspace mismatch: client bound to {}, called with {workspace}",
                self.workspace_id
            )));
        }
        Ok(())
    }

    /// Seeds an entry directly, bypassing the normal upload path. Used by
    /// tests to set up a pre-existing remote tree (S1, S3, S6).
    pub fn seed_folder(&self, name: &str, parent_id: Option<EntryId>) -> RemoteEntry {
        let mut guard = self.state.lock();
        let id = guard.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = RemoteEntry {
            id,
            name: name.to_string(),
            kind: EntryKind::Folder,
            parent_id,
            size: 0,
            hash: None,
            updated_at: SystemTime::now(),
            workspace_id: self.workspace_id,
        };
        guard
            .entries
            .insert(id, StoredEntry { entry: entry.clone(), content: None });
        entry
    }

    pub fn seed_file(
        &self,
        name: &str,
        parent_id: Option<EntryId>,
        content: impl Into<Bytes>,
        updated_at: SystemTime,
    ) -> RemoteEntry {
        let content = content.into();
        let mut guard = self.state.lock();
        let id = guard.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = RemoteEntry {
            id,
            name: name.to_string(),
            kind: EntryKind::File,
            parent_id,
            size: content.len() as u64,
            hash: Some(content_hash(&content)),
            updated_at,
            workspace_id: self.workspace_id,
        };
        guard.entries.insert(
            id,
            StoredEntry {
                entry: entry.clone(),
                content: Some(content),
            },
        );
        entry
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }
}

/// Content fingerprint for the opaque `hash` field real backends expose,
/// computed the way `HttpRemoteClient`'s real counterpart would hash a body.
fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}

#[async_trait::async_trait]
impl RemoteClient for MockRemoteClient {
    async fn list_root(
        &self,
        workspace: WorkspaceId,
        _cancel: &CancellationToken,
    ) -> Result<Vec<RemoteEntry>, RemoteClientError> {
        self.check_workspace(workspace)?;
        self.maybe_fail()?;
        let guard = self.state.lock();
        Ok(guard
            .entries
            .values()
            .filter(|e| e.entry.parent_id.is_none())
            .map(|e| e.entry.clone())
            .collect())
    }

    async fn list_folder(
        &self,
        workspace: WorkspaceId,
        folder_id: EntryId,
        _cancel: &CancellationToken,
    ) -> Result<Vec<RemoteEntry>, RemoteClientError> {
        self.check_workspace(workspace)?;
        self.maybe_fail()?;
        let guard = self.state.lock();
        Ok(guard
            .entries
            .values()
            .filter(|e| e.entry.parent_id == Some(folder_id))
            .map(|e| e.entry.clone())
            .collect())
    }

    async fn upload(
        &self,
        workspace: WorkspaceId,
        local_path: &Utf8Path,
        parent_id: Option<EntryId>,
        _cancel: &CancellationToken,
    ) -> Result<RemoteEntry, RemoteClientError> {
        self.check_workspace(workspace)?;
        self.maybe_fail()?;
        let bytes = tokio::fs::read(local_path.as_std_path())
            .await
            .map_err(|e| RemoteClientError::Other(e.into()))?;
        let file_name = local_path
            .file_name()
            .ok_or_else(|| RemoteClientError::Other(anyhow::anyhow!("path has no file name")))?
            .to_string();

        {
            let guard = self.state.lock();
            if let Some(existing) = guard.entries.values().find(|e| {
                e.entry.parent_id == parent_id
                    && e.entry.is_file()
                    && e.entry.size == bytes.len() as u64
                    && names_match_for_duplicate(&e.entry.name, &file_name)
            }) {
                return Ok(existing.entry.clone());
            }
        }

        if bytes.len() as u64 > self.available_bytes {
            return Err(RemoteClientError::QuotaExceeded {
                used: 0,
                available: self.available_bytes,
            });
        }

        let mut guard = self.state.lock();
        let id = guard.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = RemoteEntry {
            id,
            name: file_name,
            kind: EntryKind::File,
            parent_id,
            size: bytes.len() as u64,
            hash: Some(content_hash(&bytes)),
            updated_at: SystemTime::now(),
            workspace_id: workspace,
        };
        guard.entries.insert(
            id,
            StoredEntry {
                entry: entry.clone(),
                content: Some(Bytes::from(bytes)),
            },
        );
        Ok(entry)
    }

    async fn download(
        &self,
        workspace: WorkspaceId,
        entry: &RemoteEntry,
        dest_dir: &Utf8Path,
        _cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, RemoteClientError> {
        self.check_workspace(workspace)?;
        self.maybe_fail()?;
        let content = {
            let guard = self.state.lock();
            guard
                .entries
                .get(&entry.id)
                .and_then(|e| e.content.clone())
                .ok_or(RemoteClientError::NotFound(entry.id))?
        };
        let dest_path = dest_dir.join(sanitize_filename(&entry.name));
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent.as_std_path())
                .await
                .map_err(|e| RemoteClientError::Other(e.into()))?;
        }
        tokio::fs::write(dest_path.as_std_path(), &content)
            .await
            .map_err(|e| RemoteClientError::Other(e.into()))?;
        Ok(dest_path)
    }

    async fn create_folder(
        &self,
        workspace: WorkspaceId,
        name: &str,
        parent_id: Option<EntryId>,
        _cancel: &CancellationToken,
    ) -> Result<RemoteEntry, RemoteClientError> {
        self.check_workspace(workspace)?;
        self.maybe_fail()?;
        {
            let guard = self.state.lock();
            if let Some(existing) = guard.entries.values().find(|e| {
                e.entry.parent_id == parent_id && e.entry.is_folder() && e.entry.name.eq_ignore_ascii_case(name)
            }) {
                // Idempotent: "already exists" re-lookup path (spec §4.2).
                return Ok(existing.entry.clone());
            }
        }
        let mut guard = self.state.lock();
        let id = guard.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = RemoteEntry {
            id,
            name: name.to_string(),
            kind: EntryKind::Folder,
            parent_id,
            size: 0,
            hash: None,
            updated_at: SystemTime::now(),
            workspace_id: workspace,
        };
        guard
            .entries
            .insert(id, StoredEntry { entry: entry.clone(), content: None });
        Ok(entry)
    }

    async fn rename(
        &self,
        workspace: WorkspaceId,
        id: EntryId,
        new_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool, RemoteClientError> {
        self.check_workspace(workspace)?;
        self.maybe_fail()?;
        let mut guard = self.state.lock();
        match guard.entries.get_mut(&id) {
            Some(stored) => {
                stored.entry.name = new_name.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(
        &self,
        workspace: WorkspaceId,
        id: EntryId,
        _cancel: &CancellationToken,
    ) -> Result<bool, RemoteClientError> {
        self.check_workspace(workspace)?;
        self.maybe_fail()?;
        let mut guard = self.state.lock();
        Ok(guard.entries.remove(&id).is_some())
    }

    async fn space_usage(
        &self,
        workspace: WorkspaceId,
        _cancel: &CancellationToken,
    ) -> Result<SpaceUsage, RemoteClientError> {
        self.check_workspace(workspace)?;
        self.maybe_fail()?;
        let guard = self.state.lock();
        let used: u64 = guard
            .entries
            .values()
            .filter_map(|e| e.content.as_ref().map(|c| c.len() as u64))
            .sum();
        Ok(SpaceUsage {
            used,
            available: self.available_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_list_round_trips() {
        let client = MockRemoteClient::new(1, 1_000_000);
        let cancel = CancellationToken::new();
        let dir = camino_tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        tokio::fs::write(file_path.as_std_path(), b"hello").await.unwrap();

        let entry = client.upload(1, &file_path, None, &cancel).await.unwrap();
        assert_eq!(entry.size, 5);

        let listed = client.list_root(1, &cancel).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, entry.id);
    }

    #[tokio::test]
    async fn upload_is_idempotent_for_matching_name_and_size() {
        let client = MockRemoteClient::new(1, 1_000_000);
        let cancel = CancellationToken::new();
        let dir = camino_tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        tokio::fs::write(file_path.as_std_path(), b"hello").await.unwrap();

        let first = client.upload(1, &file_path, None, &cancel).await.unwrap();
        let second = client.upload(1, &file_path, None, &cancel).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(client.entry_count(), 1);
    }

    #[tokio::test]
    async fn workspace_mismatch_is_rejected() {
        let client = MockRemoteClient::new(1, 1_000_000);
        let cancel = CancellationToken::new();
        let result = client.list_root(2, &cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn create_folder_is_idempotent_on_conflict() {
        let client = MockRemoteClient::new(1, 1_000_000);
        let cancel = CancellationToken::new();
        let first = client.create_folder(1, "Docs", None, &cancel).await.unwrap();
        let second = client.create_folder(1, "Docs", None, &cancel).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn quota_exceeded_is_surfaced_before_storing() {
        let client = MockRemoteClient::new(1, 2);
        let cancel = CancellationToken::new();
        let dir = camino_tempfile::tempdir().unwrap();
        let file_path = dir.path().join("big.bin");
        tokio::fs::write(file_path.as_std_path(), vec![0u8; 10]).await.unwrap();
        let result = client.upload(1, &file_path, None, &cancel).await;
        assert!(matches!(result, Err(RemoteClientError::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn fail_next_forces_transient_errors() {
        let client = MockRemoteClient::new(1, 1_000_000);
        let cancel = CancellationToken::new();
        client.fail_next(2);
        assert!(client.list_root(1, &cancel).await.is_err());
        assert!(client.list_root(1, &cancel).await.is_err());
        assert!(client.list_root(1, &cancel).await.is_ok());
    }
}
