//! Metadata Store (spec §4.1): persistent mapping of remote entry identity
//! to local filesystem path, plus cached attributes.
//!
//! The physical storage engine is explicitly out of scope (spec §1) and
//! consumed only through this narrow trait; the default implementation
//! below is an in-memory map guarded per spec §5 ("writes serialized per
//! row by the store"), flushed to a JSON file on every mutating call so the
//! store survives process restart (spec §6).

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;

use crate::error::MetadataStoreError;
use crate::model::{EntryId, LocalRecord};

#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<LocalRecord>, MetadataStoreError>;
    async fn get_by_id(&self, id: EntryId) -> Result<Option<LocalRecord>, MetadataStoreError>;
    async fn get_by_path(
        &self,
        path: &Utf8Path,
    ) -> Result<Option<LocalRecord>, MetadataStoreError>;
    /// Secondary index lookup for invariant I2: a second `(name, parent_id,
    /// size)` match is treated as the same entity.
    async fn find(
        &self,
        name: &str,
        parent_id: Option<EntryId>,
        size: u64,
    ) -> Result<Option<LocalRecord>, MetadataStoreError>;
    async fn upsert(&self, record: LocalRecord) -> Result<(), MetadataStoreError>;
    /// Atomic batch upsert (spec §4.1: "batch upsert is atomic").
    async fn upsert_all(&self, records: Vec<LocalRecord>) -> Result<(), MetadataStoreError>;
    async fn delete(&self, id: EntryId) -> Result<(), MetadataStoreError>;
    async fn delete_by_path(&self, path: &Utf8Path) -> Result<(), MetadataStoreError>;
}

struct Inner {
    by_id: HashMap<EntryId, LocalRecord>,
}

impl Inner {
    fn identity_index(&self) -> HashMap<(String, Option<EntryId>, u64), EntryId> {
        self.by_id
            .values()
            .map(|r| (r.entry.identity(), r.id()))
            .collect()
    }
}

/// Default [`MetadataStore`] implementation: an in-memory map backed by a
/// JSON file flushed synchronously on every mutation, the way a small
/// embedded store is expected to behave when "the physical storage engine"
/// is a narrow interface rather than the point of the exercise.
pub struct JsonFileMetadataStore {
    path: Utf8PathBuf,
    inner: RwLock<Inner>,
}

impl JsonFileMetadataStore {
    /// Loads an existing store from `path`, or starts empty if it doesn't
    /// exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetadataStoreError> {
        let path = Utf8PathBuf::try_from(path.as_ref().to_path_buf())
            .map_err(|e| MetadataStoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        let records: Vec<LocalRecord> = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Vec::new()
        };
        let by_id = records.into_iter().map(|r| (r.id(), r)).collect();
        Ok(Self {
            path,
            inner: RwLock::new(Inner { by_id }),
        })
    }

    fn flush(&self, inner: &Inner) -> Result<(), MetadataStoreError> {
        let records: Vec<&LocalRecord> = inner.by_id.values().collect();
        let serialized = serde_json::to_string_pretty(&records)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serialized)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetadataStore for JsonFileMetadataStore {
    async fn get_all(&self) -> Result<Vec<LocalRecord>, MetadataStoreError> {
        Ok(self.inner.read().by_id.values().cloned().collect())
    }

    async fn get_by_id(&self, id: EntryId) -> Result<Option<LocalRecord>, MetadataStoreError> {
        Ok(self.inner.read().by_id.get(&id).cloned())
    }

    async fn get_by_path(
        &self,
        path: &Utf8Path,
    ) -> Result<Option<LocalRecord>, MetadataStoreError> {
        Ok(self
            .inner
            .read()
            .by_id
            .values()
            .find(|r| r.local_path == path)
            .cloned())
    }

    async fn find(
        &self,
        name: &str,
        parent_id: Option<EntryId>,
        size: u64,
    ) -> Result<Option<LocalRecord>, MetadataStoreError> {
        let identity = (name.to_lowercase(), parent_id, size);
        let guard = self.inner.read();
        let index = guard.identity_index();
        Ok(index
            .get(&identity)
            .and_then(|id| guard.by_id.get(id))
            .cloned())
    }

    async fn upsert(&self, record: LocalRecord) -> Result<(), MetadataStoreError> {
        let mut guard = self.inner.write();
        guard.by_id.insert(record.id(), record);
        self.flush(&guard)
    }

    async fn upsert_all(&self, records: Vec<LocalRecord>) -> Result<(), MetadataStoreError> {
        let mut guard = self.inner.write();
        for record in records {
            guard.by_id.insert(record.id(), record);
        }
        self.flush(&guard)
    }

    async fn delete(&self, id: EntryId) -> Result<(), MetadataStoreError> {
        let mut guard = self.inner.write();
        guard.by_id.remove(&id);
        self.flush(&guard)
    }

    async fn delete_by_path(&self, path: &Utf8Path) -> Result<(), MetadataStoreError> {
        let mut guard = self.inner.write();
        let matching: Vec<EntryId> = guard
            .by_id
            .values()
            .filter(|r| r.local_path == path)
            .map(|r| r.id())
            .collect();
        for id in matching {
            guard.by_id.remove(&id);
        }
        self.flush(&guard)
    }
}

/// Convenience constructor matching `LocalRecord`'s shape, used by the
/// Reconciler and File Watcher when upserting freshly synced entries.
pub fn record_now(entry: crate::model::RemoteEntry, local_path: Utf8PathBuf) -> LocalRecord {
    LocalRecord {
        entry,
        local_path,
        last_synced_at: SystemTime::now(),
    }
}
