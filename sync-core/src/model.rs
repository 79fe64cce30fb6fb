//! Data model shared by every component: [`RemoteEntry`], the persisted
//! [`LocalRecord`] and the transient [`RemoteTreeMap`] built per reconcile
//! pass (spec §3).

use std::collections::HashMap;
use std::time::SystemTime;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// A tenant-like container on the remote. Files belong to exactly one
/// workspace at any time; a workspace is not itself a folder.
pub type WorkspaceId = i64;

/// Stable identity assigned by the remote to a file or folder.
pub type EntryId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Folder,
}

/// A remote file or folder, as reported by [`crate::remote_client::RemoteClient`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub id: EntryId,
    pub name: String,
    pub kind: EntryKind,
    /// Absent means the workspace root.
    pub parent_id: Option<EntryId>,
    /// Byte length; meaningless for folders, always 0.
    pub size: u64,
    /// Opaque content identifier used for download addressing.
    pub hash: Option<String>,
    pub updated_at: SystemTime,
    pub workspace_id: WorkspaceId,
}

impl RemoteEntry {
    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File)
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, EntryKind::Folder)
    }

    /// The `(name, parent_id, size)` identity used by invariant I2 to detect
    /// two records describing the same entity.
    pub fn identity(&self) -> (String, Option<EntryId>, u64) {
        (self.name.to_lowercase(), self.parent_id, self.size)
    }
}

/// A row in the Metadata Store: a [`RemoteEntry`] plus where it lives on
/// disk and when it was last confirmed in sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub entry: RemoteEntry,
    pub local_path: Utf8PathBuf,
    pub last_synced_at: SystemTime,
}

impl LocalRecord {
    pub fn id(&self) -> EntryId {
        self.entry.id
    }
}

/// Transient path -> [`RemoteEntry`] snapshot built at the start of every
/// reconcile pass (spec §3, §4.8 Phase A) and discarded at pass end.
///
/// Keys are normalized relative paths: forward-slash separated, case
/// preserving but looked up case-insensitively (spec §3).
#[derive(Debug, Default)]
pub struct RemoteTreeMap {
    // Keyed by the lowercased normalized path; the original-case path and
    // entry are both kept so callers can recover the display name.
    entries: HashMap<String, (String, RemoteEntry)>,
}

/// Lowercase a normalized relative path for case-insensitive lookups,
/// without touching the separators.
pub fn normalize_key(path: &str) -> String {
    path.to_lowercase()
}

/// Forward-slash join, matching the remote's path convention regardless of
/// host OS separators (spec §3: "forward-slash separated").
pub fn normalize_path(components: &[&str]) -> String {
    components.join("/")
}

impl RemoteTreeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, relative_path: impl Into<String>, entry: RemoteEntry) {
        let path = relative_path.into();
        let key = normalize_key(&path);
        self.entries.insert(key, (path, entry));
    }

    pub fn get(&self, relative_path: &str) -> Option<&RemoteEntry> {
        self.entries.get(&normalize_key(relative_path)).map(|(_, e)| e)
    }

    pub fn remove(&mut self, relative_path: &str) -> Option<RemoteEntry> {
        self.entries.remove(&normalize_key(relative_path)).map(|(_, e)| e)
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        self.entries.contains_key(&normalize_key(relative_path))
    }

    /// Every folder entry, keyed by its normalized relative path. Used by
    /// the Path Resolver (spec §4.3).
    pub fn folders(&self) -> impl Iterator<Item = (&str, &RemoteEntry)> {
        self.entries
            .values()
            .filter(|(_, e)| e.is_folder())
            .map(|(p, e)| (p.as_str(), e))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RemoteEntry)> {
        self.entries.values().map(|(p, e)| (p.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: EntryId, kind: EntryKind) -> RemoteEntry {
        RemoteEntry {
            id,
            name: "x".into(),
            kind,
            parent_id: None,
            size: 0,
            hash: None,
            updated_at: SystemTime::UNIX_EPOCH,
            workspace_id: 1,
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut map = RemoteTreeMap::new();
        map.insert("Docs/Notes.md", entry(1, EntryKind::File));
        assert!(map.get("docs/notes.md").is_some());
        assert!(map.get("DOCS/NOTES.MD").is_some());
        assert_eq!(map.get("docs/notes.md").unwrap().id, 1);
    }

    #[test]
    fn folders_filters_by_kind() {
        let mut map = RemoteTreeMap::new();
        map.insert("Docs", entry(1, EntryKind::Folder));
        map.insert("Docs/a.txt", entry(2, EntryKind::File));
        let folders: Vec<_> = map.folders().collect();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].0, "Docs");
    }
}
