//! Path Resolver (spec §4.3): a pure function computing a remote parent
//! folder id from a relative path using a [`RemoteTreeMap`].
//!
//! `Unresolved` is distinct from `Root` by design (spec §4.3, invariant I5,
//! property P4): a non-empty `dirname(p)` that is absent from the map must
//! never be silently treated as root.

use crate::model::{EntryId, RemoteTreeMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedParent {
    Root,
    Folder(EntryId),
    Unresolved,
}

/// Splits a normalized relative path into `(dirname, basename)`. `dirname`
/// is `None` when the path has no directory component (lives at root).
pub fn split_path(relative_path: &str) -> (Option<&str>, &str) {
    match relative_path.rsplit_once('/') {
        Some((dir, base)) if !dir.is_empty() => (Some(dir), base),
        Some((_, base)) => (None, base),
        None => (None, relative_path),
    }
}

/// Resolves the parent folder id for `relative_path` within `map`.
///
/// Callers must treat [`ResolvedParent::Unresolved`] as "defer, do not
/// upload, do not fall back to root" (spec §4.3, §3 invariant I5).
pub fn resolve_parent(relative_path: &str, map: &RemoteTreeMap) -> ResolvedParent {
    let (dirname, _basename) = split_path(relative_path);
    let Some(dirname) = dirname else {
        return ResolvedParent::Root;
    };
    match map.get(dirname) {
        Some(entry) if entry.is_folder() => ResolvedParent::Folder(entry.id),
        _ => ResolvedParent::Unresolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, RemoteEntry};
    use std::time::SystemTime;

    fn folder(id: EntryId) -> RemoteEntry {
        RemoteEntry {
            id,
            name: "folder".into(),
            kind: EntryKind::Folder,
            parent_id: None,
            size: 0,
            hash: None,
            updated_at: SystemTime::UNIX_EPOCH,
            workspace_id: 1,
        }
    }

    #[test]
    fn root_level_file_resolves_to_root() {
        let map = RemoteTreeMap::new();
        assert_eq!(resolve_parent("a.txt", &map), ResolvedParent::Root);
    }

    #[test]
    fn nested_file_resolves_known_folder() {
        let mut map = RemoteTreeMap::new();
        map.insert("Docs", folder(10));
        assert_eq!(
            resolve_parent("Docs/a.txt", &map),
            ResolvedParent::Folder(10)
        );
        // case-insensitive, per spec §3
        assert_eq!(
            resolve_parent("docs/a.txt", &map),
            ResolvedParent::Folder(10)
        );
    }

    #[test]
    fn unknown_parent_is_unresolved_not_root() {
        let map = RemoteTreeMap::new();
        assert_eq!(
            resolve_parent("Missing/a.txt", &map),
            ResolvedParent::Unresolved
        );
    }

    #[test]
    fn deeply_nested_requires_immediate_parent_not_ancestor() {
        let mut map = RemoteTreeMap::new();
        map.insert("A", folder(1));
        // "A/B" itself is not yet known, only "A" is.
        assert_eq!(
            resolve_parent("A/B/file.txt", &map),
            ResolvedParent::Unresolved
        );
    }
}
