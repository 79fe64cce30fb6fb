//! Remote Client (spec §4.2): logical operations against the cloud drive,
//! parameterized by a workspace identifier.
//!
//! Grounded on `remote_storage::RemoteStorage`: one narrow trait describing
//! the logical contract, implemented by whichever concrete transport is in
//! play (`LocalFs | AwsS3 | AzureBlob | Unreliable` there becomes
//! `HttpRemoteClient | MockRemoteClient` here), addressed by every caller
//! as `Arc<dyn RemoteClient>`.

pub mod http;
pub mod mock;

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

use crate::error::RemoteClientError;
use crate::model::{EntryId, RemoteEntry, WorkspaceId};

pub use http::HttpRemoteClient;
pub use mock::MockRemoteClient;

/// Current used/available bytes for a workspace (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceUsage {
    pub used: u64,
    pub available: u64,
}

#[async_trait::async_trait]
pub trait RemoteClient: Send + Sync {
    async fn list_root(
        &self,
        workspace: WorkspaceId,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteEntry>, RemoteClientError>;

    async fn list_folder(
        &self,
        workspace: WorkspaceId,
        folder_id: EntryId,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteEntry>, RemoteClientError>;

    /// Streams the file body. Before sending, performs a duplicate check by
    /// listing the target folder and returning the existing entry if
    /// `(name, size)` matches (spec §4.2).
    async fn upload(
        &self,
        workspace: WorkspaceId,
        local_path: &Utf8Path,
        parent_id: Option<EntryId>,
        cancel: &CancellationToken,
    ) -> Result<RemoteEntry, RemoteClientError>;

    /// Streams to disk, sanitizing the filename for the host filesystem.
    /// Returns the absolute path of the written file.
    async fn download(
        &self,
        workspace: WorkspaceId,
        entry: &RemoteEntry,
        dest_dir: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, RemoteClientError>;

    /// Idempotent: if the remote reports "already exists", the caller
    /// re-lists and returns the existing entry (spec §4.2).
    async fn create_folder(
        &self,
        workspace: WorkspaceId,
        name: &str,
        parent_id: Option<EntryId>,
        cancel: &CancellationToken,
    ) -> Result<RemoteEntry, RemoteClientError>;

    async fn rename(
        &self,
        workspace: WorkspaceId,
        id: EntryId,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, RemoteClientError>;

    async fn delete(
        &self,
        workspace: WorkspaceId,
        id: EntryId,
        cancel: &CancellationToken,
    ) -> Result<bool, RemoteClientError>;

    async fn space_usage(
        &self,
        workspace: WorkspaceId,
        cancel: &CancellationToken,
    ) -> Result<SpaceUsage, RemoteClientError>;
}

/// `(name, size)` match used by upload's duplicate check: case-insensitive
/// name equality, or an encoding-mangled-name heuristic that compares names
/// with non-alphanumeric characters stripped (spec §4.2).
pub fn names_match_for_duplicate(a: &str, b: &str) -> bool {
    if a.eq_ignore_ascii_case(b) {
        return true;
    }
    let strip = |s: &str| -> String {
        s.chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(|c| c.to_lowercase())
            .collect()
    };
    let (sa, sb) = (strip(a), strip(b));
    !sa.is_empty() && sa == sb
}

/// Replaces characters invalid on common host filesystems (Windows is the
/// strictest: `< > : " / \ | ? *` plus control characters) with `_`, so a
/// download can never fail purely because of the remote's display name
/// (spec §4.2: "sanitizing the filename for the host filesystem").
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = sanitized.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_match_case_insensitively() {
        assert!(names_match_for_duplicate("Report.PDF", "report.pdf"));
    }

    #[test]
    fn duplicate_names_match_on_mangled_encoding() {
        // Same content stripped of punctuation/whitespace differences that
        // commonly appear when a filename is re-encoded.
        assert!(names_match_for_duplicate("My File (1).txt", "my-file-1.txt"));
    }

    #[test]
    fn unrelated_names_do_not_match() {
        assert!(!names_match_for_duplicate("a.txt", "b.txt"));
    }

    #[test]
    fn sanitize_filename_replaces_invalid_characters() {
        assert_eq!(sanitize_filename("a:b/c*d?.txt"), "a_b_c_d_.txt");
    }

    #[test]
    fn sanitize_filename_never_returns_empty() {
        assert_eq!(sanitize_filename("***"), "_");
    }
}
