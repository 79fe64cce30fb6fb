//! Error taxonomy (spec §7). One enum per component boundary, each variant
//! tagged with which of the seven error classes it belongs to so that
//! propagation policy stays obvious at the call site.
//!
//! Style grounded on `pageserver::tenant`'s per-operation `thiserror` enums
//! (`GetTimelineError`, `CreateTimelineError`, `GcError`).

use std::time::SystemTime;

use camino::Utf8PathBuf;

use crate::model::EntryId;

/// Classifies whether an error should be retried by [`crate::backoff::retry`].
/// Grounded on the retry/non-retry split spelled out for the Remote Client in
/// spec §4.2.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Class 1 ("Transient network") and class 2 ("Server rejection for
/// size/policy") from spec §7, plus the authentication-lapse and quota
/// classes (3, 6) that every remote operation can surface.
#[derive(Debug, thiserror::Error)]
pub enum RemoteClientError {
    #[error("connection reset or closed")]
    ConnectionReset,
    #[error("request timed out")]
    Timeout,
    #[error("server error ({status})")]
    ServerError { status: u16 },
    #[error("gateway error ({status})")]
    GatewayError { status: u16 },
    #[error("unprocessable entity on a large body, treated as transient overload")]
    UnprocessableLargeBody,
    #[error("rejected: {status} {message}")]
    Rejected { status: u16, message: String },
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("session expired, re-authentication required")]
    SessionExpired,
    #[error("storage quota exceeded: {used} of {available} bytes used")]
    QuotaExceeded { used: u64, available: u64 },
    #[error("entry {0} not found")]
    NotFound(EntryId),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Retryable for RemoteClientError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionReset
                | Self::Timeout
                | Self::ServerError { .. }
                | Self::GatewayError { .. }
                | Self::UnprocessableLargeBody
        )
    }
}

/// Class 4 ("Filesystem access"): per-file, logged and skipped, reconcile
/// continues.
#[derive(Debug, thiserror::Error)]
pub enum FilesystemError {
    #[error("io error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path {0} is not valid UTF-8")]
    NotUtf8(std::path::PathBuf),
}

/// Metadata Store failures. Transient I/O is retried by the caller; logical
/// errors (missing row on delete) are non-fatal (spec §4.1).
#[derive(Debug, thiserror::Error)]
pub enum MetadataStoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no record with id {0}")]
    NotFound(EntryId),
}

/// Reconcile-pass-level errors (spec §4.8, §7 classes 3, 5, 6, 7).
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Class 5: the active workspace changed mid-pass; the pass must abort
    /// without touching the Metadata Store further.
    #[error("workspace changed from {expected} to {actual} during pass")]
    WorkspaceChanged { expected: i64, actual: i64 },
    /// Class 3: coordinator must halt periodic sync and request re-auth.
    #[error("session expired during reconcile")]
    SessionExpired,
    /// Class 6, surfaced before any upload in the pass is issued.
    #[error("storage quota exceeded: {used} of {available} bytes used")]
    QuotaExceeded { used: u64, available: u64 },
    /// Class 7: an invariant could not be satisfied and the operation was
    /// deferred rather than forced.
    #[error("could not resolve parent folder for {path}; deferred")]
    UnresolvedParent { path: String },
    #[error("reconcile pass exceeded its time budget and was cancelled")]
    Stuck,
    #[error("pass was cancelled")]
    Cancelled,
    #[error(transparent)]
    Remote(#[from] RemoteClientError),
    #[error(transparent)]
    Store(#[from] MetadataStoreError),
}

/// Pipeline task failures (spec §4.7).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Remote(#[from] RemoteClientError),
    #[error("task was cancelled before completion")]
    Cancelled,
    #[error("retry budget exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32, source: RemoteClientError },
}

impl PipelineError {
    /// User-oriented message classified by size (spec §4.7).
    pub fn user_message(&self, size_bytes: u64) -> String {
        const MIB: u64 = 1024 * 1024;
        match self {
            PipelineError::Remote(RemoteClientError::PayloadTooLarge)
            | PipelineError::Remote(RemoteClientError::Rejected { .. })
            | PipelineError::RetriesExhausted { .. } => {
                if size_bytes > 100 * MIB {
                    "server rejected".to_string()
                } else if size_bytes > 50 * MIB {
                    "may be too large".to_string()
                } else {
                    "network error".to_string()
                }
            }
            PipelineError::Cancelled => "cancelled".to_string(),
            PipelineError::Remote(_) => "network error".to_string(),
        }
    }
}

/// A deferred item: the offending operation is held back rather than forced
/// (spec §4.8 invariant I5, §7 class 7), with the timestamp it was deferred
/// at so callers can re-attempt after folder creations settle.
#[derive(Debug, Clone, PartialEq)]
pub struct Deferred {
    pub path: String,
    pub reason: String,
    pub since: SystemTime,
}
