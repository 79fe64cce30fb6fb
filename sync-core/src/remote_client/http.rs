//! HTTP-backed [`RemoteClient`] (spec §6: "authenticated session cookie
//! plus a CSRF-like header... bearer-token fallback permitted"). The exact
//! wire encoding of the vendor API is out of scope (spec §1) -- only the
//! logical operations matter, so this implementation issues a small,
//! uncontroversial REST shape and leaves protocol specifics to the
//! concrete deployment.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

use crate::backoff;
use crate::credentials::AuthProvider;
use crate::error::RemoteClientError;
use crate::model::{EntryId, RemoteEntry, WorkspaceId};

use super::{names_match_for_duplicate, sanitize_filename, RemoteClient, SpaceUsage};

const MAX_RETRIES: u32 = 5;
/// Individual operations are bound by a generous upper limit to accommodate
/// very large files (spec §5).
const OPERATION_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

pub struct HttpRemoteClient {
    http: Client,
    base_url: Url,
    auth: Arc<dyn AuthProvider>,
    large_file_threshold_bytes: u64,
}

impl HttpRemoteClient {
    pub fn new(base_url: Url, auth: Arc<dyn AuthProvider>, large_file_threshold_bytes: u64) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(OPERATION_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url,
            auth,
            large_file_threshold_bytes,
        })
    }

    async fn authed_request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, RemoteClientError> {
        let creds = self
            .auth
            .current_credentials()
            .await
            .map_err(RemoteClientError::Other)?;
        if !creds.is_authenticated() {
            return Err(RemoteClientError::SessionExpired);
        }
        let url = self
            .base_url
            .join(path)
            .map_err(|e| RemoteClientError::Other(e.into()))?;
        let mut builder = self.http.request(method, url);
        if let Some(cookie) = &creds.session_cookie {
            builder = builder.header(reqwest::header::COOKIE, cookie);
            if let Some(csrf) = &creds.csrf_header {
                builder = builder.header("X-CSRF-Token", csrf);
            }
        } else if let Some(token) = &creds.bearer_token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    /// Classifies an HTTP response status per the retryable/non-retryable
    /// split in spec §4.2.
    fn classify_status(status: StatusCode, is_large_body: bool) -> RemoteClientError {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return RemoteClientError::PayloadTooLarge;
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return RemoteClientError::SessionExpired;
        }
        if status == StatusCode::UNPROCESSABLE_ENTITY && is_large_body {
            return RemoteClientError::UnprocessableLargeBody;
        }
        if status.is_server_error() {
            return RemoteClientError::ServerError {
                status: status.as_u16(),
            };
        }
        if status == StatusCode::BAD_GATEWAY
            || status == StatusCode::GATEWAY_TIMEOUT
            || status == StatusCode::SERVICE_UNAVAILABLE
        {
            return RemoteClientError::GatewayError {
                status: status.as_u16(),
            };
        }
        RemoteClientError::Rejected {
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or("unknown").to_string(),
        }
    }

    fn classify_transport(err: &reqwest::Error) -> RemoteClientError {
        if err.is_timeout() {
            RemoteClientError::Timeout
        } else if err.is_connect() || err.is_request() {
            RemoteClientError::ConnectionReset
        } else {
            RemoteClientError::Other(anyhow::Error::new(err.without_url()))
        }
    }

    async fn with_retry<T, Op, Fut>(
        &self,
        description: &str,
        is_large_body: bool,
        cancel: &CancellationToken,
        op: Op,
    ) -> Result<T, RemoteClientError>
    where
        Op: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RemoteClientError>>,
    {
        let base = backoff::base_delay(is_large_body);
        backoff::retry(
            op,
            |e: &RemoteClientError| !e.retryable_by_policy(),
            MAX_RETRIES,
            base,
            description,
            cancel,
        )
        .await
        .ok_or_else(|| RemoteClientError::Other(anyhow::anyhow!("cancelled")))
        .and_then(|r| r)
    }
}

impl RemoteClientError {
    fn retryable_by_policy(&self) -> bool {
        use crate::error::Retryable;
        self.is_retryable()
    }
}

#[async_trait::async_trait]
impl RemoteClient for HttpRemoteClient {
    #[instrument(skip(self, cancel), fields(workspace))]
    async fn list_root(
        &self,
        workspace: WorkspaceId,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteEntry>, RemoteClientError> {
        if cancel.is_cancelled() {
            return Err(RemoteClientError::Other(anyhow::anyhow!("cancelled")));
        }
        self.with_retry("list_root", false, cancel, || async {
            let resp = self
                .authed_request(reqwest::Method::GET, "entries/root")
                .await?
                .query(&[("workspace_id", workspace)])
                .send()
                .await
                .map_err(|e| Self::classify_transport(&e))?;
            if !resp.status().is_success() {
                return Err(Self::classify_status(resp.status(), false));
            }
            resp.json::<Vec<RemoteEntry>>()
                .await
                .map_err(|e| RemoteClientError::Other(e.into()))
        })
        .await
    }

    #[instrument(skip(self, cancel), fields(workspace, folder_id))]
    async fn list_folder(
        &self,
        workspace: WorkspaceId,
        folder_id: EntryId,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteEntry>, RemoteClientError> {
        if cancel.is_cancelled() {
            return Err(RemoteClientError::Other(anyhow::anyhow!("cancelled")));
        }
        self.with_retry("list_folder", false, cancel, || async {
            let resp = self
                .authed_request(reqwest::Method::GET, &format!("entries/{folder_id}/children"))
                .await?
                .query(&[("workspace_id", workspace)])
                .send()
                .await
                .map_err(|e| Self::classify_transport(&e))?;
            if !resp.status().is_success() {
                return Err(Self::classify_status(resp.status(), false));
            }
            resp.json::<Vec<RemoteEntry>>()
                .await
                .map_err(|e| RemoteClientError::Other(e.into()))
        })
        .await
    }

    #[instrument(skip(self, cancel), fields(workspace, %local_path))]
    async fn upload(
        &self,
        workspace: WorkspaceId,
        local_path: &Utf8Path,
        parent_id: Option<EntryId>,
        cancel: &CancellationToken,
    ) -> Result<RemoteEntry, RemoteClientError> {
        if cancel.is_cancelled() {
            return Err(RemoteClientError::Other(anyhow::anyhow!("cancelled")));
        }
        let metadata = tokio::fs::metadata(local_path.as_std_path())
            .await
            .map_err(|e| RemoteClientError::Other(e.into()))?;
        let size = metadata.len();
        let file_name = local_path
            .file_name()
            .ok_or_else(|| RemoteClientError::Other(anyhow::anyhow!("path has no file name")))?;

        // Duplicate check (spec §4.2): list the target folder and short
        // circuit if a matching (name, size) entry already exists.
        let siblings = match parent_id {
            Some(parent) => self.list_folder(workspace, parent, cancel).await?,
            None => self.list_root(workspace, cancel).await?,
        };
        if let Some(existing) = siblings
            .iter()
            .find(|e| e.is_file() && e.size == size && names_match_for_duplicate(&e.name, file_name))
        {
            return Ok(existing.clone());
        }

        let is_large_body = size >= self.large_file_threshold_bytes;
        self.with_retry("upload", is_large_body, cancel, || async {
            let body = tokio::fs::read(local_path.as_std_path())
                .await
                .map_err(|e| RemoteClientError::Other(e.into()))?;
            let mut builder = self
                .authed_request(reqwest::Method::POST, "entries")
                .await?
                .query(&[("workspace_id", workspace)])
                .query(&[("name", file_name)]);
            if let Some(parent) = parent_id {
                builder = builder.query(&[("parent_id", parent)]);
            }
            let resp = builder
                .body(body)
                .send()
                .await
                .map_err(|e| Self::classify_transport(&e))?;
            if !resp.status().is_success() {
                return Err(Self::classify_status(resp.status(), is_large_body));
            }
            resp.json::<RemoteEntry>()
                .await
                .map_err(|e| RemoteClientError::Other(e.into()))
        })
        .await
    }

    #[instrument(skip(self, cancel, dest_dir), fields(workspace, entry_id = entry.id))]
    async fn download(
        &self,
        workspace: WorkspaceId,
        entry: &RemoteEntry,
        dest_dir: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, RemoteClientError> {
        if cancel.is_cancelled() {
            return Err(RemoteClientError::Other(anyhow::anyhow!("cancelled")));
        }
        let is_large_body = entry.size >= self.large_file_threshold_bytes;
        let dest_path = dest_dir.join(sanitize_filename(&entry.name));
        self.with_retry("download", is_large_body, cancel, || async {
            let resp = self
                .authed_request(reqwest::Method::GET, &format!("entries/{}/content", entry.id))
                .await?
                .query(&[("workspace_id", workspace)])
                .send()
                .await
                .map_err(|e| Self::classify_transport(&e))?;
            if !resp.status().is_success() {
                return Err(Self::classify_status(resp.status(), is_large_body));
            }
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| RemoteClientError::Other(e.into()))?;
            if let Some(parent) = dest_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RemoteClientError::Other(e.into()))?;
            }
            let mut file = tokio::fs::File::create(dest_path.as_std_path())
                .await
                .map_err(|e| RemoteClientError::Other(e.into()))?;
            file.write_all(&bytes)
                .await
                .map_err(|e| RemoteClientError::Other(e.into()))?;
            Ok(())
        })
        .await?;
        Ok(dest_path)
    }

    #[instrument(skip(self, cancel), fields(workspace, name))]
    async fn create_folder(
        &self,
        workspace: WorkspaceId,
        name: &str,
        parent_id: Option<EntryId>,
        cancel: &CancellationToken,
    ) -> Result<RemoteEntry, RemoteClientError> {
        if cancel.is_cancelled() {
            return Err(RemoteClientError::Other(anyhow::anyhow!("cancelled")));
        }
        let result = self
            .with_retry("create_folder", false, cancel, || async {
                let mut builder = self
                    .authed_request(reqwest::Method::POST, "folders")
                    .await?
                    .query(&[("workspace_id", workspace)])
                    .query(&[("name", name)]);
                if let Some(parent) = parent_id {
                    builder = builder.query(&[("parent_id", parent)]);
                }
                let resp = builder.send().await.map_err(|e| Self::classify_transport(&e))?;
                if resp.status() == StatusCode::CONFLICT {
                    return Err(RemoteClientError::Rejected {
                        status: 409,
                        message: "already exists".to_string(),
                    });
                }
                if !resp.status().is_success() {
                    return Err(Self::classify_status(resp.status(), false));
                }
                resp.json::<RemoteEntry>()
                    .await
                    .map_err(|e| RemoteClientError::Other(e.into()))
            })
            .await;

        match result {
            Err(RemoteClientError::Rejected { status: 409, .. }) => {
                // Idempotent semantics: re-list and adopt the existing folder.
                let siblings = match parent_id {
                    Some(parent) => self.list_folder(workspace, parent, cancel).await?,
                    None => self.list_root(workspace, cancel).await?,
                };
                siblings
                    .into_iter()
                    .find(|e| e.is_folder() && e.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| {
                        RemoteClientError::Other(anyhow::anyhow!(
                            "remote reported folder '{name}' already exists but it was not found on re-list"
                        ))
                    })
            }
            other => other,
        }
    }

    #[instrument(skip(self, cancel), fields(workspace, id))]
    async fn rename(
        &self,
        workspace: WorkspaceId,
        id: EntryId,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, RemoteClientError> {
        if cancel.is_cancelled() {
            return Err(RemoteClientError::Other(anyhow::anyhow!("cancelled")));
        }
        self.with_retry("rename", false, cancel, || async {
            let resp = self
                .authed_request(reqwest::Method::PATCH, &format!("entries/{id}"))
                .await?
                .query(&[("workspace_id", workspace)])
                .query(&[("name", new_name)])
                .send()
                .await
                .map_err(|e| Self::classify_transport(&e))?;
            if !resp.status().is_success() {
                return Err(Self::classify_status(resp.status(), false));
            }
            Ok(true)
        })
        .await
    }

    #[instrument(skip(self, cancel), fields(workspace, id))]
    async fn delete(
        &self,
        workspace: WorkspaceId,
        id: EntryId,
        cancel: &CancellationToken,
    ) -> Result<bool, RemoteClientError> {
        if cancel.is_cancelled() {
            return Err(RemoteClientError::Other(anyhow::anyhow!("cancelled")));
        }
        self.with_retry("delete", false, cancel, || async {
            let resp = self
                .authed_request(reqwest::Method::DELETE, &format!("entries/{id}"))
                .await?
                .query(&[("workspace_id", workspace)])
                .send()
                .await
                .map_err(|e| Self::classify_transport(&e))?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(false);
            }
            if !resp.status().is_success() {
                return Err(Self::classify_status(resp.status(), false));
            }
            Ok(true)
        })
        .await
    }

    #[instrument(skip(self, cancel), fields(workspace))]
    async fn space_usage(
        &self,
        workspace: WorkspaceId,
        cancel: &CancellationToken,
    ) -> Result<SpaceUsage, RemoteClientError> {
        if cancel.is_cancelled() {
            return Err(RemoteClientError::Other(anyhow::anyhow!("cancelled")));
        }
        self.with_retry("space_usage", false, cancel, || async {
            #[derive(serde::Deserialize)]
            struct Raw {
                used: u64,
                available: u64,
            }
            let resp = self
                .authed_request(reqwest::Method::GET, "workspace/usage")
                .await?
                .query(&[("workspace_id", workspace)])
                .send()
                .await
                .map_err(|e| Self::classify_transport(&e))?;
            if !resp.status().is_success() {
                return Err(Self::classify_status(resp.status(), false));
            }
            let raw: Raw = resp.json().await.map_err(|e| RemoteClientError::Other(e.into()))?;
            Ok(SpaceUsage {
                used: raw.used,
                available: raw.available,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_server_errors_as_retryable() {
        let err = HttpRemoteClient::classify_status(StatusCode::INTERNAL_SERVER_ERROR, false);
        assert!(err.retryable_by_policy());
    }

    #[test]
    fn classifies_payload_too_large_as_non_retryable() {
        let err = HttpRemoteClient::classify_status(StatusCode::PAYLOAD_TOO_LARGE, true);
        assert!(!err.retryable_by_policy());
        assert!(matches!(err, RemoteClientError::PayloadTooLarge));
    }

    #[test]
    fn classifies_large_body_422_as_retryable_overload() {
        let err = HttpRemoteClient::classify_status(StatusCode::UNPROCESSABLE_ENTITY, true);
        assert!(err.retryable_by_policy());
        assert!(matches!(err, RemoteClientError::UnprocessableLargeBody));
    }

    #[test]
    fn classifies_small_body_422_as_non_retryable() {
        let err = HttpRemoteClient::classify_status(StatusCode::UNPROCESSABLE_ENTITY, false);
        assert!(!err.retryable_by_policy());
    }

    #[test]
    fn classifies_unauthorized_as_session_expired() {
        let err = HttpRemoteClient::classify_status(StatusCode::UNAUTHORIZED, false);
        assert!(matches!(err, RemoteClientError::SessionExpired));
    }
}
