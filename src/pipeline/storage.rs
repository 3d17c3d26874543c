//! Blob lifecycle: upload a local scan to temporary remote storage, grant the
//! OCR service time-limited read access, and delete everything afterwards.
//!
//! ## Guarantees
//!
//! * Size is checked from file metadata before any network call; an
//!   oversized file never creates a handle.
//! * Remote names are `YYYYmmdd_HHMMSS_<8 hex>_<sanitised name>`, so two
//!   sessions uploading the same file in the same second still get distinct
//!   objects.
//! * Access descriptors are read-only and blob-scoped, and the expiry is
//!   signed into the descriptor so the storage service enforces it.
//! * [`BlobLifecycleManager::release`] and [`BlobLifecycleManager::release_all`]
//!   never return an error: a failed delete is logged and the pipeline
//!   carries on.
//! * [`BlobLifecycleManager::with_session`] runs `release_all` after the work
//!   future completes, whichever way it completes.

use crate::config::StorageConfig;
use crate::error::ScanError;
use crate::session::{AccessDescriptor, Session, TempResourceHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Remote object storage, as seen by the lifecycle manager.
///
/// Implemented by [`crate::pipeline::azure_blob::AzureBlobStore`] and by
/// in-process fakes in tests.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Create `container` if it does not already exist.
    async fn ensure_container(&self, container: &str) -> Result<(), ScanError>;

    /// Store `bytes` as `container/name`, overwriting. Returns the object URL
    /// (without any access grant).
    async fn upload(&self, container: &str, name: &str, bytes: Vec<u8>)
        -> Result<String, ScanError>;

    /// A read-only URL for `container/name` that the service rejects after
    /// `expires_at`.
    fn access_descriptor(
        &self,
        container: &str,
        name: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, ScanError>;

    /// Delete `container/name`. Deleting an object that is already gone is
    /// not an error.
    async fn delete(&self, container: &str, name: &str) -> Result<(), ScanError>;
}

/// What teardown did with the session's remaining handles.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReleaseSummary {
    pub released: usize,
    pub failed: usize,
    /// Kept on purpose (`cleanup_on_failure = false` on a failed run).
    pub retained: usize,
}

/// Owns every interaction with temporary remote storage for a run.
pub struct BlobLifecycleManager {
    store: Arc<dyn BlobStore>,
    config: StorageConfig,
    container_ready: OnceCell<()>,
}

impl BlobLifecycleManager {
    pub fn new(store: Arc<dyn BlobStore>, config: StorageConfig) -> Self {
        Self {
            store,
            config,
            container_ready: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Upload a local file and register the resulting handle with `session`.
    ///
    /// # Errors
    /// * [`ScanError::FileNotFound`] / [`ScanError::PermissionDenied`] when the
    ///   file cannot be read.
    /// * [`ScanError::FileTooLarge`] before any network call when the file
    ///   exceeds `max_file_size_bytes`.
    /// * [`ScanError::Storage`] when the container or upload call still fails
    ///   after `upload_retries` retries.
    pub async fn upload(
        &self,
        path: &Path,
        session: &Session,
    ) -> Result<TempResourceHandle, ScanError> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| io_to_input(path, e))?;
        let size_bytes = meta.len();
        if size_bytes > self.config.max_file_size_bytes {
            return Err(ScanError::FileTooLarge {
                path: path.to_path_buf(),
                size_bytes,
                limit_bytes: self.config.max_file_size_bytes,
            });
        }

        let bytes = tokio::fs::read(path).await.map_err(|e| io_to_input(path, e))?;
        let original = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        let remote_name = unique_blob_name(&original, Utc::now());

        self.ensure_container().await?;

        info!(
            "Uploading {} ({:.1} MB) to {} as {}",
            original,
            size_bytes as f64 / (1024.0 * 1024.0),
            self.store.name(),
            remote_name
        );
        let container = self.config.container_name.as_str();
        let remote_location = self
            .with_retries("upload", || self.store.upload(container, &remote_name, bytes.clone()))
            .await?;

        let created_at = Utc::now();
        let expires_at = created_at + ttl_to_chrono(self.config.access_ttl);
        let url = match self.store.access_descriptor(container, &remote_name, expires_at) {
            Ok(url) => url,
            Err(e) => {
                // The object exists but nothing will ever reference it.
                self.delete_logged(&remote_name).await;
                return Err(e);
            }
        };

        let handle = TempResourceHandle {
            id: Uuid::new_v4(),
            remote_name,
            remote_location,
            access: AccessDescriptor { url, expires_at },
            created_at,
            size_bytes,
        };
        session.register(handle.clone());
        Ok(handle)
    }

    /// Issue a fresh read-only descriptor for an existing handle.
    pub fn issue_access(
        &self,
        handle: &TempResourceHandle,
        ttl: Duration,
    ) -> Result<AccessDescriptor, ScanError> {
        if ttl.is_zero() {
            return Err(ScanError::AccessDescriptor {
                name: handle.remote_name.clone(),
                detail: "TTL must be greater than zero".into(),
            });
        }
        let expires_at = Utc::now() + ttl_to_chrono(ttl);
        let url = self.store.access_descriptor(
            &self.config.container_name,
            &handle.remote_name,
            expires_at,
        )?;
        Ok(AccessDescriptor { url, expires_at })
    }

    /// Delete one handle's remote object and remove it from `session`.
    ///
    /// Returns `true` if the object was deleted. A handle the session no
    /// longer owns is a no-op. Failures are logged, never raised.
    pub async fn release(&self, session: &Session, handle: &TempResourceHandle) -> bool {
        match session.forget(handle.id) {
            Some(owned) => {
                let deleted = self.delete_logged(&owned.remote_name).await;
                if deleted {
                    session.mark_released();
                }
                deleted
            }
            None => {
                debug!("{} already released", handle.remote_name);
                false
            }
        }
    }

    /// Delete every handle the session still owns.
    ///
    /// Idempotent: a second call, or a call on a session with no handles,
    /// deletes nothing.
    pub async fn release_all(&self, session: &Session) -> ReleaseSummary {
        let handles = session.drain();
        let mut summary = ReleaseSummary::default();
        for handle in &handles {
            if self.delete_logged(&handle.remote_name).await {
                session.mark_released();
                summary.released += 1;
            } else {
                summary.failed += 1;
            }
        }
        if !handles.is_empty() {
            debug!(
                "Session {} teardown: {} released, {} failed",
                session.id(),
                summary.released,
                summary.failed
            );
        }
        summary
    }

    /// Run `work`, then tear the session down, then return `work`'s result.
    ///
    /// Teardown runs on success and on every error path. With
    /// `cleanup_on_failure = false`, a failed run keeps its uploads and logs
    /// their names instead of deleting them.
    pub async fn with_session<T, F>(&self, session: &Session, work: F) -> Result<T, ScanError>
    where
        F: Future<Output = Result<T, ScanError>>,
    {
        let result = work.await;
        let summary = if result.is_err() && !self.config.cleanup_on_failure {
            self.retain_all(session)
        } else {
            self.release_all(session).await
        };
        if summary.failed > 0 {
            warn!(
                "{} temporary object(s) could not be deleted from '{}'",
                summary.failed, self.config.container_name
            );
        }
        result
    }

    fn retain_all(&self, session: &Session) -> ReleaseSummary {
        let handles = session.drain();
        for h in &handles {
            warn!(
                "Run failed; keeping temporary object {}/{} (cleanup_on_failure = false)",
                self.config.container_name, h.remote_name
            );
        }
        ReleaseSummary {
            retained: handles.len(),
            ..Default::default()
        }
    }

    async fn ensure_container(&self) -> Result<(), ScanError> {
        self.container_ready
            .get_or_try_init(|| async {
                self.with_retries("create container", || {
                    self.store.ensure_container(&self.config.container_name)
                })
                .await
            })
            .await
            .map(|_| ())
    }

    async fn delete_logged(&self, name: &str) -> bool {
        match self.store.delete(&self.config.container_name, name).await {
            Ok(()) => {
                if self.config.log_cleanup {
                    info!("Deleted temporary object {}/{}", self.config.container_name, name);
                } else {
                    debug!("Deleted temporary object {}/{}", self.config.container_name, name);
                }
                true
            }
            Err(e) => {
                warn!(
                    "Failed to delete temporary object {}/{}: {}",
                    self.config.container_name, name, e
                );
                false
            }
        }
    }

    /// Retry `op` on transient errors with exponential backoff
    /// (`retry_backoff_ms * 2^attempt`).
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ScanError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScanError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.config.upload_retries => {
                    let backoff = self.config.retry_backoff_ms.saturating_mul(1 << attempt.min(16));
                    attempt += 1;
                    warn!(
                        "Storage {}: retry {}/{} after {}ms ({})",
                        what, attempt, self.config.upload_retries, backoff, e
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `YYYYmmdd_HHMMSS_<8 hex>_<name>` with the name reduced to `[A-Za-z0-9._-]`.
pub fn unique_blob_name(original: &str, now: DateTime<Utc>) -> String {
    let mut safe: String = original
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if safe.is_empty() || safe.chars().all(|c| c == '.') {
        safe = "upload.bin".to_string();
    }
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", now.format("%Y%m%d_%H%M%S"), &uuid[..8], safe)
}

pub(crate) fn ttl_to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1))
}

fn io_to_input(path: &Path, e: std::io::Error) -> ScanError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => ScanError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => ScanError::FileNotFound {
            path: path.to_path_buf(),
        },
    }
}
