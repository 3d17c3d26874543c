//! Processing session: the scope that owns every temporary remote resource
//! created during one pipeline run.
//!
//! A [`Session`] is a registry. The [`BlobLifecycleManager`] registers a
//! [`TempResourceHandle`] on every successful upload and removes it on
//! release; teardown drains whatever is left. If a session is dropped while
//! still holding handles, the leak is logged at `warn` with the remote names
//! so they can be removed by hand.
//!
//! The registry uses interior mutability so that work running inside
//! [`BlobLifecycleManager::with_session`] can borrow `&Session` at the same
//! time as the manager does.
//!
//! [`BlobLifecycleManager`]: crate::pipeline::storage::BlobLifecycleManager
//! [`BlobLifecycleManager::with_session`]: crate::pipeline::storage::BlobLifecycleManager::with_session

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

/// Time-limited, read-only URL granting access to one remote object.
#[derive(Clone, Serialize)]
pub struct AccessDescriptor {
    /// Full URL including the signed query string.
    pub url: String,
    /// Instant after which the storage service rejects the URL.
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessDescriptor {
    // The query string carries a signature; keep it out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let base = self.url.split('?').next().unwrap_or_default();
        f.debug_struct("AccessDescriptor")
            .field("url", &format_args!("{base}?<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One uploaded temporary object.
///
/// Created only by the lifecycle manager; everything else reads it.
#[derive(Debug, Clone, Serialize)]
pub struct TempResourceHandle {
    pub id: Uuid,
    /// Object name inside the temporary container.
    pub remote_name: String,
    /// Object URL without any access grant.
    pub remote_location: String,
    pub access: AccessDescriptor,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl TempResourceHandle {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.access.expires_at
    }

    /// Whether the access descriptor is still valid at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.access.expires_at
    }
}

/// The unit of one pipeline run.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    started_at: DateTime<Utc>,
    handles: Mutex<Vec<TempResourceHandle>>,
    created: AtomicU32,
    released: AtomicU32,
    torn_down: AtomicBool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            handles: Mutex::new(Vec::new()),
            created: AtomicU32::new(0),
            released: AtomicU32::new(0),
            torn_down: AtomicBool::new(false),
        };
        debug!("Session {} opened", session.id);
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Handles still owned by the session (uploaded and not yet released).
    pub fn handles(&self) -> Vec<TempResourceHandle> {
        self.lock_handles().clone()
    }

    pub fn live_count(&self) -> usize {
        self.lock_handles().len()
    }

    /// Total handles ever registered, released ones included.
    pub fn created_count(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    /// Handles whose remote object was actually deleted.
    pub fn released_count(&self) -> u32 {
        self.released.load(Ordering::SeqCst)
    }

    /// Whether teardown has already run.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, handle: TempResourceHandle) {
        debug!("Session {}: registered {}", self.id, handle.remote_name);
        self.lock_handles().push(handle);
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove a handle from the registry. Returns it if it was still owned.
    pub(crate) fn forget(&self, id: Uuid) -> Option<TempResourceHandle> {
        let mut handles = self.lock_handles();
        let pos = handles.iter().position(|h| h.id == id)?;
        Some(handles.remove(pos))
    }

    pub(crate) fn mark_released(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    /// Take every remaining handle and mark the session torn down.
    ///
    /// The first call returns the handles; later calls return an empty list.
    pub(crate) fn drain(&self) -> Vec<TempResourceHandle> {
        self.torn_down.store(true, Ordering::SeqCst);
        std::mem::take(&mut *self.lock_handles())
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<TempResourceHandle>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let handles = self.handles.get_mut().unwrap_or_else(|e| e.into_inner());
        if !handles.is_empty() {
            let names: Vec<&str> = handles.iter().map(|h| h.remote_name.as_str()).collect();
            warn!(
                "Session {} dropped with {} unreleased temporary object(s): {}",
                self.id,
                names.len(),
                names.join(", ")
            );
        }
    }
}

#[cfg(test)]
pub(crate) fn test_handle(name: &str) -> TempResourceHandle {
    let now = Utc::now();
    TempResourceHandle {
        id: Uuid::new_v4(),
        remote_name: name.to_string(),
        remote_location: format!("https://example.invalid/c/{name}"),
        access: AccessDescriptor {
            url: format!("https://example.invalid/c/{name}?sig=x"),
            expires_at: now + chrono::Duration::hours(1),
        },
        created_at: now,
        size_bytes: 1,
    }
}
