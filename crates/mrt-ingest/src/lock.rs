//! Freeze flags and named mutexes
//!
//! All state lives in the coordination namespace under one root
//! (default `/ingest.lock`):
//!
//! ```text
//! /ingest.lock/freeze              global ingest freeze
//! /ingest.lock/collections/<name>  per-collection freeze
//! /ingest.lock/locks/<name>        ephemeral mutex node
//! ```
//!
//! Flags are boolean by presence. Freezing the global queue is enforced by
//! the submission path; collection freezes are advisory and only surfaced
//! to operators.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::coord::{ensure_path, join_path, validate_path, CoordError, Coordination, CreateMode, Session};
use mrt_common::logging::AUDIT_TARGET;

pub const DEFAULT_LOCK_ROOT: &str = "/ingest.lock";

const FREEZE_NODE: &str = "freeze";
const COLLECTIONS_NODE: &str = "collections";
const LOCKS_NODE: &str = "locks";
const ACQUIRE_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Coordination error: {0}")]
    Coord(#[from] CoordError),

    #[error("Invalid lock or collection name: {0:?}")]
    InvalidName(String),

    #[error("Timed out after {waited:?} waiting for lock {name}")]
    AcquireTimeout { name: String, waited: Duration },
}

impl LockError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LockError::Coord(e) => e.is_retryable(),
            LockError::AcquireTimeout { .. } => true,
            LockError::InvalidName(_) => false,
        }
    }
}

pub type LockResult<T> = std::result::Result<T, LockError>;

fn validate_name(name: &str) -> LockResult<()> {
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
        return Err(LockError::InvalidName(name.to_string()));
    }
    Ok(())
}

async fn close_quietly(session: Box<dyn Session>) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close coordination session");
    }
}

/// Freeze flags and named mutexes under one coordination root
#[derive(Clone)]
pub struct LockRegistry {
    coord: Arc<dyn Coordination>,
    root: String,
}

impl LockRegistry {
    pub fn new(coord: Arc<dyn Coordination>, root: impl Into<String>) -> LockResult<Self> {
        let root = root.into();
        validate_path(&root)?;
        Ok(Self { coord, root })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn freeze_path(&self) -> String {
        join_path(&self.root, FREEZE_NODE)
    }

    fn collections_path(&self) -> String {
        join_path(&self.root, COLLECTIONS_NODE)
    }

    async fn set_flag(&self, path: &str) -> LockResult<bool> {
        let session = self.coord.connect().await?;
        let result: LockResult<bool> = async {
            if let Some(parent) = crate::coord::parent_path(path) {
                ensure_path(session.as_ref(), parent).await?;
            }
            match session.create(path, &[], CreateMode::Persistent).await {
                Ok(_) => Ok(true),
                Err(CoordError::NodeExists(_)) => Ok(false),
                Err(e) => Err(LockError::from(e)),
            }
        }
        .await;
        close_quietly(session).await;
        result
    }

    async fn clear_flag(&self, path: &str) -> LockResult<bool> {
        let session = self.coord.connect().await?;
        let result = match session.delete(path, None).await {
            Ok(()) => Ok(true),
            Err(CoordError::NoNode(_)) => Ok(false),
            Err(e) => Err(LockError::from(e)),
        };
        close_quietly(session).await;
        result
    }

    async fn flag_set(&self, path: &str) -> LockResult<bool> {
        let session = self.coord.connect().await?;
        let result = session.exists(path).await.map_err(LockError::from);
        close_quietly(session).await;
        result
    }

    /// Freeze the global ingest queue. Returns false if it was already
    /// frozen.
    pub async fn freeze(&self) -> LockResult<bool> {
        let changed = self.set_flag(&self.freeze_path()).await?;
        info!(target: AUDIT_TARGET, root = %self.root, changed, "Ingest queue frozen");
        Ok(changed)
    }

    /// Thaw the global ingest queue. Returns false if it was not frozen.
    pub async fn thaw(&self) -> LockResult<bool> {
        let changed = self.clear_flag(&self.freeze_path()).await?;
        info!(target: AUDIT_TARGET, root = %self.root, changed, "Ingest queue thawed");
        Ok(changed)
    }

    pub async fn is_frozen(&self) -> LockResult<bool> {
        self.flag_set(&self.freeze_path()).await
    }

    pub async fn freeze_collection(&self, collection: &str) -> LockResult<bool> {
        validate_name(collection)?;
        let changed = self.set_flag(&join_path(&self.collections_path(), collection)).await?;
        info!(target: AUDIT_TARGET, collection, changed, "Collection frozen");
        Ok(changed)
    }

    pub async fn thaw_collection(&self, collection: &str) -> LockResult<bool> {
        validate_name(collection)?;
        let changed = self.clear_flag(&join_path(&self.collections_path(), collection)).await?;
        info!(target: AUDIT_TARGET, collection, changed, "Collection thawed");
        Ok(changed)
    }

    pub async fn is_collection_frozen(&self, collection: &str) -> LockResult<bool> {
        validate_name(collection)?;
        self.flag_set(&join_path(&self.collections_path(), collection)).await
    }

    /// Names of all currently frozen collections, sorted
    pub async fn frozen_collections(&self) -> LockResult<Vec<String>> {
        let session = self.coord.connect().await?;
        let result = match session.children(&self.collections_path()).await {
            Ok(mut names) => {
                names.sort();
                Ok(names)
            },
            Err(CoordError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(LockError::from(e)),
        };
        close_quietly(session).await;
        result
    }

    /// Try once to take the named mutex. `None` if another session holds it.
    pub async fn try_acquire(&self, name: &str) -> LockResult<Option<LockHandle>> {
        validate_name(name)?;
        let path = join_path(&join_path(&self.root, LOCKS_NODE), name);
        let session = self.coord.connect().await?;

        let created = async {
            ensure_path(session.as_ref(), &join_path(&self.root, LOCKS_NODE)).await?;
            session.create(&path, &[], CreateMode::Ephemeral).await
        }
        .await;

        match created {
            Ok(_) => {
                debug!(lock = %path, "Lock acquired");
                Ok(Some(LockHandle {
                    session: Some(session),
                    path,
                }))
            },
            Err(CoordError::NodeExists(_)) => {
                close_quietly(session).await;
                Ok(None)
            },
            Err(e) => {
                close_quietly(session).await;
                Err(e.into())
            },
        }
    }

    /// Take the named mutex, polling until `wait` elapses
    pub async fn acquire(&self, name: &str, wait: Duration) -> LockResult<LockHandle> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(handle) = self.try_acquire(name).await? {
                return Ok(handle);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::AcquireTimeout {
                    name: name.to_string(),
                    waited: wait,
                });
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }
}

/// A held named mutex. The lock node is ephemeral and owned by this
/// handle's session, so it disappears with the session.
pub struct LockHandle {
    session: Option<Box<dyn Session>>,
    path: String,
}

impl LockHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Release the lock and end its session
    pub async fn release(mut self) -> LockResult<()> {
        if let Some(session) = self.session.take() {
            let deleted = session.delete(&self.path, None).await;
            close_quietly(session).await;
            match deleted {
                Ok(()) | Err(CoordError::NoNode(_)) => {},
                Err(e) => return Err(e.into()),
            }
            debug!(lock = %self.path, "Lock released");
        }
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(close_quietly(session));
                },
                Err(_) => warn!(lock = %self.path, "Lock dropped outside a runtime; held until session expiry"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordination;

    fn registry() -> LockRegistry {
        LockRegistry::new(Arc::new(MemoryCoordination::default()), DEFAULT_LOCK_ROOT).unwrap()
    }

    #[tokio::test]
    async fn test_global_freeze_thaw() {
        let locks = registry();
        assert!(!locks.is_frozen().await.unwrap());

        assert!(locks.freeze().await.unwrap());
        assert!(!locks.freeze().await.unwrap());
        assert!(locks.is_frozen().await.unwrap());

        assert!(locks.thaw().await.unwrap());
        assert!(!locks.thaw().await.unwrap());
        assert!(!locks.is_frozen().await.unwrap());
    }

    #[tokio::test]
    async fn test_collection_freeze_is_independent() {
        let locks = registry();
        locks.freeze_collection("ark_demo").await.unwrap();
        locks.freeze_collection("cdl_dsc").await.unwrap();

        assert!(locks.is_collection_frozen("ark_demo").await.unwrap());
        assert!(!locks.is_frozen().await.unwrap());
        assert_eq!(locks.frozen_collections().await.unwrap(), vec!["ark_demo", "cdl_dsc"]);

        locks.thaw_collection("ark_demo").await.unwrap();
        assert_eq!(locks.frozen_collections().await.unwrap(), vec!["cdl_dsc"]);
    }

    #[tokio::test]
    async fn test_no_collections_lists_empty() {
        assert!(registry().frozen_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_collection_name() {
        let locks = registry();
        assert!(matches!(locks.freeze_collection("a/b").await, Err(LockError::InvalidName(_))));
        assert!(matches!(locks.is_collection_frozen("").await, Err(LockError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_mutex_exclusive_until_released() {
        let locks = registry();
        let held = locks.try_acquire("batch-bid-001").await.unwrap().unwrap();
        assert!(locks.try_acquire("batch-bid-001").await.unwrap().is_none());
        assert!(locks.try_acquire("batch-bid-002").await.unwrap().is_some());

        held.release().await.unwrap();
        assert!(locks.try_acquire("batch-bid-001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let locks = registry();
        let _held = locks.try_acquire("busy").await.unwrap().unwrap();
        let err = locks.acquire("busy", Duration::from_millis(120)).await.err().unwrap();
        assert!(matches!(err, LockError::AcquireTimeout { .. }));
        assert!(err.is_retryable());
    }
}
