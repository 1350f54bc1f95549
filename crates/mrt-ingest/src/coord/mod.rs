//! Coordination client
//!
//! A thin async abstraction over a hierarchical coordination namespace:
//! nodes carry bytes and a version, children can be created sequentially
//! (the service appends a zero-padded counter), and ephemeral nodes live
//! only as long as the session that created them.
//!
//! Callers open a fresh [`Session`] per operation and close it when done.
//! Two backends are provided:
//!
//! - [`MemoryCoordination`]: in-process namespace (`memory://<name>`)
//! - [`FsCoordination`]: directory-backed namespace shared by processes on
//!   one host (`file:///var/mrt/coord`)

mod fs;
mod memory;

pub use fs::FsCoordination;
pub use memory::MemoryCoordination;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Width of the counter appended to sequential node names.
pub const SEQUENCE_WIDTH: usize = 10;

/// Result type alias for coordination operations
pub type CoordResult<T> = std::result::Result<T, CoordError>;

/// Coordination-service failures
#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Node not found: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Version conflict on {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid node path: {0}")]
    InvalidPath(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection lost: {0}")]
    ConnectionLoss(String),

    #[error("Unsupported coordination endpoint: {0}")]
    UnsupportedEndpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordError {
    /// Whether the caller should retry the whole operation on a new session
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordError::SessionExpired
                | CoordError::Timeout(_)
                | CoordError::ConnectionLoss(_)
                | CoordError::BadVersion { .. }
        )
    }
}

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the creating session closes or expires
    Ephemeral,
    /// Name gets a monotonically increasing, zero-padded suffix
    PersistentSequential,
}

/// Node payload together with its modification version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub data: Vec<u8>,
    pub version: u64,
}

/// One session against the coordination namespace.
#[async_trait]
pub trait Session: Send + Sync {
    /// Create a node; returns the actual path (differs for sequential nodes).
    /// The parent must exist.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String>;

    async fn get_data(&self, path: &str) -> CoordResult<NodeData>;

    /// Replace node data. With `Some(version)` the write only succeeds if
    /// the node is still at that version. Returns the new version.
    async fn set_data(&self, path: &str, data: &[u8], version: Option<u64>) -> CoordResult<u64>;

    /// Delete a childless node, optionally checking its version
    async fn delete(&self, path: &str, version: Option<u64>) -> CoordResult<()>;

    /// Child names (not full paths) of a node
    async fn children(&self, path: &str) -> CoordResult<Vec<String>>;

    async fn exists(&self, path: &str) -> CoordResult<bool>;

    /// End the session, removing its ephemeral nodes. Later calls fail with
    /// [`CoordError::SessionExpired`].
    async fn close(&self) -> CoordResult<()>;
}

/// Factory for sessions against one coordination endpoint.
#[async_trait]
pub trait Coordination: Send + Sync {
    async fn connect(&self) -> CoordResult<Box<dyn Session>>;

    /// Session timeout applied to every operation
    fn session_timeout(&self) -> Duration;
}

/// Build a coordination backend from an endpoint URL
pub fn connect_endpoint(endpoint: &str, session_timeout: Duration) -> CoordResult<Arc<dyn Coordination>> {
    let url = Url::parse(endpoint).map_err(|e| CoordError::UnsupportedEndpoint(format!("{}: {}", endpoint, e)))?;
    match url.scheme() {
        "memory" => Ok(Arc::new(MemoryCoordination::new(session_timeout))),
        "file" => {
            let root = url
                .to_file_path()
                .map_err(|_| CoordError::UnsupportedEndpoint(endpoint.to_string()))?;
            Ok(Arc::new(FsCoordination::new(root, session_timeout)))
        },
        other => Err(CoordError::UnsupportedEndpoint(format!(
            "scheme '{}' in {}",
            other, endpoint
        ))),
    }
}

/// Validate an absolute node path: `/` or `/a/b` with no empty or dot-led
/// components
pub fn validate_path(path: &str) -> CoordResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(CoordError::InvalidPath(path.to_string()));
    }
    for component in path[1..].split('/') {
        if component.is_empty() || component.starts_with('.') {
            return Err(CoordError::InvalidPath(path.to_string()));
        }
    }
    Ok(())
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of a node path; `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Create `path` and any missing ancestors as empty persistent nodes
pub async fn ensure_path(session: &dyn Session, path: &str) -> CoordResult<()> {
    validate_path(path)?;
    let mut current = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(component);
        match session.create(&current, &[], CreateMode::Persistent).await {
            Ok(_) | Err(CoordError::NodeExists(_)) => {},
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Sequence number encoded at the end of a sequential node name
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_WIDTH {
        return None;
    }
    let tail = &name[name.len() - SEQUENCE_WIDTH..];
    if tail.bytes().all(|b| b.is_ascii_digit()) {
        tail.parse().ok()
    } else {
        None
    }
}

pub(crate) fn sequential_name(prefix: &str, seq: u64) -> String {
    format!("{}{:0width$}", prefix, seq, width = SEQUENCE_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/ingest").is_ok());
        assert!(validate_path("/ingest/queue").is_ok());
        assert!(validate_path("ingest").is_err());
        assert!(validate_path("/ingest/").is_err());
        assert!(validate_path("/ingest//queue").is_err());
        assert!(validate_path("/ingest/.data").is_err());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
    }

    #[test]
    fn test_sequence_of() {
        assert_eq!(sequence_of("qn-05-0000000042"), Some(42));
        assert_eq!(sequence_of(&sequential_name("qn-", 7)), Some(7));
        assert_eq!(sequence_of("lock"), None);
        assert_eq!(sequence_of("qn-05-00000000x2"), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CoordError::SessionExpired.is_retryable());
        assert!(CoordError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!CoordError::InvalidPath("x".into()).is_retryable());
        assert!(!CoordError::NoNode("/x".into()).is_retryable());
    }

    #[test]
    fn test_connect_endpoint_schemes() {
        let timeout = Duration::from_secs(5);
        assert!(connect_endpoint("memory://test", timeout).is_ok());
        assert!(connect_endpoint("file:///tmp/mrt-coord", timeout).is_ok());
        assert!(matches!(
            connect_endpoint("zk://localhost:2181", timeout),
            Err(CoordError::UnsupportedEndpoint(_))
        ));
    }
}
