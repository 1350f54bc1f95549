//! In-process coordination namespace

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    parent_path, sequential_name, validate_path, CoordError, CoordResult, Coordination,
    CreateMode, NodeData, Session,
};

#[derive(Debug, Default)]
struct MemNode {
    data: Vec<u8>,
    version: u64,
    owner: Option<u64>,
    next_seq: u64,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, MemNode>,
    expired: HashSet<u64>,
}

impl Tree {
    fn children_of<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter_map(move |(k, _)| {
                let rest = &k[if path == "/" { 1 } else { path.len() + 1 }..];
                (!rest.is_empty() && !rest.contains('/')).then_some(rest)
            })
    }

    fn remove_owned_by(&mut self, session: u64) -> usize {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for path in &owned {
            self.nodes.remove(path);
        }
        owned.len()
    }
}

/// Coordination namespace held in process memory.
///
/// Cloning shares the namespace, so every clone sees the same nodes. Used
/// by tests and single-process deployments.
#[derive(Clone)]
pub struct MemoryCoordination {
    tree: Arc<Mutex<Tree>>,
    next_session: Arc<AtomicU64>,
    session_timeout: Duration,
}

impl MemoryCoordination {
    pub fn new(session_timeout: Duration) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), MemNode::default());
        Self {
            tree: Arc::new(Mutex::new(Tree {
                nodes,
                expired: HashSet::new(),
            })),
            next_session: Arc::new(AtomicU64::new(1)),
            session_timeout,
        }
    }

    /// Expire every open session, as the service does after a network
    /// partition outlasts the session timeout
    pub async fn expire_all_sessions(&self) {
        let mut tree = self.tree.lock().await;
        let last = self.next_session.load(Ordering::SeqCst);
        for id in 1..last {
            tree.expired.insert(id);
            tree.remove_owned_by(id);
        }
    }
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Coordination for MemoryCoordination {
    async fn connect(&self) -> CoordResult<Box<dyn Session>> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            id,
            tree: Arc::clone(&self.tree),
            closed: AtomicBool::new(false),
        }))
    }

    fn session_timeout(&self) -> Duration {
        self.session_timeout
    }
}

struct MemorySession {
    id: u64,
    tree: Arc<Mutex<Tree>>,
    closed: AtomicBool,
}

impl MemorySession {
    fn check_live(&self, tree: &Tree) -> CoordResult<()> {
        if self.closed.load(Ordering::SeqCst) || tree.expired.contains(&self.id) {
            return Err(CoordError::SessionExpired);
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        let mut tree = self.tree.lock().await;
        self.check_live(&tree)?;
        if mode == CreateMode::PersistentSequential {
            // the prefix itself need not be a valid final path ("qn-05-")
            validate_path(&format!("{}0", path))?;
        } else {
            validate_path(path)?;
        }
        let parent = parent_path(path).ok_or_else(|| CoordError::NodeExists("/".to_string()))?;

        let actual = {
            let parent_node = tree
                .nodes
                .get_mut(parent)
                .ok_or_else(|| CoordError::NoNode(parent.to_string()))?;
            if parent_node.owner.is_some() {
                return Err(CoordError::InvalidPath(format!(
                    "{} is ephemeral and cannot have children",
                    parent
                )));
            }
            match mode {
                CreateMode::PersistentSequential => {
                    let seq = parent_node.next_seq;
                    parent_node.next_seq += 1;
                    sequential_name(path, seq)
                },
                _ => path.to_string(),
            }
        };

        if tree.nodes.contains_key(&actual) {
            return Err(CoordError::NodeExists(actual));
        }
        tree.nodes.insert(
            actual.clone(),
            MemNode {
                data: data.to_vec(),
                version: 0,
                owner: (mode == CreateMode::Ephemeral).then_some(self.id),
                next_seq: 0,
            },
        );
        Ok(actual)
    }

    async fn get_data(&self, path: &str) -> CoordResult<NodeData> {
        let tree = self.tree.lock().await;
        self.check_live(&tree)?;
        validate_path(path)?;
        tree.nodes
            .get(path)
            .map(|n| NodeData {
                data: n.data.clone(),
                version: n.version,
            })
            .ok_or_else(|| CoordError::NoNode(path.to_string()))
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<u64>) -> CoordResult<u64> {
        let mut tree = self.tree.lock().await;
        self.check_live(&tree)?;
        validate_path(path)?;
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if node.version != expected {
                return Err(CoordError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = data.to_vec();
        node.version += 1;
        Ok(node.version)
    }

    async fn delete(&self, path: &str, version: Option<u64>) -> CoordResult<()> {
        let mut tree = self.tree.lock().await;
        self.check_live(&tree)?;
        validate_path(path)?;
        if path == "/" {
            return Err(CoordError::InvalidPath(path.to_string()));
        }
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if node.version != expected {
                return Err(CoordError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        if tree.children_of(path).next().is_some() {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        tree.nodes.remove(path);
        Ok(())
    }

    async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        let tree = self.tree.lock().await;
        self.check_live(&tree)?;
        validate_path(path)?;
        if !tree.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        Ok(tree.children_of(path).map(str::to_string).collect())
    }

    async fn exists(&self, path: &str) -> CoordResult<bool> {
        let tree = self.tree.lock().await;
        self.check_live(&tree)?;
        validate_path(path)?;
        Ok(tree.nodes.contains_key(path))
    }

    async fn close(&self) -> CoordResult<()> {
        let mut tree = self.tree.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let removed = tree.remove_owned_by(self.id);
        if removed > 0 {
            tracing::debug!(session = self.id, removed, "Removed ephemeral nodes on close");
        }
        Ok(())
    }
}
