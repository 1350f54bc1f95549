//! Directory-backed coordination namespace
//!
//! Each node is a directory under the root; its payload lives in `.data`,
//! its version in `.version`. Name claims use exclusive directory creation,
//! so two processes can never create the same node. Versioned writes are
//! serialized through a per-node `.lock` file.
//!
//! Ephemeral nodes are removed when their session closes. A process that
//! dies without closing leaves them behind until an operator removes them.

use async_trait::async_trait;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use super::{
    parent_path, sequence_of, sequential_name, validate_path, CoordError, CoordResult,
    Coordination, CreateMode, NodeData, Session,
};

const DATA_FILE: &str = ".data";
const VERSION_FILE: &str = ".version";
const OWNER_FILE: &str = ".owner";
const SEQ_FILE: &str = ".seq";
const LOCK_FILE: &str = ".lock";
const LOCK_RETRY: Duration = Duration::from_millis(5);
/// Lock files older than this are assumed to belong to a dead process
const STALE_LOCK_AGE: Duration = Duration::from_secs(60);

/// Coordination namespace stored in a local directory tree.
#[derive(Debug, Clone)]
pub struct FsCoordination {
    root: PathBuf,
    session_timeout: Duration,
}

impl FsCoordination {
    pub fn new(root: impl Into<PathBuf>, session_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            session_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Coordination for FsCoordination {
    async fn connect(&self) -> CoordResult<Box<dyn Session>> {
        let tree = Arc::new(FsTree {
            root: self.root.clone(),
            lock_wait: self.session_timeout,
        });
        let init = Arc::clone(&tree);
        run_blocking(self.session_timeout, move || init.init_root()).await?;

        Ok(Box::new(FsSession {
            id: uuid::Uuid::new_v4().to_string(),
            tree,
            timeout: self.session_timeout,
            ephemerals: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        }))
    }

    fn session_timeout(&self) -> Duration {
        self.session_timeout
    }
}

async fn run_blocking<T, F>(timeout: Duration, f: F) -> CoordResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CoordResult<T> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(CoordError::ConnectionLoss(join.to_string())),
        Err(_) => Err(CoordError::Timeout(timeout)),
    }
}

struct FsTree {
    root: PathBuf,
    lock_wait: Duration,
}

struct NodeLock(PathBuf);

impl Drop for NodeLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

fn write_atomic(dir: &Path, name: &str, contents: &[u8]) -> io::Result<()> {
    let tmp = dir.join(format!("{}.tmp-{}", name, uuid::Uuid::new_v4().simple()));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(name))
}

fn read_u64(path: &Path) -> io::Result<Option<u64>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl FsTree {
    fn dir(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn init_root(&self) -> CoordResult<()> {
        fs::create_dir_all(&self.root)?;
        if !self.root.join(DATA_FILE).exists() {
            write_atomic(&self.root, DATA_FILE, &[])?;
            write_atomic(&self.root, VERSION_FILE, b"0")?;
        }
        Ok(())
    }

    fn is_node(&self, path: &str) -> bool {
        self.dir(path).join(DATA_FILE).is_file()
    }

    fn lock(&self, path: &str) -> CoordResult<NodeLock> {
        let lock_path = self.dir(path).join(LOCK_FILE);
        let deadline = Instant::now() + self.lock_wait;
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(_) => return Ok(NodeLock(lock_path)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let stale = fs::metadata(&lock_path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| SystemTime::now().duration_since(t).ok())
                        .is_some_and(|age| age > STALE_LOCK_AGE);
                    if stale {
                        tracing::warn!(path = %path, "Removing stale node lock");
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(CoordError::Timeout(self.lock_wait));
                    }
                    std::thread::sleep(LOCK_RETRY);
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(CoordError::NoNode(path.to_string()));
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn child_names(&self, path: &str) -> CoordResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.dir(path))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && entry.file_type()?.is_dir() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn next_sequence(&self, parent: &str) -> CoordResult<u64> {
        let high_water = read_u64(&self.dir(parent).join(SEQ_FILE))?.unwrap_or(0);
        let existing = self
            .child_names(parent)?
            .iter()
            .filter_map(|n| sequence_of(n))
            .max()
            .map(|s| s + 1)
            .unwrap_or(0);
        Ok(high_water.max(existing))
    }

    fn create(&self, path: &str, data: &[u8], mode: CreateMode, owner: &str) -> CoordResult<String> {
        let parent = parent_path(path).ok_or_else(|| CoordError::NodeExists("/".to_string()))?;
        if !self.is_node(parent) {
            return Err(CoordError::NoNode(parent.to_string()));
        }
        if self.dir(parent).join(OWNER_FILE).exists() {
            return Err(CoordError::InvalidPath(format!(
                "{} is ephemeral and cannot have children",
                parent
            )));
        }

        let actual = match mode {
            CreateMode::PersistentSequential => {
                // allocation and the high-water update happen under the parent's lock
                let _parent_lock = self.lock(parent)?;
                let mut seq = self.next_sequence(parent)?;
                loop {
                    let candidate = sequential_name(path, seq);
                    match fs::create_dir(self.dir(&candidate)) {
                        Ok(()) => {
                            let seq_path = self.dir(parent).join(SEQ_FILE);
                            let high_water = read_u64(&seq_path)?.unwrap_or(0).max(seq + 1);
                            write_atomic(&self.dir(parent), SEQ_FILE, high_water.to_string().as_bytes())?;
                            break candidate;
                        },
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => seq += 1,
                        Err(e) => return Err(e.into()),
                    }
                }
            },
            _ => match fs::create_dir(self.dir(path)) {
                Ok(()) => path.to_string(),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(CoordError::NodeExists(path.to_string()));
                },
                Err(e) => return Err(e.into()),
            },
        };

        let dir = self.dir(&actual);
        if mode == CreateMode::Ephemeral {
            write_atomic(&dir, OWNER_FILE, owner.as_bytes())?;
        }
        write_atomic(&dir, VERSION_FILE, b"0")?;
        // .data last: the node is not visible to readers until it exists
        write_atomic(&dir, DATA_FILE, data)?;
        Ok(actual)
    }

    fn get_data(&self, path: &str) -> CoordResult<NodeData> {
        let dir = self.dir(path);
        let data = match fs::read(dir.join(DATA_FILE)) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoordError::NoNode(path.to_string()));
            },
            Err(e) => return Err(e.into()),
        };
        let version = read_u64(&dir.join(VERSION_FILE))?.unwrap_or(0);
        Ok(NodeData { data, version })
    }

    fn set_data(&self, path: &str, data: &[u8], version: Option<u64>) -> CoordResult<u64> {
        if !self.is_node(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        let _lock = self.lock(path)?;
        let dir = self.dir(path);
        let current = read_u64(&dir.join(VERSION_FILE))?.unwrap_or(0);
        if let Some(expected) = version {
            if expected != current {
                return Err(CoordError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: current,
                });
            }
        }
        write_atomic(&dir, DATA_FILE, data)?;
        write_atomic(&dir, VERSION_FILE, (current + 1).to_string().as_bytes())?;
        Ok(current + 1)
    }

    fn delete(&self, path: &str, version: Option<u64>) -> CoordResult<()> {
        if path == "/" {
            return Err(CoordError::InvalidPath(path.to_string()));
        }
        if !self.is_node(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        let _lock = self.lock(path)?;
        let dir = self.dir(path);
        if let Some(expected) = version {
            let current = read_u64(&dir.join(VERSION_FILE))?.unwrap_or(0);
            if expected != current {
                return Err(CoordError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: current,
                });
            }
        }
        if !self.child_names(path)?.is_empty() {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        // hide the node from readers before tearing the directory down
        fs::remove_file(dir.join(DATA_FILE))?;
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}

struct FsSession {
    id: String,
    tree: Arc<FsTree>,
    timeout: Duration,
    ephemerals: Arc<Mutex<Vec<String>>>,
    closed: AtomicBool,
}

impl FsSession {
    fn check_live(&self) -> CoordResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CoordError::SessionExpired)
        } else {
            Ok(())
        }
    }

    async fn run<T, F>(&self, f: F) -> CoordResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&FsTree) -> CoordResult<T> + Send + 'static,
    {
        self.check_live()?;
        let tree = Arc::clone(&self.tree);
        run_blocking(self.timeout, move || f(tree.as_ref())).await
    }
}

#[async_trait]
impl Session for FsSession {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        if mode == CreateMode::PersistentSequential {
            validate_path(&format!("{}0", path))?;
        } else {
            validate_path(path)?;
        }
        let (path_owned, data, owner) = (path.to_string(), data.to_vec(), self.id.clone());
        let actual = self
            .run(move |tree| tree.create(&path_owned, &data, mode, &owner))
            .await?;
        if mode == CreateMode::Ephemeral {
            if let Ok(mut list) = self.ephemerals.lock() {
                list.push(actual.clone());
            }
        }
        Ok(actual)
    }

    async fn get_data(&self, path: &str) -> CoordResult<NodeData> {
        validate_path(path)?;
        let path = path.to_string();
        self.run(move |tree| tree.get_data(&path)).await
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<u64>) -> CoordResult<u64> {
        validate_path(path)?;
        let (path, data) = (path.to_string(), data.to_vec());
        self.run(move |tree| tree.set_data(&path, &data, version)).await
    }

    async fn delete(&self, path: &str, version: Option<u64>) -> CoordResult<()> {
        validate_path(path)?;
        let path = path.to_string();
        self.run(move |tree| tree.delete(&path, version)).await
    }

    async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        validate_path(path)?;
        let path = path.to_string();
        self.run(move |tree| {
            if !tree.is_node(&path) {
                return Err(CoordError::NoNode(path));
            }
            tree.child_names(&path)
        })
        .await
    }

    async fn exists(&self, path: &str) -> CoordResult<bool> {
        validate_path(path)?;
        let path = path.to_string();
        self.run(move |tree| Ok(tree.is_node(&path))).await
    }

    async fn close(&self) -> CoordResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let owned: Vec<String> = match self.ephemerals.lock() {
            Ok(mut list) => std::mem::take(&mut *list),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if owned.is_empty() {
            return Ok(());
        }
        let tree = Arc::clone(&self.tree);
        run_blocking(self.timeout, move || {
            for path in owned {
                match tree.delete(&path, None) {
                    Ok(()) | Err(CoordError::NoNode(_)) => {},
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
        .await
    }
}
