//! Distributed ingest queue
//!
//! Items are sequential children of the queue node, named
//! `qn-<priority:02>-<sequence:010>`. Listing orders by priority (lower
//! value first) and then by the sequence number the coordination service
//! assigned at enqueue time; wall-clock submission time plays no part.
//!
//! Node data is a two-byte header followed by the opaque payload:
//!
//! ```text
//! [status][prior status | 0xFF][payload ...]
//! ```
//!
//! Every state change is a versioned write, so two consumers racing for the
//! same item cannot both claim it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::coord::{
    ensure_path, join_path, sequence_of, validate_path, CoordError, Coordination, CreateMode,
    Session,
};
use mrt_common::logging::AUDIT_TARGET;

/// Priority used when a submission does not name one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Largest accepted priority value (lowest urgency).
pub const MAX_PRIORITY: u8 = 99;

const ITEM_PREFIX: &str = "qn-";
const NO_PRIOR: u8 = 0xFF;

/// Lifecycle status of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Consumed,
    Completed,
    Failed,
    Deleted,
    Held,
}

impl ItemStatus {
    fn code(self) -> u8 {
        match self {
            ItemStatus::Pending => 0,
            ItemStatus::Consumed => 1,
            ItemStatus::Completed => 2,
            ItemStatus::Deleted => 3,
            ItemStatus::Failed => 4,
            ItemStatus::Held => 5,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ItemStatus::Pending),
            1 => Some(ItemStatus::Consumed),
            2 => Some(ItemStatus::Completed),
            3 => Some(ItemStatus::Deleted),
            4 => Some(ItemStatus::Failed),
            5 => Some(ItemStatus::Held),
            _ => None,
        }
    }

    /// Statuses `cleanup` may bulk-remove
    pub fn is_cleanable(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Consumed => "consumed",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Deleted => "deleted",
            ItemStatus::Held => "held",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ItemStatus::Pending),
            "consumed" => Ok(ItemStatus::Consumed),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            "deleted" => Ok(ItemStatus::Deleted),
            "held" => Ok(ItemStatus::Held),
            other => Err(QueueError::UnknownStatus(other.to_string())),
        }
    }
}

/// Queue failures
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Coordination error: {0}")]
    Coord(#[from] CoordError),

    #[error("Queue item not found: {0}")]
    ItemNotFound(String),

    #[error("Item {item} is {actual}, operation requires {expected}")]
    InvalidTransition {
        item: String,
        expected: ItemStatus,
        actual: ItemStatus,
    },

    #[error("Status {0} cannot be cleaned up; only completed or deleted items can")]
    NotCleanable(ItemStatus),

    #[error("Priority {0} is out of range 0..={max}", max = MAX_PRIORITY)]
    InvalidPriority(u8),

    #[error("Corrupt queue item {item}: {reason}")]
    Corrupt { item: String, reason: String },

    #[error("Unknown item status: {0}")]
    UnknownStatus(String),
}

impl QueueError {
    /// Whether the caller should retry the operation
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Coord(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// One item as stored in the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Node name, e.g. `qn-05-0000000012`
    pub id: String,
    pub priority: u8,
    pub sequence: u64,
    pub status: ItemStatus,
    /// Status before the most recent transition
    pub prior_status: Option<ItemStatus>,
    pub payload: Vec<u8>,
    version: u64,
}

impl QueueItem {
    fn decode(id: &str, data: &[u8], version: u64) -> QueueResult<Self> {
        let (priority, sequence) = parse_item_name(id).ok_or_else(|| QueueError::Corrupt {
            item: id.to_string(),
            reason: "malformed item name".to_string(),
        })?;
        if data.len() < 2 {
            return Err(QueueError::Corrupt {
                item: id.to_string(),
                reason: format!("header too short ({} bytes)", data.len()),
            });
        }
        let status = ItemStatus::from_code(data[0]).ok_or_else(|| QueueError::Corrupt {
            item: id.to_string(),
            reason: format!("unknown status code {}", data[0]),
        })?;
        let prior_status = match data[1] {
            NO_PRIOR => None,
            code => Some(ItemStatus::from_code(code).ok_or_else(|| QueueError::Corrupt {
                item: id.to_string(),
                reason: format!("unknown prior status code {}", code),
            })?),
        };
        Ok(Self {
            id: id.to_string(),
            priority,
            sequence,
            status,
            prior_status,
            payload: data[2..].to_vec(),
            version,
        })
    }
}

fn encode(status: ItemStatus, prior: Option<ItemStatus>, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(payload.len() + 2);
    data.push(status.code());
    data.push(prior.map(ItemStatus::code).unwrap_or(NO_PRIOR));
    data.extend_from_slice(payload);
    data
}

/// Parse `qn-PP-SSSSSSSSSS` into (priority, sequence)
pub fn parse_item_name(name: &str) -> Option<(u8, u64)> {
    let rest = name.strip_prefix(ITEM_PREFIX)?;
    let (priority, seq_part) = rest.split_once('-')?;
    let priority = priority.parse().ok()?;
    let sequence = sequence_of(seq_part)?;
    (seq_part.len() == crate::coord::SEQUENCE_WIDTH).then_some((priority, sequence))
}

/// Audit record returned by the delete operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionRecord {
    pub queue: String,
    pub item_id: String,
    /// State the item was in when the deletion was authorized
    pub prior_status: ItemStatus,
}

/// Item counts per status
pub type QueueSummary = BTreeMap<ItemStatus, usize>;

/// Queue of ingest work items under one coordination path
#[derive(Clone)]
pub struct DistributedQueue {
    coord: Arc<dyn Coordination>,
    path: String,
}

async fn close_quietly(session: Box<dyn Session>) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close coordination session");
    }
}

impl DistributedQueue {
    pub fn new(coord: Arc<dyn Coordination>, path: impl Into<String>) -> QueueResult<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self { coord, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Add a payload; returns the new item ID
    #[instrument(skip(self, payload), fields(queue = %self.path, bytes = payload.len()))]
    pub async fn enqueue(&self, payload: &[u8], priority: u8) -> QueueResult<String> {
        if priority > MAX_PRIORITY {
            return Err(QueueError::InvalidPriority(priority));
        }
        let session = self.coord.connect().await?;
        let result = async {
            ensure_path(session.as_ref(), &self.path).await?;
            let prefix = join_path(&self.path, &format!("{}{:02}-", ITEM_PREFIX, priority));
            let created = session
                .create(&prefix, &encode(ItemStatus::Pending, None, payload), CreateMode::PersistentSequential)
                .await?;
            Ok::<_, QueueError>(created.rsplit('/').next().unwrap_or(&created).to_string())
        }
        .await;
        close_quietly(session).await;

        if let Ok(ref id) = result {
            info!(item_id = %id, priority, "Enqueued item");
        }
        result
    }

    /// All items in queue order. A queue node that does not exist yet is an
    /// empty queue.
    pub async fn list_ordered(&self) -> QueueResult<Vec<QueueItem>> {
        let session = self.coord.connect().await?;
        let result = self.list_in(session.as_ref()).await;
        close_quietly(session).await;
        result
    }

    async fn list_in(&self, session: &dyn Session) -> QueueResult<Vec<QueueItem>> {
        let names = match session.children(&self.path).await {
            Ok(names) => names,
            Err(CoordError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::with_capacity(names.len());
        for name in names {
            if parse_item_name(&name).is_none() {
                debug!(node = %name, "Skipping non-item node in queue");
                continue;
            }
            match session.get_data(&join_path(&self.path, &name)).await {
                Ok(node) => items.push(QueueItem::decode(&name, &node.data, node.version)?),
                // removed between listing and reading
                Err(CoordError::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        items.sort_by_key(|item| (item.priority, item.sequence));
        Ok(items)
    }

    /// Single item by ID
    pub async fn item(&self, item_id: &str) -> QueueResult<QueueItem> {
        let session = self.coord.connect().await?;
        let result = self.read_in(session.as_ref(), item_id).await;
        close_quietly(session).await;
        result
    }

    async fn read_in(&self, session: &dyn Session, item_id: &str) -> QueueResult<QueueItem> {
        if parse_item_name(item_id).is_none() {
            return Err(QueueError::ItemNotFound(item_id.to_string()));
        }
        match session.get_data(&join_path(&self.path, item_id)).await {
            Ok(node) => QueueItem::decode(item_id, &node.data, node.version),
            Err(CoordError::NoNode(_)) => Err(QueueError::ItemNotFound(item_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_in(
        &self,
        session: &dyn Session,
        item: &QueueItem,
        to: ItemStatus,
    ) -> QueueResult<QueueItem> {
        let data = encode(to, Some(item.status), &item.payload);
        let version = match session
            .set_data(&join_path(&self.path, &item.id), &data, Some(item.version))
            .await
        {
            Ok(v) => v,
            Err(CoordError::NoNode(_)) => return Err(QueueError::ItemNotFound(item.id.clone())),
            Err(e) => return Err(e.into()),
        };
        Ok(QueueItem {
            status: to,
            prior_status: Some(item.status),
            version,
            ..item.clone()
        })
    }

    async fn transition(&self, item_id: &str, from: ItemStatus, to: ItemStatus) -> QueueResult<QueueItem> {
        let session = self.coord.connect().await?;
        let result: QueueResult<QueueItem> = async {
            let item = self.read_in(session.as_ref(), item_id).await?;
            if item.status != from {
                return Err(QueueError::InvalidTransition {
                    item: item_id.to_string(),
                    expected: from,
                    actual: item.status,
                });
            }
            self.write_in(session.as_ref(), &item, to).await
        }
        .await;
        close_quietly(session).await;

        match &result {
            Ok(_) => debug!(queue = %self.path, item_id, %from, %to, "Queue item transition"),
            Err(e) => debug!(queue = %self.path, item_id, %from, %to, error = %e, "Queue item transition refused"),
        }
        result
    }

    /// Claim a specific pending item
    pub async fn consume(&self, item_id: &str) -> QueueResult<QueueItem> {
        self.transition(item_id, ItemStatus::Pending, ItemStatus::Consumed).await
    }

    /// Claim the first pending item in queue order, skipping held items.
    /// Returns `None` when nothing is pending.
    #[instrument(skip(self), fields(queue = %self.path))]
    pub async fn consume_next(&self) -> QueueResult<Option<QueueItem>> {
        let session = self.coord.connect().await?;
        let result: QueueResult<Option<QueueItem>> = async {
            for item in self.list_in(session.as_ref()).await? {
                if item.status != ItemStatus::Pending {
                    continue;
                }
                match self.write_in(session.as_ref(), &item, ItemStatus::Consumed).await {
                    Ok(claimed) => return Ok(Some(claimed)),
                    // another consumer won this one
                    Err(QueueError::Coord(CoordError::BadVersion { .. })) | Err(QueueError::ItemNotFound(_)) => {
                        continue
                    },
                    Err(e) => return Err(e),
                }
            }
            Ok(None)
        }
        .await;
        close_quietly(session).await;

        if let Ok(Some(ref item)) = result {
            info!(item_id = %item.id, "Consumed item");
        }
        result
    }

    /// Mark a consumed item completed
    pub async fn complete(&self, item_id: &str) -> QueueResult<QueueItem> {
        self.transition(item_id, ItemStatus::Consumed, ItemStatus::Completed).await
    }

    /// Mark a consumed item failed
    pub async fn fail(&self, item_id: &str) -> QueueResult<QueueItem> {
        self.transition(item_id, ItemStatus::Consumed, ItemStatus::Failed).await
    }

    pub async fn requeue_from_fail(&self, item_id: &str) -> QueueResult<QueueItem> {
        self.transition(item_id, ItemStatus::Failed, ItemStatus::Pending).await
    }

    pub async fn requeue_from_consume(&self, item_id: &str) -> QueueResult<QueueItem> {
        self.transition(item_id, ItemStatus::Consumed, ItemStatus::Pending).await
    }

    pub async fn requeue_from_complete(&self, item_id: &str) -> QueueResult<QueueItem> {
        self.transition(item_id, ItemStatus::Completed, ItemStatus::Pending).await
    }

    /// Exclude a pending item from consumption; it stays listed
    pub async fn hold(&self, item_id: &str) -> QueueResult<QueueItem> {
        self.transition(item_id, ItemStatus::Pending, ItemStatus::Held).await
    }

    pub async fn release(&self, item_id: &str) -> QueueResult<QueueItem> {
        self.transition(item_id, ItemStatus::Held, ItemStatus::Pending).await
    }

    async fn delete_from(&self, item_id: &str, from: ItemStatus) -> QueueResult<DeletionRecord> {
        self.transition(item_id, from, ItemStatus::Deleted).await?;
        let record = DeletionRecord {
            queue: self.path.clone(),
            item_id: item_id.to_string(),
            prior_status: from,
        };
        info!(
            target: AUDIT_TARGET,
            queue = %record.queue,
            item_id = %record.item_id,
            prior_status = %record.prior_status,
            "Queue item deleted"
        );
        Ok(record)
    }

    pub async fn delete_from_fail(&self, item_id: &str) -> QueueResult<DeletionRecord> {
        self.delete_from(item_id, ItemStatus::Failed).await
    }

    pub async fn delete_from_consume(&self, item_id: &str) -> QueueResult<DeletionRecord> {
        self.delete_from(item_id, ItemStatus::Consumed).await
    }

    pub async fn delete_from_complete(&self, item_id: &str) -> QueueResult<DeletionRecord> {
        self.delete_from(item_id, ItemStatus::Completed).await
    }

    pub async fn delete_from_pending(&self, item_id: &str) -> QueueResult<DeletionRecord> {
        self.delete_from(item_id, ItemStatus::Pending).await
    }

    pub async fn delete_from_held(&self, item_id: &str) -> QueueResult<DeletionRecord> {
        self.delete_from(item_id, ItemStatus::Held).await
    }

    /// Remove every item currently in `status` (completed or deleted only).
    /// Returns the number of items removed; an absent queue removes nothing.
    #[instrument(skip(self), fields(queue = %self.path))]
    pub async fn cleanup(&self, status: ItemStatus) -> QueueResult<usize> {
        if !status.is_cleanable() {
            return Err(QueueError::NotCleanable(status));
        }
        let session = self.coord.connect().await?;
        let result: QueueResult<usize> = async {
            let mut removed = 0;
            for item in self.list_in(session.as_ref()).await? {
                if item.status != status {
                    continue;
                }
                match session.delete(&join_path(&self.path, &item.id), Some(item.version)).await {
                    Ok(()) => removed += 1,
                    // gone or changed since listing; leave it for the next sweep
                    Err(CoordError::NoNode(_)) | Err(CoordError::BadVersion { .. }) => {},
                    Err(e) => return Err(QueueError::from(e)),
                }
            }
            Ok(removed)
        }
        .await;
        close_quietly(session).await;

        if let Ok(removed) = result {
            info!(target: AUDIT_TARGET, queue = %self.path, %status, removed, "Queue cleanup");
        }
        result
    }

    /// Count items per status
    pub async fn summary(&self) -> QueueResult<QueueSummary> {
        let mut summary = QueueSummary::new();
        for item in self.list_ordered().await? {
            *summary.entry(item.status).or_default() += 1;
        }
        Ok(summary)
    }
}
