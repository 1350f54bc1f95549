//! Batch completion tracking
//!
//! For every batch in flight the tracker keeps the authoritative
//! [`BatchSnapshot`], a readiness flag (every job durably queued) and the
//! set of jobs that reached a terminal handler. When the last job reports,
//! the batch-report stage runs once and the batch is forgotten.
//!
//! Each batch has its own mutex; unrelated batches never contend. After a
//! restart the map is empty, and the first job that waits for readiness
//! rebuilds the batch from `batch-state.json` in the batch working
//! directory, provided the `posting-complete` marker shows that every job
//! had been posted before the crash. Recovery and other direct snapshot
//! updates are serialized per batch ID.
//!
//! A job requeued after its batch concluded is a rerun: its new outcome is
//! written into the snapshot with [`BatchTracker::record_rerun`], and the
//! batch keeps its reported status.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::executor::PipelineExecutor;
use crate::profile::Stage;
use crate::state::{BatchState, BatchStatus, IngestRequest, JobState, StateError};
use mrt_common::types::{BatchId, JobId};

pub const SNAPSHOT_FILE: &str = "batch-state.json";
pub const POSTED_MARKER: &str = "posting-complete";

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Batch {batch_id} not ready after {attempts} attempts")]
    NotReady { batch_id: BatchId, attempts: u32 },

    #[error("Batch {batch_id} cannot be recovered: {reason}")]
    RecoveryInconsistency { batch_id: BatchId, reason: String },

    #[error("Batch {batch_id} already finished with status {status}")]
    AlreadyTerminal { batch_id: BatchId, status: BatchStatus },

    #[error("Batch {0} is not tracked")]
    UnknownBatch(BatchId),

    #[error("Batch {0} is already tracked")]
    AlreadyTracked(BatchId),

    #[error(transparent)]
    State(#[from] StateError),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// What is persisted per batch: the batch and the request that created it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch: BatchState,
    pub request: IngestRequest,
}

impl BatchSnapshot {
    pub fn new(batch: BatchState, request: IngestRequest) -> Self {
        Self { batch, request }
    }

    pub fn working_dir(&self) -> &Path {
        &self.request.working_dir
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> TrackerError + '_ {
    move |source| TrackerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write a snapshot into `dir`, replacing any previous one atomically
pub async fn write_snapshot(dir: &Path, snapshot: &BatchSnapshot) -> TrackerResult<()> {
    let path = dir.join(SNAPSHOT_FILE);
    let tmp = dir.join(format!(".{}.tmp", SNAPSHOT_FILE));
    let bytes = serde_json::to_vec_pretty(snapshot).map_err(|source| TrackerError::Snapshot {
        path: path.clone(),
        source,
    })?;
    tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
    tokio::fs::write(&tmp, &bytes).await.map_err(io_err(&tmp))?;
    tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path))?;
    Ok(())
}

pub async fn read_snapshot(dir: &Path) -> TrackerResult<BatchSnapshot> {
    let path = dir.join(SNAPSHOT_FILE);
    let bytes = tokio::fs::read(&path).await.map_err(io_err(&path))?;
    serde_json::from_slice(&bytes).map_err(|source| TrackerError::Snapshot { path, source })
}

/// Tracker timing
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub ready_poll_interval: Duration,
    pub ready_poll_attempts: u32,
    pub render_attempts: u32,
    pub render_interval: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            ready_poll_interval: Duration::from_secs(2),
            ready_poll_attempts: 30,
            render_attempts: 5,
            render_interval: Duration::from_secs(1),
        }
    }
}

/// Batch state as shown to callers; `partial` marks a snapshot taken before
/// the batch was fully posted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchView {
    pub batch: BatchState,
    pub partial: bool,
}

struct BatchEntry {
    snapshot: BatchSnapshot,
    ready: bool,
    completed: HashSet<JobId>,
    fired: bool,
}

pub struct BatchTracker {
    entries: DashMap<BatchId, Arc<Mutex<BatchEntry>>>,
    /// Serializes recovery and on-disk updates of untracked batches
    disk_locks: DashMap<BatchId, Arc<Mutex<()>>>,
    executor: PipelineExecutor<BatchState>,
    settings: TrackerSettings,
}

impl BatchTracker {
    pub fn new(executor: PipelineExecutor<BatchState>, settings: TrackerSettings) -> Self {
        Self {
            entries: DashMap::new(),
            disk_locks: DashMap::new(),
            executor,
            settings,
        }
    }

    fn entry(&self, batch_id: &BatchId) -> Option<Arc<Mutex<BatchEntry>>> {
        self.entries.get(batch_id).map(|e| Arc::clone(e.value()))
    }

    fn disk_lock(&self, batch_id: &BatchId) -> Arc<Mutex<()>> {
        Arc::clone(self.disk_locks.entry(batch_id.clone()).or_default().value())
    }

    /// Drop our handle and forget the lock once nobody else holds one
    fn release_disk_lock(&self, batch_id: &BatchId, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.disk_locks.remove_if(batch_id, |_, l| Arc::strong_count(l) == 1);
    }

    /// Start tracking a batch. The snapshot is written before this returns.
    #[instrument(skip_all, fields(batch_id = %snapshot.batch.batch_id))]
    pub async fn register(&self, snapshot: BatchSnapshot) -> TrackerResult<()> {
        let batch_id = snapshot.batch.batch_id.clone();
        if self.entries.contains_key(&batch_id) {
            return Err(TrackerError::AlreadyTracked(batch_id));
        }
        write_snapshot(snapshot.working_dir(), &snapshot).await?;
        let completed = snapshot
            .batch
            .jobs
            .values()
            .filter(|j| j.status().is_terminal())
            .map(|j| j.job_id.clone())
            .collect();
        self.entries.insert(
            batch_id,
            Arc::new(Mutex::new(BatchEntry {
                snapshot,
                ready: false,
                completed,
                fired: false,
            })),
        );
        debug!("Batch registered");
        Ok(())
    }

    /// Mark every job of the batch as durably queued. Writes the
    /// posting-complete marker next to the snapshot.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn mark_ready(&self, batch_id: &BatchId) -> TrackerResult<()> {
        let entry = self
            .entry(batch_id)
            .ok_or_else(|| TrackerError::UnknownBatch(batch_id.clone()))?;
        let mut entry = entry.lock().await;
        write_snapshot(entry.snapshot.working_dir(), &entry.snapshot).await?;
        let marker = entry.snapshot.working_dir().join(POSTED_MARKER);
        tokio::fs::write(&marker, b"").await.map_err(io_err(&marker))?;
        entry.ready = true;
        info!(jobs = entry.snapshot.batch.job_count(), "Batch ready");
        Ok(())
    }

    pub async fn is_ready(&self, batch_id: &BatchId) -> bool {
        match self.entry(batch_id) {
            Some(entry) => entry.lock().await.ready,
            None => false,
        }
    }

    pub fn is_tracked(&self, batch_id: &BatchId) -> bool {
        self.entries.contains_key(batch_id)
    }

    pub fn tracked_batches(&self) -> Vec<BatchId> {
        let mut ids: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Jobs of a tracked batch that have reached a terminal handler
    pub async fn completed_count(&self, batch_id: &BatchId) -> Option<usize> {
        match self.entry(batch_id) {
            Some(entry) => Some(entry.lock().await.completed.len()),
            None => None,
        }
    }

    /// Current snapshot, from memory or else from disk
    pub async fn snapshot(&self, batch_id: &BatchId, dir: &Path) -> TrackerResult<BatchSnapshot> {
        match self.entry(batch_id) {
            Some(entry) => Ok(entry.lock().await.snapshot.clone()),
            None => {
                let snapshot = read_snapshot(dir).await?;
                if &snapshot.batch.batch_id != batch_id {
                    return Err(TrackerError::UnknownBatch(batch_id.clone()));
                }
                Ok(snapshot)
            },
        }
    }

    /// Administrative override: move a failed job to resolved, in memory if
    /// the batch is in flight and always in the snapshot on disk
    #[instrument(skip(self, dir, note), fields(batch_id = %batch_id, job_id = %job_id))]
    pub async fn resolve_job(
        &self,
        batch_id: &BatchId,
        job_id: &JobId,
        note: &str,
        dir: &Path,
    ) -> TrackerResult<JobState> {
        fn apply(snapshot: &mut BatchSnapshot, job_id: &JobId, note: &str) -> TrackerResult<JobState> {
            let batch_id = snapshot.batch.batch_id.clone();
            let job = snapshot
                .batch
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| StateError::UnknownJob {
                    batch: batch_id,
                    job: job_id.clone(),
                })?;
            job.resolve(note)?;
            Ok(job.clone())
        }

        match self.entry(batch_id) {
            Some(entry) => {
                let mut entry = entry.lock().await;
                let job = apply(&mut entry.snapshot, job_id, note)?;
                write_snapshot(entry.snapshot.working_dir(), &entry.snapshot).await?;
                Ok(job)
            },
            None => {
                let lock = self.disk_lock(batch_id);
                let result: TrackerResult<JobState> = async {
                    let _guard = lock.lock().await;
                    let mut snapshot = self.snapshot(batch_id, dir).await?;
                    let job = apply(&mut snapshot, job_id, note)?;
                    write_snapshot(dir, &snapshot).await?;
                    Ok(job)
                }
                .await;
                self.release_disk_lock(batch_id, lock);
                result
            },
        }
    }

    /// Record the outcome of a job rerun after its batch concluded. The job
    /// is replaced in the on-disk snapshot; the batch status and the
    /// batch-report stage are left alone.
    #[instrument(skip_all, fields(batch_id = %batch_id, job_id = %job.job_id))]
    pub async fn record_rerun(&self, batch_id: &BatchId, job: JobState, dir: &Path) -> TrackerResult<BatchState> {
        let lock = self.disk_lock(batch_id);
        let result: TrackerResult<BatchState> = async {
            let _guard = lock.lock().await;
            if self.entries.contains_key(batch_id) {
                return Err(TrackerError::AlreadyTracked(batch_id.clone()));
            }
            let mut snapshot = read_snapshot(dir).await?;
            if &snapshot.batch.batch_id != batch_id {
                return Err(TrackerError::UnknownBatch(batch_id.clone()));
            }
            if !snapshot.batch.status().is_terminal() {
                return Err(TrackerError::RecoveryInconsistency {
                    batch_id: batch_id.clone(),
                    reason: "rerun reported for a batch that has not concluded".to_string(),
                });
            }
            let status = job.status();
            snapshot.batch.update_job(job)?;
            write_snapshot(dir, &snapshot).await?;
            info!(%status, batch_status = %snapshot.batch.status(), "Rerun recorded");
            Ok(snapshot.batch)
        }
        .await;
        self.release_disk_lock(batch_id, lock);
        result
    }

    /// Stop tracking a batch whose jobs could not all be posted. The batch is
    /// marked failed in its snapshot; no posting marker is written, so it is
    /// never recovered.
    #[instrument(skip(self, reason), fields(batch_id = %batch_id))]
    pub async fn abandon(&self, batch_id: &BatchId, reason: &str) -> TrackerResult<()> {
        let Some((_, entry)) = self.entries.remove(batch_id) else {
            return Err(TrackerError::UnknownBatch(batch_id.clone()));
        };
        let mut entry = entry.lock().await;
        entry.fired = true;
        entry.snapshot.batch.mark_failed(format!("queue post failed: {}", reason));
        warn!(reason, "Batch abandoned");
        write_snapshot(entry.snapshot.working_dir(), &entry.snapshot).await
    }

    /// Block until the batch is ready, polling at a fixed interval. An
    /// untracked batch is recovered from `dir` first.
    #[instrument(skip(self, dir), fields(batch_id = %batch_id))]
    pub async fn wait_ready(&self, batch_id: &BatchId, dir: &Path) -> TrackerResult<()> {
        let attempts = self.settings.ready_poll_attempts.max(1);
        for attempt in 1..=attempts {
            if !self.entries.contains_key(batch_id) {
                self.recover(batch_id, dir).await?;
            }
            if self.is_ready(batch_id).await {
                return Ok(());
            }
            debug!(attempt, attempts, "Batch not ready yet");
            if attempt < attempts {
                tokio::time::sleep(self.settings.ready_poll_interval).await;
            }
        }
        Err(TrackerError::NotReady {
            batch_id: batch_id.clone(),
            attempts,
        })
    }

    async fn recover(&self, batch_id: &BatchId, dir: &Path) -> TrackerResult<()> {
        let lock = self.disk_lock(batch_id);
        let result = {
            let _guard = lock.lock().await;
            self.recover_locked(batch_id, dir).await
        };
        self.release_disk_lock(batch_id, lock);
        result
    }

    async fn recover_locked(&self, batch_id: &BatchId, dir: &Path) -> TrackerResult<()> {
        if self.entries.contains_key(batch_id) {
            // another job recovered it while we waited
            return Ok(());
        }

        let inconsistent = |reason: String| TrackerError::RecoveryInconsistency {
            batch_id: batch_id.clone(),
            reason,
        };
        if !tokio::fs::try_exists(dir.join(POSTED_MARKER)).await.unwrap_or(false) {
            let err = inconsistent(format!(
                "no {} marker in {}; batch was still being posted",
                POSTED_MARKER,
                dir.display()
            ));
            error!(error = %err, "Batch recovery refused");
            return Err(err);
        }
        let snapshot = read_snapshot(dir).await?;
        if &snapshot.batch.batch_id != batch_id {
            return Err(inconsistent(format!(
                "snapshot in {} belongs to {}",
                dir.display(),
                snapshot.batch.batch_id
            )));
        }
        if snapshot.batch.status().is_terminal() {
            return Err(TrackerError::AlreadyTerminal {
                batch_id: batch_id.clone(),
                status: snapshot.batch.status(),
            });
        }

        let completed: HashSet<JobId> = snapshot
            .batch
            .jobs
            .values()
            .filter(|j| j.status().is_terminal())
            .map(|j| j.job_id.clone())
            .collect();
        warn!(
            jobs = snapshot.batch.job_count(),
            completed = completed.len(),
            "Recovered batch from snapshot"
        );
        self.entries.insert(
            batch_id.clone(),
            Arc::new(Mutex::new(BatchEntry {
                snapshot,
                ready: true,
                completed,
                fired: false,
            })),
        );
        Ok(())
    }

    /// Record that a job reached a terminal handler. When this completes the
    /// batch, the batch-report stage runs and the concluded batch is
    /// returned; the tracker then forgets the batch.
    #[instrument(skip_all, fields(batch_id = %batch_id, job_id = %job.job_id))]
    pub async fn record_job_terminal(&self, batch_id: &BatchId, job: JobState) -> TrackerResult<Option<BatchState>> {
        let entry = self
            .entry(batch_id)
            .ok_or_else(|| TrackerError::UnknownBatch(batch_id.clone()))?;
        let mut entry = entry.lock().await;
        if entry.fired {
            debug!("Batch already concluded; ignoring late report");
            return Ok(None);
        }

        let job_id = job.job_id.clone();
        entry.snapshot.batch.update_job(job)?;
        if !entry.completed.insert(job_id) {
            debug!("Duplicate terminal report");
        }
        let total = entry.snapshot.batch.job_count();
        let done = entry.completed.len();
        info!(done, total, "Job reached terminal handler");

        if done < total {
            write_snapshot(entry.snapshot.working_dir(), &entry.snapshot).await?;
            return Ok(None);
        }

        entry.fired = true;
        let snapshot = &mut entry.snapshot;
        snapshot.batch.conclude();
        let profile = snapshot.batch.profile.clone();
        if let Err(e) = self
            .executor
            .run_stage(&profile, Stage::BatchReport, &snapshot.request, &mut snapshot.batch)
            .await
        {
            error!(error = %e, "Batch report stage could not run");
            snapshot.batch.mark_failed(e.to_string());
        }
        let result = write_snapshot(snapshot.working_dir(), snapshot).await;
        let concluded = snapshot.batch.clone();
        self.entries.remove(batch_id);
        result?;

        info!(
            status = %concluded.status(),
            message = concluded.status_message().unwrap_or(""),
            "Batch concluded"
        );
        Ok(Some(concluded))
    }

    /// Render a batch, retrying while it is still being posted. After the
    /// last attempt a not-yet-ready batch is returned marked partial.
    pub async fn render(&self, batch_id: &BatchId, dir: &Path) -> TrackerResult<BatchView> {
        let attempts = self.settings.render_attempts.max(1);
        for attempt in 1..=attempts {
            match self.entry(batch_id) {
                Some(entry) => {
                    let entry = entry.lock().await;
                    if entry.ready || attempt == attempts {
                        return Ok(BatchView {
                            batch: entry.snapshot.batch.clone(),
                            partial: !entry.ready,
                        });
                    }
                },
                None => {
                    let snapshot = read_snapshot(dir).await?;
                    if &snapshot.batch.batch_id != batch_id {
                        return Err(TrackerError::UnknownBatch(batch_id.clone()));
                    }
                    let partial = !snapshot.batch.status().is_terminal()
                        && !tokio::fs::try_exists(dir.join(POSTED_MARKER)).await.unwrap_or(false);
                    return Ok(BatchView {
                        batch: snapshot.batch,
                        partial,
                    });
                },
            }
            tokio::time::sleep(self.settings.render_interval).await;
        }
        Err(TrackerError::UnknownBatch(batch_id.clone()))
    }
}
