//! Submission and consumption orchestration
//!
//! `submit_batch` checks the global freeze, loads the profile, runs the
//! batch-process stage, writes the batch snapshot and then posts every job
//! to the queue from a forked task. The caller waits for that task for a
//! bounded time; a post that fails within the window fails the submission,
//! one that outlives it keeps running and reports through the log. A failed
//! post withdraws the jobs it already queued and abandons the batch.
//!
//! `process_next` is the consumer side: claim a queue item, wait until its
//! batch is fully posted, run the job pipeline and report the job to the
//! batch tracker. A job requeued after its batch concluded runs again and
//! only its own entry in the batch snapshot changes.

use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::config::IngestConfig;
use crate::coord::{connect_endpoint, Coordination};
use crate::envelope::JobEnvelope;
use crate::executor::{PipelineError, PipelineExecutor};
use crate::handler::Handlers;
use crate::lock::{LockError, LockRegistry};
use crate::profile::{ProfileError, ProfileStore, Stage};
use crate::queue::{DistributedQueue, QueueError, QueueItem, MAX_PRIORITY};
use crate::state::{BatchState, BatchStatus, IngestRequest, JobState, StateError, StorageRef};
use crate::tracker::{BatchSnapshot, BatchTracker, BatchView, TrackerError};
use mrt_common::logging::AUDIT_TARGET;
use mrt_common::types::{BatchId, JobId};
use mrt_common::MrtError;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Ingest queue is frozen; submission rejected")]
    Frozen,

    #[error("Submission contains no jobs")]
    EmptyBatch,

    #[error("Batch {batch_id} rejected: {message}")]
    BatchRejected { batch_id: BatchId, message: String },

    #[error("Queue post task failed: {0}")]
    PostTask(String),

    #[error("Malformed queue payload in {item}: {source}")]
    Payload {
        item: String,
        #[source]
        source: MrtError,
    },

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Envelope(#[from] MrtError),
}

impl SubmitError {
    /// Coordination failures the caller may retry
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmitError::Queue(e) => e.is_retryable(),
            SubmitError::Lock(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type SubmitResult<T> = std::result::Result<T, SubmitError>;

/// Result of the forked queue post
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PostSummary {
    /// Queue item IDs, in posting order
    pub posted: Vec<String>,
    /// Jobs that failed their queue-post chain and were never queued
    pub rejected: Vec<JobId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PostState {
    Complete(PostSummary),
    /// Still posting when the wait window closed
    InProgress,
}

/// What the submitter gets back
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub batch_id: BatchId,
    pub batch_dir: PathBuf,
    pub jobs: usize,
    pub post: PostState,
}

/// One consumed queue item after its pipeline ran
#[derive(Debug, Clone)]
pub struct Processed {
    pub item_id: String,
    pub job: JobState,
    /// The batch, when this job was its last
    pub concluded: Option<BatchState>,
}

/// Wiring for the orchestrators
pub struct ManagerOptions {
    pub queue_path: String,
    pub lock_root: String,
    pub profile_dir: PathBuf,
    pub batch_dir: PathBuf,
    pub post_workers: usize,
    pub post_wait: Duration,
    pub tracker: crate::tracker::TrackerSettings,
}

impl ManagerOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            queue_path: config.queue.path.clone(),
            lock_root: config.locks.root.clone(),
            profile_dir: config.profiles.dir.clone(),
            batch_dir: config.batches.dir.clone(),
            post_workers: config.submission.post_workers,
            post_wait: config.post_wait(),
            tracker: config.tracker_settings(),
        }
    }
}

#[derive(Clone)]
pub struct IngestManager {
    queue: DistributedQueue,
    locks: LockRegistry,
    profiles: ProfileStore,
    tracker: Arc<BatchTracker>,
    jobs: PipelineExecutor<JobState>,
    batches: PipelineExecutor<BatchState>,
    post_permits: Arc<Semaphore>,
    post_wait: Duration,
    batch_root: PathBuf,
}

impl IngestManager {
    pub fn new(coord: Arc<dyn Coordination>, options: ManagerOptions, handlers: Handlers) -> SubmitResult<Self> {
        let jobs = PipelineExecutor::new(Arc::new(handlers.job));
        let batches = PipelineExecutor::new(Arc::new(handlers.batch));
        Ok(Self {
            queue: DistributedQueue::new(Arc::clone(&coord), options.queue_path)?,
            locks: LockRegistry::new(coord, options.lock_root)?,
            profiles: ProfileStore::new(options.profile_dir),
            tracker: Arc::new(BatchTracker::new(batches.clone(), options.tracker)),
            jobs,
            batches,
            post_permits: Arc::new(Semaphore::new(options.post_workers.max(1))),
            post_wait: options.post_wait,
            batch_root: options.batch_dir,
        })
    }

    /// Connect to the configured coordination endpoint and wire everything
    pub fn from_config(config: &IngestConfig, handlers: Handlers) -> anyhow::Result<Self> {
        use anyhow::Context;

        let coord = connect_endpoint(config.endpoint()?, config.session_timeout())
            .context("Failed to set up coordination backend")?;
        Self::new(coord, ManagerOptions::from_config(config), handlers).context("Failed to build ingest manager")
    }

    pub fn queue(&self) -> &DistributedQueue {
        &self.queue
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn tracker(&self) -> &BatchTracker {
        &self.tracker
    }

    pub fn batch_dir(&self, batch_id: &BatchId) -> PathBuf {
        self.batch_root.join(batch_id.as_str())
    }

    /// Submit a batch of jobs
    #[instrument(skip_all, fields(profile = %request.profile_id, jobs = jobs.len()))]
    pub async fn submit_batch(&self, mut request: IngestRequest, jobs: Vec<JobState>) -> SubmitResult<Submission> {
        if self.locks.is_frozen().await? {
            info!(target: AUDIT_TARGET, profile = %request.profile_id, "Submission rejected: ingest frozen");
            return Err(SubmitError::Frozen);
        }
        if jobs.is_empty() {
            return Err(SubmitError::EmptyBatch);
        }

        let profile = self.profiles.load(&request.profile_id)?;
        self.batches.validate(&profile, &[Stage::BatchProcess, Stage::BatchReport])?;
        self.jobs.validate(&profile, &[Stage::QueuePost])?;

        let priority = request.priority.unwrap_or(profile.priority);
        if priority > MAX_PRIORITY {
            return Err(QueueError::InvalidPriority(priority).into());
        }

        let batch_id = BatchId::generate();
        let batch_dir = self.batch_dir(&batch_id);
        request.working_dir = batch_dir.clone();

        let mut batch = BatchState::new(batch_id.clone(), profile.clone());
        batch.label = request.label.clone();
        batch.update = request.update;
        batch.queue_path = Some(self.queue.path().to_string());
        for mut job in jobs {
            job.profile_id = profile.profile_id.clone();
            job.priority = priority;
            job.storage = Some(StorageRef {
                endpoint: profile.storage_endpoint.clone(),
                node: profile.storage_node,
            });
            batch.add_job(job)?;
        }

        let report = self
            .batches
            .run_stage(&profile, Stage::BatchProcess, &request, &mut batch)
            .await?;
        if report.failed {
            let message = batch.status_message().unwrap_or("batch-process stage failed").to_string();
            warn!(batch_id = %batch_id, %message, "Batch rejected");
            return Err(SubmitError::BatchRejected { batch_id, message });
        }

        let job_count = batch.job_count();
        self.tracker
            .register(BatchSnapshot::new(batch.clone(), request.clone()))
            .await?;
        info!(batch_id = %batch_id, jobs = job_count, "Batch accepted");

        let mut handle = tokio::spawn(self.clone().post_batch(batch, request));
        let post = match tokio::time::timeout(self.post_wait, &mut handle).await {
            Ok(Ok(Ok(summary))) => PostState::Complete(summary),
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(join)) => return Err(SubmitError::PostTask(join.to_string())),
            Err(_) => {
                warn!(batch_id = %batch_id, wait = ?self.post_wait, "Queue post still running; not waiting further");
                let id = batch_id.clone();
                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(summary)) => info!(batch_id = %id, posted = summary.posted.len(), "Queue post finished"),
                        Ok(Err(e)) => error!(batch_id = %id, error = %e, "Queue post failed"),
                        Err(e) => error!(batch_id = %id, error = %e, "Queue post task aborted"),
                    }
                });
                PostState::InProgress
            },
        };

        Ok(Submission {
            batch_id,
            batch_dir,
            jobs: job_count,
            post,
        })
    }

    /// Submit a single job as a batch of one
    pub async fn submit_job(&self, request: IngestRequest, job: JobState) -> SubmitResult<Submission> {
        self.submit_batch(request, vec![job]).await
    }

    async fn post_batch(self, batch: BatchState, request: IngestRequest) -> SubmitResult<PostSummary> {
        let batch_id = batch.batch_id.clone();
        let mut posted = Vec::new();
        let rejected = match self.post_jobs(&batch, &request, &mut posted).await {
            Ok(rejected) => rejected,
            Err(e) => {
                self.withdraw(&batch_id, &posted, &e).await;
                return Err(e);
            },
        };

        let mut summary = PostSummary {
            posted,
            rejected: Vec::new(),
        };
        for job in rejected {
            summary.rejected.push(job.job_id.clone());
            self.tracker.record_job_terminal(&batch_id, job).await?;
        }
        Ok(summary)
    }

    /// Queue every job that passes queue-post, then mark the batch ready.
    /// Item IDs land in `posted` as they are enqueued.
    async fn post_jobs(
        &self,
        batch: &BatchState,
        request: &IngestRequest,
        posted: &mut Vec<String>,
    ) -> SubmitResult<Vec<JobState>> {
        let _permit = self
            .post_permits
            .acquire()
            .await
            .map_err(|e| SubmitError::PostTask(e.to_string()))?;
        let batch_id = &batch.batch_id;
        let mut rejected = Vec::new();

        for job in batch.jobs.values() {
            let mut staged = job.clone();
            let report = self
                .jobs
                .run_stage(&batch.profile, Stage::QueuePost, request, &mut staged)
                .await?;
            if report.failed {
                warn!(batch_id = %batch_id, job_id = %job.job_id, "Job failed queue-post; not queued");
                rejected.push(staged);
                continue;
            }

            let mut queued = job.clone();
            queued.extra = staged.extra;
            queued.submitted_at = Utc::now();
            let envelope = JobEnvelope::new(batch_id.clone(), request.working_dir.clone(), queued);
            let item = self.queue.enqueue(&envelope.to_bytes()?, envelope.priority).await?;
            posted.push(item);
        }

        self.tracker.mark_ready(batch_id).await?;
        Ok(rejected)
    }

    /// Undo a partial post: delete the items already queued and stop
    /// tracking the batch. Items a consumer already claimed stay put; their
    /// batch can no longer be recovered, so they fail.
    async fn withdraw(&self, batch_id: &BatchId, posted: &[String], cause: &SubmitError) {
        error!(batch_id = %batch_id, posted = posted.len(), error = %cause, "Queue post failed; withdrawing batch");
        for item in posted {
            if let Err(e) = self.queue.delete_from_pending(item).await {
                warn!(item_id = %item, error = %e, "Could not withdraw queued job");
            }
        }
        if let Err(e) = self.tracker.abandon(batch_id, &cause.to_string()).await {
            warn!(batch_id = %batch_id, error = %e, "Could not record abandoned batch");
        }
    }

    /// Claim and process the next pending queue item. `None` when the queue
    /// has nothing pending.
    pub async fn process_next(&self) -> SubmitResult<Option<Processed>> {
        let Some(item) = self.queue.consume_next().await? else {
            return Ok(None);
        };
        self.process_item(item).await.map(Some)
    }

    async fn process_item(&self, item: QueueItem) -> SubmitResult<Processed> {
        let envelope = match JobEnvelope::from_bytes(&item.payload) {
            Ok(envelope) => envelope,
            Err(source) => {
                self.queue.fail(&item.id).await?;
                return Err(SubmitError::Payload { item: item.id, source });
            },
        };

        match self.process_job(envelope).await {
            Ok((job, concluded)) => {
                if job.status() == crate::state::JobStatus::Failed {
                    self.queue.fail(&item.id).await?;
                } else {
                    self.queue.complete(&item.id).await?;
                }
                Ok(Processed {
                    item_id: item.id,
                    job,
                    concluded,
                })
            },
            Err(e) => {
                error!(item_id = %item.id, error = %e, "Queue item processing failed");
                if let Err(fail_err) = self.queue.fail(&item.id).await {
                    warn!(item_id = %item.id, error = %fail_err, "Could not mark item failed");
                }
                Err(e)
            },
        }
    }

    /// Run one job's pipeline and report it to the tracker. Returns the job
    /// and, if it was the batch's last, the concluded batch.
    #[instrument(skip_all, fields(batch_id = %envelope.batch_id, job_id = %envelope.job_id))]
    pub async fn process_job(&self, envelope: JobEnvelope) -> SubmitResult<(JobState, Option<BatchState>)> {
        match self.tracker.wait_ready(&envelope.batch_id, &envelope.batch_dir).await {
            Ok(()) => {},
            Err(TrackerError::AlreadyTerminal { status, .. }) => return self.rerun_job(envelope, status).await,
            Err(e) => return Err(e.into()),
        }
        let snapshot = self.tracker.snapshot(&envelope.batch_id, &envelope.batch_dir).await?;
        let (job, outcome) = self.run_pipeline(&snapshot, envelope.job).await;

        let concluded = self.tracker.record_job_terminal(&envelope.batch_id, job.clone()).await?;
        outcome?;
        Ok((job, concluded))
    }

    /// A job requeued after its batch concluded. The batch is not reported
    /// again; only the job's entry in the snapshot is replaced.
    async fn rerun_job(
        &self,
        envelope: JobEnvelope,
        batch_status: BatchStatus,
    ) -> SubmitResult<(JobState, Option<BatchState>)> {
        warn!(%batch_status, "Batch already concluded; rerunning job");
        let snapshot = self.tracker.snapshot(&envelope.batch_id, &envelope.batch_dir).await?;
        let (job, outcome) = self.run_pipeline(&snapshot, envelope.job).await;

        self.tracker
            .record_rerun(&envelope.batch_id, job.clone(), &envelope.batch_dir)
            .await?;
        info!(
            target: AUDIT_TARGET,
            batch_id = %envelope.batch_id,
            job_id = %job.job_id,
            status = %job.status(),
            "Job rerun recorded"
        );
        outcome?;
        Ok((job, None))
    }

    /// Run the job chains; the job always comes back terminal
    async fn run_pipeline(
        &self,
        snapshot: &BatchSnapshot,
        mut job: JobState,
    ) -> (JobState, Result<(), PipelineError>) {
        job.consumed_at = Some(Utc::now());
        let outcome = self
            .jobs
            .run_job(&snapshot.batch.profile, &snapshot.request, &mut job)
            .await
            .map(|_| ());
        if let Err(ref e) = outcome {
            job.mark_failed(format!("configuration error: {}", e));
        }
        if !job.status().is_terminal() {
            job.mark_completed("no handlers configured");
        }
        info!(status = %job.status(), "Job pipeline finished");
        (job, outcome)
    }

    /// Administrative override: FAILED to RESOLVED
    pub async fn resolve_job(&self, batch_id: &BatchId, job_id: &JobId, note: &str) -> SubmitResult<JobState> {
        let job = self
            .tracker
            .resolve_job(batch_id, job_id, note, &self.batch_dir(batch_id))
            .await?;
        info!(target: AUDIT_TARGET, batch_id = %batch_id, job_id = %job_id, note, "Job resolved");
        Ok(job)
    }

    /// Current view of a batch, waiting briefly while it is being posted
    pub async fn batch_status(&self, batch_id: &BatchId) -> SubmitResult<BatchView> {
        Ok(self.tracker.render(batch_id, &self.batch_dir(batch_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordination;
    use crate::queue::ItemStatus;
    use crate::state::{BatchStatus, JobStatus};
    use crate::tracker::TrackerSettings;

    const PROFILE: &str = "\
ProfileID: demo
StorageService: http://store.example.org:35121
StorageNode: 7777
HandlerInitialize.1: handler-initialize
HandlerNotify.1: handler-notify
HandlerBatchReport.1: handler-batch-notify
";

    fn manager(root: &std::path::Path) -> IngestManager {
        let profiles = root.join("profiles");
        std::fs::create_dir_all(&profiles).unwrap();
        std::fs::write(profiles.join("demo"), PROFILE).unwrap();
        let options = ManagerOptions {
            queue_path: "/ingest".to_string(),
            lock_root: "/ingest.lock".to_string(),
            profile_dir: profiles,
            batch_dir: root.join("batches"),
            post_workers: 2,
            post_wait: Duration::from_secs(5),
            tracker: TrackerSettings {
                ready_poll_interval: Duration::from_millis(5),
                ready_poll_attempts: 20,
                render_attempts: 2,
                render_interval: Duration::from_millis(5),
            },
        };
        IngestManager::new(Arc::new(MemoryCoordination::default()), options, Handlers::with_builtins()).unwrap()
    }

    fn jobs(n: usize) -> Vec<JobState> {
        (0..n).map(|_| JobState::new(JobId::generate(), "demo")).collect()
    }

    #[tokio::test]
    async fn test_submit_then_consume_all() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());

        let submission = manager.submit_batch(IngestRequest::new("demo", ""), jobs(2)).await.unwrap();
        let PostState::Complete(summary) = &submission.post else {
            panic!("post should finish inside the window");
        };
        assert_eq!(summary.posted.len(), 2);
        assert!(submission.batch_dir.join("batch-state.json").exists());

        let first = manager.process_next().await.unwrap().unwrap();
        assert_eq!(first.job.status(), JobStatus::Completed);
        assert!(first.concluded.is_none());

        let second = manager.process_next().await.unwrap().unwrap();
        let batch = second.concluded.unwrap();
        assert_eq!(batch.status(), BatchStatus::Completed);
        assert!(manager.process_next().await.unwrap().is_none());

        let summary = manager.queue().summary().await.unwrap();
        assert_eq!(summary.get(&ItemStatus::Completed), Some(&2));
    }

    #[tokio::test]
    async fn test_unknown_profile_rejected() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        let err = manager.submit_batch(IngestRequest::new("nope", ""), jobs(1)).await.unwrap_err();
        assert!(matches!(err, SubmitError::Profile(ProfileError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        assert!(matches!(
            manager.submit_batch(IngestRequest::new("demo", ""), Vec::new()).await,
            Err(SubmitError::EmptyBatch)
        ));
    }

    #[tokio::test]
    async fn test_resolve_failed_job() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        let mut profile = PROFILE.to_string();
        profile.push_str("HandlerDownload.1: handler-missing\n");
        std::fs::write(root.path().join("profiles/demo"), profile).unwrap();

        let submission = manager.submit_batch(IngestRequest::new("demo", ""), jobs(1)).await.unwrap();
        let err = manager.process_next().await.unwrap_err();
        assert!(matches!(err, SubmitError::Pipeline(PipelineError::UnresolvedHandler { .. })));

        let view = manager.batch_status(&submission.batch_id).await.unwrap();
        assert_eq!(view.batch.status(), BatchStatus::Failed);
        let job_id = view.batch.jobs.keys().next().unwrap().clone();

        let job = manager.resolve_job(&submission.batch_id, &job_id, "handler deployed").await.unwrap();
        assert_eq!(job.status(), JobStatus::Resolved);
    }
}
