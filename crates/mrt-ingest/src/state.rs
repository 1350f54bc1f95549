//! Job and batch state
//!
//! A job starts `Pending` and ends `Completed` or `Failed`; `Resolved` is
//! only reachable from `Failed` through an administrative override. A batch
//! starts `Queued` and ends `Completed` or `Failed` once its batch-report
//! stage has run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

use crate::profile::{ProfileState, StageTarget};
use crate::queue::DEFAULT_PRIORITY;
use mrt_common::types::{BatchId, Identifier, JobId};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StateError {
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Duplicate job {0} in batch")]
    DuplicateJob(JobId),

    #[error("Job {job} not found in batch {batch}")]
    UnknownJob { batch: BatchId, job: JobId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
    Resolved,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Resolved => "RESOLVED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Queued,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BatchStatus::Queued)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchStatus::Queued => "QUEUED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        })
    }
}

/// Package digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub algorithm: String,
    pub value: String,
}

/// Optional Dublin Core description supplied with a submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DublinCore {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Where a job's object is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRef {
    pub endpoint: Url,
    pub node: Option<u32>,
}

/// One unit of ingest work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    /// `None` for a job submitted on its own
    pub batch_id: Option<BatchId>,
    pub primary_id: Option<Identifier>,
    #[serde(default)]
    pub local_ids: Vec<Identifier>,
    pub package_name: Option<String>,
    pub package_size: Option<u64>,
    pub digest: Option<Digest>,
    #[serde(default)]
    pub dublin_core: DublinCore,
    pub storage: Option<StorageRef>,
    pub profile_id: String,
    status: JobStatus,
    status_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub priority: u8,
    /// Scratch values handed from one handler to the next
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl JobState {
    pub fn new(job_id: JobId, profile_id: impl Into<String>) -> Self {
        Self {
            job_id,
            batch_id: None,
            primary_id: None,
            local_ids: Vec::new(),
            package_name: None,
            package_size: None,
            digest: None,
            dublin_core: DublinCore::default(),
            storage: None,
            profile_id: profile_id.into(),
            status: JobStatus::Pending,
            status_message: None,
            submitted_at: Utc::now(),
            consumed_at: None,
            completed_at: None,
            priority: DEFAULT_PRIORITY,
            extra: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    /// Record a successful handler. Has no effect on a failed job.
    pub fn mark_completed(&mut self, message: impl Into<String>) {
        if matches!(self.status, JobStatus::Pending | JobStatus::Completed) {
            self.status = JobStatus::Completed;
            self.status_message = Some(message.into());
            self.completed_at = Some(Utc::now());
        }
    }

    /// Record a failure. The first failure's message is kept; a resolved
    /// job stays resolved.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        if matches!(self.status, JobStatus::Pending | JobStatus::Completed) {
            self.status = JobStatus::Failed;
            self.status_message = Some(message.into());
            self.completed_at = Some(Utc::now());
        }
    }

    /// Administrative override of a failed job
    pub fn resolve(&mut self, note: impl Into<String>) -> Result<(), StateError> {
        if self.status != JobStatus::Failed {
            return Err(StateError::InvalidTransition {
                id: self.job_id.to_string(),
                from: self.status,
                to: JobStatus::Resolved,
            });
        }
        self.status = JobStatus::Resolved;
        self.status_message = Some(note.into());
        Ok(())
    }
}

/// Jobs submitted together and tracked for joint completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: BatchId,
    pub label: Option<String>,
    pub profile: ProfileState,
    status: BatchStatus,
    status_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Queue node the batch's jobs were posted to
    pub queue_path: Option<String>,
    pub inventory_path: Option<String>,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub jobs: BTreeMap<JobId, JobState>,
}

impl BatchState {
    pub fn new(batch_id: BatchId, profile: ProfileState) -> Self {
        Self {
            batch_id,
            label: None,
            profile,
            status: BatchStatus::Queued,
            status_message: None,
            submitted_at: Utc::now(),
            completed_at: None,
            queue_path: None,
            inventory_path: None,
            update: false,
            jobs: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Add a job, stamping it with this batch's ID
    pub fn add_job(&mut self, mut job: JobState) -> Result<(), StateError> {
        if self.jobs.contains_key(&job.job_id) {
            return Err(StateError::DuplicateJob(job.job_id));
        }
        job.batch_id = Some(self.batch_id.clone());
        self.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    /// Replace a job's state with a newer copy
    pub fn update_job(&mut self, job: JobState) -> Result<(), StateError> {
        match self.jobs.get_mut(&job.job_id) {
            Some(slot) => {
                *slot = job;
                Ok(())
            },
            None => Err(StateError::UnknownJob {
                batch: self.batch_id.clone(),
                job: job.job_id,
            }),
        }
    }

    pub fn status_counts(&self) -> BTreeMap<JobStatus, usize> {
        let mut counts = BTreeMap::new();
        for job in self.jobs.values() {
            *counts.entry(job.status).or_default() += 1;
        }
        counts
    }

    pub fn failed_jobs(&self) -> Vec<&JobId> {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed)
            .map(|j| &j.job_id)
            .collect()
    }

    /// Set the batch outcome from its jobs: failed if any job failed, with
    /// a message naming them
    pub fn conclude(&mut self) {
        let failed = self.failed_jobs();
        if failed.is_empty() {
            self.mark_completed(format!("{} job(s) completed", self.jobs.len()));
        } else {
            let names: Vec<_> = failed.iter().map(|id| id.as_str()).collect();
            let message = format!("{} of {} job(s) failed: {}", names.len(), self.jobs.len(), names.join(", "));
            self.mark_failed(message);
        }
    }

    pub fn mark_completed(&mut self, message: impl Into<String>) {
        if self.status != BatchStatus::Failed {
            self.status = BatchStatus::Completed;
            self.status_message = Some(message.into());
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        if self.status != BatchStatus::Failed {
            self.status = BatchStatus::Failed;
            self.status_message = Some(message.into());
            self.completed_at = Some(Utc::now());
        }
    }
}

/// Submission context handed to every handler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub profile_id: String,
    pub submitter: Option<String>,
    pub label: Option<String>,
    pub note: Option<String>,
    /// Working directory for the batch
    pub working_dir: PathBuf,
    #[serde(default)]
    pub update: bool,
    /// Overrides the profile's priority when set
    pub priority: Option<u8>,
}

impl IngestRequest {
    pub fn new(profile_id: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile_id: profile_id.into(),
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }
}

/// State object a handler chain runs against
pub trait PipelineState: Send {
    /// Which stages may run against this state
    const TARGET: StageTarget;

    /// Identifier used in logs and failure messages
    fn state_id(&self) -> String;

    fn record_success(&mut self, description: &str);

    fn record_failure(&mut self, message: &str);

    fn has_failed(&self) -> bool;

    fn extra_mut(&mut self) -> Option<&mut BTreeMap<String, String>> {
        None
    }
}

impl PipelineState for JobState {
    const TARGET: StageTarget = StageTarget::Job;

    fn state_id(&self) -> String {
        self.job_id.to_string()
    }

    fn record_success(&mut self, description: &str) {
        self.mark_completed(description);
    }

    fn record_failure(&mut self, message: &str) {
        self.mark_failed(message);
    }

    fn has_failed(&self) -> bool {
        self.status == JobStatus::Failed
    }

    fn extra_mut(&mut self) -> Option<&mut BTreeMap<String, String>> {
        Some(&mut self.extra)
    }
}

impl PipelineState for BatchState {
    const TARGET: StageTarget = StageTarget::Batch;

    fn state_id(&self) -> String {
        self.batch_id.to_string()
    }

    // the batch outcome comes from its jobs (`conclude`), not from
    // individual batch handlers
    fn record_success(&mut self, _description: &str) {}

    fn record_failure(&mut self, message: &str) {
        self.mark_failed(message);
    }

    fn has_failed(&self) -> bool {
        self.status == BatchStatus::Failed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn demo_profile() -> ProfileState {
        ProfileState::parse(
            "ProfileID: demo\nStorageService: http://store.example.org:35121\nStorageNode: 7777\n",
        )
        .unwrap()
    }

    fn job(id: &str) -> JobState {
        JobState::new(id.parse().unwrap(), "demo")
    }

    #[test]
    fn test_job_first_failure_message_kept() {
        let mut job = job("jid-a");
        job.mark_completed("initialized");
        job.mark_failed("download: connection refused");
        job.mark_failed("record: skipped");
        job.mark_completed("notified");

        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.status_message(), Some("download: connection refused"));
    }

    #[test]
    fn test_resolve_only_from_failed() {
        let mut job = job("jid-a");
        assert!(matches!(job.resolve("ok"), Err(StateError::InvalidTransition { .. })));

        job.mark_failed("boom");
        job.resolve("fixed by operator").unwrap();
        assert_eq!(job.status(), JobStatus::Resolved);
        assert!(job.resolve("again").is_err());
    }

    #[test]
    fn test_resolved_job_ignores_later_outcomes() {
        let mut job = job("jid-a");
        job.mark_failed("boom");
        job.resolve("fixed by operator").unwrap();

        job.mark_failed("late handler failure");
        job.mark_completed("late handler success");
        assert_eq!(job.status(), JobStatus::Resolved);
        assert_eq!(job.status_message(), Some("fixed by operator"));
    }

    #[test]
    fn test_batch_rejects_duplicate_jobs() {
        let mut batch = BatchState::new("bid-001".parse().unwrap(), demo_profile());
        batch.add_job(job("jid-a")).unwrap();
        assert!(matches!(batch.add_job(job("jid-a")), Err(StateError::DuplicateJob(_))));
        let id: JobId = "jid-a".parse().unwrap();
        assert_eq!(batch.jobs[&id].batch_id, Some(batch.batch_id.clone()));
    }

    #[test]
    fn test_conclude_names_failed_jobs() {
        let mut batch = BatchState::new("bid-001".parse().unwrap(), demo_profile());
        let mut a = job("jid-a");
        a.mark_failed("bad digest");
        let mut b = job("jid-b");
        b.mark_completed("stored");
        batch.add_job(a).unwrap();
        batch.add_job(b).unwrap();

        batch.conclude();
        assert_eq!(batch.status(), BatchStatus::Failed);
        let message = batch.status_message().unwrap();
        assert!(message.contains("jid-a"));
        assert!(!message.contains("jid-b"));
    }

    #[test]
    fn test_snapshot_round_trip_preserves_counts() {
        let mut batch = BatchState::new("bid-001".parse().unwrap(), demo_profile());
        let mut a = job("jid-a");
        a.mark_failed("bad digest");
        batch.add_job(a).unwrap();
        batch.add_job(job("jid-b")).unwrap();

        let json = serde_json::to_string(&batch).unwrap();
        let restored: BatchState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.batch_id, batch.batch_id);
        assert_eq!(restored.status_counts(), batch.status_counts());
        assert_eq!(restored, batch);
    }
}
