//! Submission and consumption through the ingest manager

mod common;

use async_trait::async_trait;
use common::{call_log, calls, Recorder, PROFILE_HEADER};
use mrt_common::types::JobId;
use mrt_ingest::coord::MemoryCoordination;
use mrt_ingest::handler::{Handler, HandlerResult, Handlers};
use mrt_ingest::manager::{IngestManager, ManagerOptions, PostState, SubmitError};
use mrt_ingest::profile::ProfileState;
use mrt_ingest::queue::{ItemStatus, QueueError};
use mrt_ingest::state::{BatchStatus, IngestRequest, JobState, JobStatus};
use mrt_ingest::tracker::{TrackerError, TrackerSettings, SNAPSHOT_FILE};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails any job whose package is named "corrupt.zip"
struct StoreHandler;

#[async_trait]
impl Handler<JobState> for StoreHandler {
    fn name(&self) -> &str {
        "h-store"
    }

    async fn handle(
        &self,
        _profile: &ProfileState,
        _request: &IngestRequest,
        job: &mut JobState,
    ) -> anyhow::Result<HandlerResult> {
        match job.package_name.as_deref() {
            Some("corrupt.zip") => anyhow::bail!("package checksum mismatch"),
            _ => Ok(HandlerResult::success("stored")),
        }
    }
}

/// Fails its first call and succeeds on every later one
struct FlakyHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler<JobState> for FlakyHandler {
    fn name(&self) -> &str {
        "h-flaky"
    }

    async fn handle(
        &self,
        _profile: &ProfileState,
        _request: &IngestRequest,
        _job: &mut JobState,
    ) -> anyhow::Result<HandlerResult> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("storage node unavailable");
        }
        Ok(HandlerResult::success("stored"))
    }
}

/// Queue-post handler that puts a directory where the snapshot's temporary
/// file goes, so the batch can never be marked ready
struct BlockSnapshot;

#[async_trait]
impl Handler<JobState> for BlockSnapshot {
    fn name(&self) -> &str {
        "h-block-snapshot"
    }

    async fn handle(
        &self,
        _profile: &ProfileState,
        request: &IngestRequest,
        _job: &mut JobState,
    ) -> anyhow::Result<HandlerResult> {
        std::fs::create_dir_all(request.working_dir.join(format!(".{}.tmp", SNAPSHOT_FILE)))?;
        Ok(HandlerResult::success("queued"))
    }
}

fn manager(root: &Path) -> IngestManager {
    let mut handlers = Handlers::with_builtins();
    handlers.job.register("h-store", || Box::new(StoreHandler));
    manager_with(
        root,
        "HandlerInitialize.1: handler-initialize\n\
         HandlerProcess.1: h-store\n\
         HandlerNotify.1: handler-notify\n\
         HandlerBatchReport.1: handler-batch-notify\n",
        handlers,
    )
}

fn manager_with(root: &Path, chains: &str, handlers: Handlers) -> IngestManager {
    let profiles = root.join("profiles");
    std::fs::create_dir_all(&profiles).unwrap();
    std::fs::write(profiles.join("demo"), format!("{}{}", PROFILE_HEADER, chains)).unwrap();

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
    IngestManager::new(Arc::new(MemoryCoordination::default()), options, handlers).unwrap()
}

fn job(id: &str, package: &str) -> JobState {
    let mut job = JobState::new(id.parse().unwrap(), "demo");
    job.package_name = Some(package.to_string());
    job
}

#[tokio::test]
async fn test_frozen_queue_rejects_then_thaw_accepts() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path());

    assert!(manager.locks().freeze().await.unwrap());
    let err = manager
        .submit_job(IngestRequest::new("demo", ""), job("jid-a", "a.zip"))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Frozen));
    assert!(manager.queue().summary().await.unwrap().is_empty());
    assert!(manager.tracker().tracked_batches().is_empty());

    assert!(manager.locks().thaw().await.unwrap());
    let submission = manager
        .submit_job(IngestRequest::new("demo", ""), job("jid-a", "a.zip"))
        .await
        .unwrap();
    assert!(matches!(submission.post, PostState::Complete(_)));
    assert_eq!(manager.queue().summary().await.unwrap().get(&ItemStatus::Pending), Some(&1));
}

#[tokio::test]
async fn test_batch_with_one_bad_job_fails_naming_it() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path());

    let submission = manager
        .submit_batch(
            IngestRequest::new("demo", ""),
            vec![job("jid-a", "corrupt.zip"), job("jid-b", "fine.zip")],
        )
        .await
        .unwrap();

    // same priority, so jid-a is consumed first
    let first = manager.process_next().await.unwrap().unwrap();
    assert_eq!(first.job.job_id.as_str(), "jid-a");
    assert_eq!(first.job.status(), JobStatus::Failed);
    assert!(first.job.status_message().unwrap().starts_with("h-store: "));
    assert!(first.concluded.is_none());
    assert_eq!(manager.queue().item(&first.item_id).await.unwrap().status, ItemStatus::Failed);

    let second = manager.process_next().await.unwrap().unwrap();
    assert_eq!(second.job.status(), JobStatus::Completed);
    let batch = second.concluded.unwrap();
    assert_eq!(batch.status(), BatchStatus::Failed);
    assert_eq!(batch.status_message(), Some("1 of 2 job(s) failed: jid-a"));
    assert!(!manager.tracker().is_tracked(&submission.batch_id));

    let view = manager.batch_status(&submission.batch_id).await.unwrap();
    assert!(!view.partial);
    assert_eq!(view.batch.status(), BatchStatus::Failed);

    let job_id: JobId = "jid-a".parse().unwrap();
    let resolved = manager
        .resolve_job(&submission.batch_id, &job_id, "re-deposited by curator")
        .await
        .unwrap();
    assert_eq!(resolved.status(), JobStatus::Resolved);
}

#[tokio::test]
async fn test_consumer_recovers_batch_after_manager_restart() {
    let root = tempfile::tempdir().unwrap();
    let coord = Arc::new(MemoryCoordination::default());
    let build = |coord: Arc<MemoryCoordination>| {
        let profiles = root.path().join("profiles");
        std::fs::create_dir_all(&profiles).unwrap();
        std::fs::write(
            profiles.join("demo"),
            format!("{}HandlerNotify.1: handler-notify\n", PROFILE_HEADER),
        )
        .unwrap();
        let options = ManagerOptions {
            queue_path: "/ingest".to_string(),
            lock_root: "/ingest.lock".to_string(),
            profile_dir: profiles,
            batch_dir: root.path().join("batches"),
            post_workers: 1,
            post_wait: Duration::from_secs(5),
            tracker: TrackerSettings {
                ready_poll_interval: Duration::from_millis(5),
                ready_poll_attempts: 20,
                render_attempts: 2,
                render_interval: Duration::from_millis(5),
            },
        };
        IngestManager::new(coord, options, Handlers::with_builtins()).unwrap()
    };

    let submitter = build(Arc::clone(&coord));
    let submission = submitter
        .submit_batch(
            IngestRequest::new("demo", ""),
            vec![job("jid-a", "a.zip"), job("jid-b", "b.zip")],
        )
        .await
        .unwrap();

    // a fresh process shares the queue but not the in-memory tracker
    let consumer = build(coord);
    assert!(!consumer.tracker().is_tracked(&submission.batch_id));
    let first = consumer.process_next().await.unwrap().unwrap();
    assert!(first.concluded.is_none());
    assert!(consumer.tracker().is_tracked(&submission.batch_id));
    let second = consumer.process_next().await.unwrap().unwrap();
    assert_eq!(second.concluded.unwrap().status(), BatchStatus::Completed);
}

#[tokio::test]
async fn test_requeued_job_of_concluded_batch_reruns() {
    let root = tempfile::tempdir().unwrap();
    let log = call_log();
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut handlers = Handlers::with_builtins();
    let flaky = Arc::clone(&attempts);
    handlers.job.register("h-flaky", move || {
        Box::new(FlakyHandler {
            calls: Arc::clone(&flaky),
        })
    });
    let report_log = Arc::clone(&log);
    handlers
        .batch
        .register("h-report", move || Box::new(Recorder::ok("h-report", &report_log)));
    let manager = manager_with(
        root.path(),
        "HandlerProcess.1: h-flaky\nHandlerBatchReport.1: h-report\n",
        handlers,
    );

    let submission = manager
        .submit_job(IngestRequest::new("demo", ""), job("jid-a", "a.zip"))
        .await
        .unwrap();
    let first = manager.process_next().await.unwrap().unwrap();
    assert_eq!(first.job.status(), JobStatus::Failed);
    assert_eq!(first.concluded.unwrap().status(), BatchStatus::Failed);
    assert_eq!(manager.queue().item(&first.item_id).await.unwrap().status, ItemStatus::Failed);

    manager.queue().requeue_from_fail(&first.item_id).await.unwrap();
    let rerun = manager.process_next().await.unwrap().unwrap();
    assert_eq!(rerun.item_id, first.item_id);
    assert_eq!(rerun.job.status(), JobStatus::Completed);
    assert!(rerun.concluded.is_none());
    assert_eq!(manager.queue().item(&rerun.item_id).await.unwrap().status, ItemStatus::Completed);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // batch-report ran once, for the original conclusion
    assert_eq!(calls(&log), vec!["h-report"]);
    assert!(!manager.tracker().is_tracked(&submission.batch_id));
    let view = manager.batch_status(&submission.batch_id).await.unwrap();
    let job_id: JobId = "jid-a".parse().unwrap();
    assert_eq!(view.batch.jobs[&job_id].status(), JobStatus::Completed);
    assert_eq!(view.batch.status(), BatchStatus::Failed);
}

#[tokio::test]
async fn test_out_of_range_priority_rejected_before_tracking() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path());

    let mut request = IngestRequest::new("demo", "");
    request.priority = Some(150);
    let err = manager.submit_job(request, job("jid-a", "a.zip")).await.unwrap_err();
    assert!(matches!(err, SubmitError::Queue(QueueError::InvalidPriority(150))));
    assert!(manager.tracker().tracked_batches().is_empty());
    assert!(manager.queue().summary().await.unwrap().is_empty());
    let written = std::fs::read_dir(root.path().join("batches"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(written, 0);
}

#[tokio::test]
async fn test_failed_post_withdraws_queued_jobs() {
    let root = tempfile::tempdir().unwrap();
    let mut handlers = Handlers::with_builtins();
    handlers.job.register("h-block-snapshot", || Box::new(BlockSnapshot));
    let manager = manager_with(root.path(), "HandlerQueue.1: h-block-snapshot\n", handlers);

    let err = manager
        .submit_batch(
            IngestRequest::new("demo", ""),
            vec![job("jid-a", "a.zip"), job("jid-b", "b.zip")],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Tracker(TrackerError::Io { .. })));
    assert!(manager.tracker().tracked_batches().is_empty());

    let summary = manager.queue().summary().await.unwrap();
    assert_eq!(summary.get(&ItemStatus::Deleted), Some(&2));
    assert_eq!(summary.get(&ItemStatus::Pending), None);
    assert!(manager.process_next().await.unwrap().is_none());
}
