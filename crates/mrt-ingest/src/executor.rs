//! Handler pipeline executor
//!
//! Runs one stage's handler chain against a job or batch. The executor is
//! `Running` until a handler fails (returns a failure result, errors, or
//! panics); from then on it is in `ErrorSkip` and only terminal handlers
//! (notification, callback) still run. Handler errors never escape a
//! stage: they become the failure status of the state object.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::handler::{Handler, HandlerRegistry};
use crate::profile::{ProfileState, Stage, StageTarget};
use crate::state::{IngestRequest, JobState, PipelineState};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Profile {profile} stage {stage} names unknown handler {name:?} at sequence {sequence}")]
    UnresolvedHandler {
        profile: String,
        stage: Stage,
        sequence: u32,
        name: String,
    },

    #[error("Stage {stage} runs against a {expected:?}, not a {actual:?}")]
    WrongTarget {
        stage: Stage,
        expected: StageTarget,
        actual: StageTarget,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorMode {
    Running,
    ErrorSkip,
    Done,
}

/// What happened during one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub mode: ExecutorMode,
    /// Whether the stage ended in error-skip mode
    pub failed: bool,
    pub invoked: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct PipelineExecutor<S: PipelineState + 'static> {
    registry: Arc<HandlerRegistry<S>>,
}

impl<S: PipelineState + 'static> Clone for PipelineExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<S: PipelineState + 'static> PipelineExecutor<S> {
    pub fn new(registry: Arc<HandlerRegistry<S>>) -> Self {
        Self { registry }
    }

    /// Resolve every handler of a stage, in sequence order
    fn build(&self, profile: &ProfileState, stage: Stage) -> Result<Vec<Box<dyn Handler<S>>>, PipelineError> {
        if stage.target() != S::TARGET {
            return Err(PipelineError::WrongTarget {
                stage,
                expected: stage.target(),
                actual: S::TARGET,
            });
        }
        profile
            .chain(stage)
            .into_iter()
            .map(|(sequence, name)| {
                self.registry.resolve(&name).ok_or(PipelineError::UnresolvedHandler {
                    profile: profile.profile_id.clone(),
                    stage,
                    sequence,
                    name,
                })
            })
            .collect()
    }

    /// Check that every handler of the given stages resolves
    pub fn validate(&self, profile: &ProfileState, stages: &[Stage]) -> Result<(), PipelineError> {
        for stage in stages {
            self.build(profile, *stage)?;
        }
        Ok(())
    }

    /// Run a stage from the start
    pub async fn run_stage(
        &self,
        profile: &ProfileState,
        stage: Stage,
        request: &IngestRequest,
        state: &mut S,
    ) -> Result<StageReport, PipelineError> {
        self.run_stage_from(profile, stage, request, state, ExecutorMode::Running).await
    }

    /// Run a stage starting in `mode`. Starting in `ErrorSkip` runs only the
    /// stage's terminal handlers.
    #[instrument(skip_all, fields(stage = %stage, id = %state.state_id()))]
    pub async fn run_stage_from(
        &self,
        profile: &ProfileState,
        stage: Stage,
        request: &IngestRequest,
        state: &mut S,
        start: ExecutorMode,
    ) -> Result<StageReport, PipelineError> {
        let handlers = self.build(profile, stage)?;
        let mut mode = match start {
            ExecutorMode::ErrorSkip => ExecutorMode::ErrorSkip,
            _ => ExecutorMode::Running,
        };
        let mut invoked = Vec::new();
        let mut skipped = Vec::new();

        for handler in handlers {
            let name = handler.name().to_string();
            if mode == ExecutorMode::ErrorSkip && !handler.kind().is_terminal() {
                debug!(handler = %name, "Skipping handler after failure");
                skipped.push(name);
                continue;
            }

            let outcome = AssertUnwindSafe(handler.handle(profile, request, state))
                .catch_unwind()
                .await;
            invoked.push(name.clone());

            match outcome {
                Ok(Ok(result)) if result.success => {
                    debug!(handler = %name, description = %result.description, "Handler succeeded");
                    if mode == ExecutorMode::Running {
                        state.record_success(&result.description);
                    }
                },
                Ok(Ok(result)) => {
                    warn!(handler = %name, description = %result.description, "Handler reported failure");
                    state.record_failure(&format!("{}: {}", name, result.description));
                    mode = ExecutorMode::ErrorSkip;
                },
                Ok(Err(e)) => {
                    warn!(handler = %name, error = %format!("{:#}", e), "Handler raised an error");
                    state.record_failure(&format!("{}: {:#}", name, e));
                    mode = ExecutorMode::ErrorSkip;
                },
                Err(_) => {
                    warn!(handler = %name, "Handler panicked");
                    state.record_failure(&format!("{}: handler panicked", name));
                    mode = ExecutorMode::ErrorSkip;
                },
            }
        }

        let failed = mode == ExecutorMode::ErrorSkip;
        info!(invoked = invoked.len(), skipped = skipped.len(), failed, "Stage finished");
        Ok(StageReport {
            stage,
            mode: ExecutorMode::Done,
            failed,
            invoked,
            skipped,
        })
    }
}

impl PipelineExecutor<JobState> {
    /// Run a consumed job through its pipeline: the `ingest` chain when the
    /// profile defines one, otherwise the staged sequence from
    /// `initialize` to `notify`. After a failing stage, later stages only
    /// run their terminal handlers.
    pub async fn run_job(
        &self,
        profile: &ProfileState,
        request: &IngestRequest,
        job: &mut JobState,
    ) -> Result<Vec<StageReport>, PipelineError> {
        let stages: &[Stage] = if profile.has_chain(Stage::Ingest) {
            &[Stage::Ingest]
        } else {
            &Stage::JOB_SEQUENCE
        };
        self.validate(profile, stages)?;

        let mut reports = Vec::with_capacity(stages.len());
        let mut mode = ExecutorMode::Running;
        for stage in stages {
            let report = self.run_stage_from(profile, *stage, request, job, mode).await?;
            if report.failed {
                mode = ExecutorMode::ErrorSkip;
            }
            reports.push(report);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerKind, HandlerResult};
    use crate::state::tests::demo_profile;
    use crate::state::{BatchState, JobStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Error,
        Panic,
    }

    struct Scripted {
        name: &'static str,
        kind: HandlerKind,
        behaviour: Behaviour,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Handler<JobState> for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> HandlerKind {
            self.kind
        }

        async fn handle(
            &self,
            _profile: &ProfileState,
            _request: &IngestRequest,
            _job: &mut JobState,
        ) -> anyhow::Result<HandlerResult> {
            self.calls.lock().unwrap().push(self.name);
            match self.behaviour {
                Behaviour::Succeed => Ok(HandlerResult::success("ok")),
                Behaviour::Fail => Ok(HandlerResult::failure("checksum mismatch")),
                Behaviour::Error => anyhow::bail!("storage unreachable"),
                Behaviour::Panic => panic!("handler bug"),
            }
        }
    }

    fn setup(
        handlers: &[(&'static str, HandlerKind, Behaviour)],
    ) -> (PipelineExecutor<JobState>, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        for (name, kind, behaviour) in handlers.iter().copied() {
            let calls = Arc::clone(&calls);
            registry.register(name, move || {
                Box::new(Scripted {
                    name,
                    kind,
                    behaviour,
                    calls: Arc::clone(&calls),
                })
            });
        }
        (PipelineExecutor::new(Arc::new(registry)), calls)
    }

    fn profile_with(stage: Stage, names: &[&str]) -> ProfileState {
        let mut profile = demo_profile();
        let chain = names.iter().enumerate().map(|(i, n)| (i as u32 + 1, n.to_string())).collect();
        profile.handlers.insert(stage, chain);
        profile
    }

    fn job() -> JobState {
        JobState::new("jid-a".parse().unwrap(), "demo")
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let (executor, calls) = setup(&[
            ("one", HandlerKind::Standard, Behaviour::Succeed),
            ("two", HandlerKind::Standard, Behaviour::Succeed),
        ]);
        let profile = profile_with(Stage::Ingest, &["one", "two"]);
        let mut job = job();

        let report = executor
            .run_stage(&profile, Stage::Ingest, &IngestRequest::default(), &mut job)
            .await
            .unwrap();
        assert!(!report.failed);
        assert_eq!(report.mode, ExecutorMode::Done);
        assert_eq!(*calls.lock().unwrap(), vec!["one", "two"]);
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_failure_skips_standard_but_runs_terminal() {
        let (executor, calls) = setup(&[
            ("download", HandlerKind::Standard, Behaviour::Succeed),
            ("verify", HandlerKind::Standard, Behaviour::Fail),
            ("record", HandlerKind::Standard, Behaviour::Succeed),
            ("notify", HandlerKind::Notification, Behaviour::Succeed),
            ("callback", HandlerKind::Callback, Behaviour::Succeed),
        ]);
        let profile = profile_with(Stage::Ingest, &["download", "verify", "record", "notify", "callback"]);
        let mut job = job();

        let report = executor
            .run_stage(&profile, Stage::Ingest, &IngestRequest::default(), &mut job)
            .await
            .unwrap();
        assert!(report.failed);
        assert_eq!(report.skipped, vec!["record"]);
        assert_eq!(*calls.lock().unwrap(), vec!["download", "verify", "notify", "callback"]);
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.status_message(), Some("verify: checksum mismatch"));
    }

    #[tokio::test]
    async fn test_errors_and_panics_become_failures() {
        for behaviour in [Behaviour::Error, Behaviour::Panic] {
            let (executor, calls) = setup(&[
                ("boom", HandlerKind::Standard, behaviour),
                ("after", HandlerKind::Standard, Behaviour::Succeed),
                ("notify", HandlerKind::Notification, Behaviour::Succeed),
            ]);
            let profile = profile_with(Stage::Ingest, &["boom", "after", "notify"]);
            let mut job = job();

            let report = executor
                .run_stage(&profile, Stage::Ingest, &IngestRequest::default(), &mut job)
                .await
                .unwrap();
            assert!(report.failed);
            assert_eq!(*calls.lock().unwrap(), vec!["boom", "notify"]);
            assert!(job.status_message().unwrap().starts_with("boom: "));
        }
    }

    #[tokio::test]
    async fn test_unresolvable_handler_is_fatal_before_any_runs() {
        let (executor, calls) = setup(&[("one", HandlerKind::Standard, Behaviour::Succeed)]);
        let profile = profile_with(Stage::Ingest, &["one", "handler-missing"]);
        let mut job = job();

        let err = executor
            .run_stage(&profile, Stage::Ingest, &IngestRequest::default(), &mut job)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnresolvedHandler { sequence: 2, .. }));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(job.status(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_batch_stage_rejected_for_job_state() {
        let (executor, _) = setup(&[]);
        let err = executor
            .run_stage(&demo_profile(), Stage::BatchReport, &IngestRequest::default(), &mut job())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::WrongTarget { .. }));
    }

    #[tokio::test]
    async fn test_staged_sequence_after_failure() {
        let (executor, calls) = setup(&[
            ("init", HandlerKind::Standard, Behaviour::Succeed),
            ("fetch", HandlerKind::Standard, Behaviour::Fail),
            ("store", HandlerKind::Standard, Behaviour::Succeed),
            ("notify", HandlerKind::Notification, Behaviour::Succeed),
        ]);
        let mut profile = profile_with(Stage::Initialize, &["init"]);
        profile.handlers.insert(Stage::Download, [(1, "fetch".to_string())].into());
        profile.handlers.insert(Stage::Record, [(1, "store".to_string())].into());
        profile.handlers.insert(Stage::Notify, [(1, "notify".to_string())].into());
        let mut job = job();

        let reports = executor.run_job(&profile, &IngestRequest::default(), &mut job).await.unwrap();
        assert_eq!(reports.len(), Stage::JOB_SEQUENCE.len());
        assert_eq!(*calls.lock().unwrap(), vec!["init", "fetch", "notify"]);
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.status_message(), Some("fetch: checksum mismatch"));
    }

    #[tokio::test]
    async fn test_ingest_chain_takes_precedence() {
        let (executor, calls) = setup(&[
            ("whole", HandlerKind::Standard, Behaviour::Succeed),
            ("init", HandlerKind::Standard, Behaviour::Succeed),
        ]);
        let mut profile = profile_with(Stage::Ingest, &["whole"]);
        profile.handlers.insert(Stage::Initialize, [(1, "init".to_string())].into());

        let reports = executor.run_job(&profile, &IngestRequest::default(), &mut job()).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(*calls.lock().unwrap(), vec!["whole"]);
    }

    #[tokio::test]
    async fn test_batch_success_leaves_status_to_conclusion() {
        let executor: PipelineExecutor<BatchState> = PipelineExecutor::new(Arc::new(HandlerRegistry::new()));
        let mut batch = BatchState::new("bid-001".parse().unwrap(), demo_profile());
        let report = executor
            .run_stage(&demo_profile(), Stage::BatchProcess, &IngestRequest::default(), &mut batch)
            .await
            .unwrap();
        assert!(!report.failed);
        assert!(!batch.status().is_terminal());
    }
}
