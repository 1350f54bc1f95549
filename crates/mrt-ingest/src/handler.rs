//! Pipeline handlers and the name registry
//!
//! Profiles name handlers by string. Names are mapped to factories in a
//! [`HandlerRegistry`] populated at startup; a profile naming a handler
//! that is not registered fails when its stage is built.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::profile::ProfileState;
use crate::state::{BatchState, IngestRequest, JobState, PipelineState};

pub const HANDLER_INITIALIZE: &str = "handler-initialize";
pub const HANDLER_NOTIFY: &str = "handler-notify";
pub const HANDLER_BATCH_NOTIFY: &str = "handler-batch-notify";
pub const HANDLER_CALLBACK: &str = "handler-callback";

/// Extra-field keys written by the built-in handlers
pub const EXTRA_JOB_DIR: &str = "job-dir";
pub const EXTRA_CALLBACK_URL: &str = "callback-url";
pub const EXTRA_CALLBACK_OUTCOME: &str = "callback-outcome";

/// Role of a handler in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Standard,
    /// Informs people of the outcome
    Notification,
    /// Informs a downstream system of the outcome
    Callback,
}

impl HandlerKind {
    /// Terminal handlers run even after an earlier handler failed
    pub fn is_terminal(self) -> bool {
        matches!(self, HandlerKind::Notification | HandlerKind::Callback)
    }
}

/// What a handler reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResult {
    pub success: bool,
    pub description: String,
}

impl HandlerResult {
    pub fn success(description: impl Into<String>) -> Self {
        Self {
            success: true,
            description: description.into(),
        }
    }

    pub fn failure(description: impl Into<String>) -> Self {
        Self {
            success: false,
            description: description.into(),
        }
    }
}

/// One processing step. Implementations may mutate `state` in place.
#[async_trait]
pub trait Handler<S: PipelineState + 'static>: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> HandlerKind {
        HandlerKind::Standard
    }

    async fn handle(
        &self,
        profile: &ProfileState,
        request: &IngestRequest,
        state: &mut S,
    ) -> anyhow::Result<HandlerResult>;
}

/// Builds a fresh handler instance
pub type HandlerFactory<S> = Arc<dyn Fn() -> Box<dyn Handler<S>> + Send + Sync>;

/// Handler name to factory mapping for one state type
pub struct HandlerRegistry<S: PipelineState + 'static> {
    factories: HashMap<String, HandlerFactory<S>>,
}

impl<S: PipelineState + 'static> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory, replacing any previous one under the same name
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Handler<S>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Box<dyn Handler<S>>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl<S: PipelineState + 'static> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PipelineState + 'static> fmt::Debug for HandlerRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("handlers", &self.names()).finish()
    }
}

/// Job and batch registries together
#[derive(Debug, Default)]
pub struct Handlers {
    pub job: HandlerRegistry<JobState>,
    pub batch: HandlerRegistry<BatchState>,
}

impl Handlers {
    /// Registries holding the built-in handlers
    pub fn with_builtins() -> Self {
        let mut handlers = Self::default();
        handlers
            .job
            .register(HANDLER_INITIALIZE, || Box::new(InitializeHandler))
            .register(HANDLER_NOTIFY, || Box::new(NotifyHandler::new(HANDLER_NOTIFY)))
            .register(HANDLER_CALLBACK, || Box::new(CallbackHandler));
        handlers
            .batch
            .register(HANDLER_BATCH_NOTIFY, || Box::new(NotifyHandler::new(HANDLER_BATCH_NOTIFY)))
            .register(HANDLER_CALLBACK, || Box::new(CallbackHandler));
        handlers
    }
}

/// Creates the job's working directory under the request's working dir
pub struct InitializeHandler;

#[async_trait]
impl Handler<JobState> for InitializeHandler {
    fn name(&self) -> &str {
        HANDLER_INITIALIZE
    }

    async fn handle(
        &self,
        _profile: &ProfileState,
        request: &IngestRequest,
        job: &mut JobState,
    ) -> anyhow::Result<HandlerResult> {
        let dir = request.working_dir.join(job.job_id.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        job.extra.insert(EXTRA_JOB_DIR.to_string(), dir.display().to_string());
        Ok(HandlerResult::success(format!("initialized {}", dir.display())))
    }
}

/// Emits the outcome as a structured event for the notification adapter
pub struct NotifyHandler {
    name: &'static str,
}

impl NotifyHandler {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl<S: PipelineState + 'static> Handler<S> for NotifyHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Notification
    }

    async fn handle(
        &self,
        profile: &ProfileState,
        request: &IngestRequest,
        state: &mut S,
    ) -> anyhow::Result<HandlerResult> {
        let outcome = if state.has_failed() { "failed" } else { "succeeded" };
        info!(
            id = %state.state_id(),
            profile = %profile.profile_id,
            submitter = request.submitter.as_deref().unwrap_or("-"),
            outcome,
            contacts = ?profile.notification_contacts,
            "Ingest notification"
        );
        Ok(HandlerResult::success(format!(
            "{} notification sent to {} contact(s)",
            outcome,
            profile.notification_contacts.len()
        )))
    }
}

/// Records the outcome for the external callback adapter
pub struct CallbackHandler;

#[async_trait]
impl<S: PipelineState + 'static> Handler<S> for CallbackHandler {
    fn name(&self) -> &str {
        HANDLER_CALLBACK
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Callback
    }

    async fn handle(
        &self,
        profile: &ProfileState,
        _request: &IngestRequest,
        state: &mut S,
    ) -> anyhow::Result<HandlerResult> {
        let Some(url) = profile.callback_url.as_ref() else {
            return Ok(HandlerResult::success("no callback configured"));
        };
        let outcome = if state.has_failed() { "failed" } else { "succeeded" };
        let id = state.state_id();
        if let Some(extra) = state.extra_mut() {
            extra.insert(EXTRA_CALLBACK_URL.to_string(), url.to_string());
            extra.insert(EXTRA_CALLBACK_OUTCOME.to_string(), outcome.to_string());
        }
        info!(id = %id, callback = %url, outcome, "Callback recorded");
        Ok(HandlerResult::success(format!("callback {} recorded", outcome)))
    }
}
