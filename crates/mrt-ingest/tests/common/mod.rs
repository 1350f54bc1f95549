//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use mrt_ingest::handler::{Handler, HandlerKind, HandlerResult};
use mrt_ingest::profile::ProfileState;
use mrt_ingest::state::{IngestRequest, PipelineState};
use std::sync::{Arc, Mutex};

pub const PROFILE_HEADER: &str = "\
ProfileID: demo
StorageService: http://store.example.org:35121
StorageNode: 7777
";

/// Names of invoked handlers, in call order
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn profile(chains: &str) -> ProfileState {
    ProfileState::parse(&format!("{}{}", PROFILE_HEADER, chains)).unwrap()
}

/// Handler that appends its name to a log and then succeeds or fails
pub struct Recorder {
    pub name: &'static str,
    pub kind: HandlerKind,
    pub succeed: bool,
    pub log: CallLog,
}

impl Recorder {
    pub fn ok(name: &'static str, log: &CallLog) -> Self {
        Self {
            name,
            kind: HandlerKind::Standard,
            succeed: true,
            log: Arc::clone(log),
        }
    }

    pub fn failing(name: &'static str, log: &CallLog) -> Self {
        Self {
            succeed: false,
            ..Self::ok(name, log)
        }
    }

    pub fn terminal(name: &'static str, kind: HandlerKind, log: &CallLog) -> Self {
        Self {
            kind,
            ..Self::ok(name, log)
        }
    }
}

#[async_trait]
impl<S: PipelineState + 'static> Handler<S> for Recorder {
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
        _state: &mut S,
    ) -> anyhow::Result<HandlerResult> {
        self.log.lock().unwrap().push(self.name.to_string());
        if self.succeed {
            Ok(HandlerResult::success(format!("{} done", self.name)))
        } else {
            Ok(HandlerResult::failure("scripted failure"))
        }
    }
}
