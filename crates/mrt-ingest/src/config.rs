//! Configuration management
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `mrt-ingest.toml`, then `MRT_`-prefixed environment variables using
//! `__` between section and key (`MRT_COORDINATION__ENDPOINT`).

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::{DEFAULT_PRIORITY, MAX_PRIORITY};
use crate::tracker::TrackerSettings;

// ============================================================================
// Defaults
// ============================================================================

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "mrt-ingest.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MRT";

pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_QUEUE_PATH: &str = "/ingest";

pub const DEFAULT_LOCK_ROOT: &str = crate::lock::DEFAULT_LOCK_ROOT;

pub const DEFAULT_PROFILE_DIR: &str = "profiles";

pub const DEFAULT_BATCH_DIR: &str = "batches";

pub const DEFAULT_READY_POLL_INTERVAL_MS: u64 = 2_000;

pub const DEFAULT_READY_POLL_ATTEMPTS: u32 = 30;

pub const DEFAULT_RENDER_ATTEMPTS: u32 = 5;

pub const DEFAULT_RENDER_INTERVAL_MS: u64 = 1_000;

pub const DEFAULT_POST_WORKERS: usize = 4;

/// How long a submitter waits for the queue post before returning.
pub const DEFAULT_POST_WAIT_SECS: u64 = 60;

/// Ingest service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub coordination: CoordinationConfig,
    pub queue: QueueConfig,
    pub locks: LockConfig,
    pub profiles: ProfileConfig,
    pub batches: BatchConfig,
    pub tracker: TrackerConfig,
    pub submission: SubmissionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// `memory://<name>` or `file:///<dir>`; required
    pub endpoint: Option<String>,
    pub session_timeout_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub path: String,
    pub default_priority: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_QUEUE_PATH.to_string(),
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub root: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            root: DEFAULT_LOCK_ROOT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub dir: PathBuf,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_PROFILE_DIR),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Parent of every batch working directory
    pub dir: PathBuf,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_BATCH_DIR),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub ready_poll_interval_ms: u64,
    pub ready_poll_attempts: u32,
    pub render_attempts: u32,
    pub render_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ready_poll_interval_ms: DEFAULT_READY_POLL_INTERVAL_MS,
            ready_poll_attempts: DEFAULT_READY_POLL_ATTEMPTS,
            render_attempts: DEFAULT_RENDER_ATTEMPTS,
            render_interval_ms: DEFAULT_RENDER_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    pub post_workers: usize,
    pub post_wait_secs: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            post_workers: DEFAULT_POST_WORKERS,
            post_wait_secs: DEFAULT_POST_WAIT_SECS,
        }
    }
}

impl IngestConfig {
    /// Load from `mrt-ingest.toml` (if present) and the environment
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(None)
    }

    /// Load with an explicit config file, which must then exist
    pub fn load_from(file: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let file_source = match file {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings = config::Config::builder()
            .add_source(file_source)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration sources")?;

        let config: IngestConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.coordination.endpoint.as_deref() {
            None | Some("") => anyhow::bail!(
                "coordination.endpoint is required (set {}_COORDINATION__ENDPOINT)",
                ENV_PREFIX
            ),
            Some(_) => {},
        }

        if self.coordination.session_timeout_ms == 0 {
            anyhow::bail!("coordination.session_timeout_ms must be greater than 0");
        }

        for (name, path) in [("queue.path", &self.queue.path), ("locks.root", &self.locks.root)] {
            crate::coord::validate_path(path)
                .with_context(|| format!("{} must be an absolute node path, got {:?}", name, path))?;
        }

        if self.queue.default_priority > MAX_PRIORITY {
            anyhow::bail!(
                "queue.default_priority ({}) cannot be greater than {}",
                self.queue.default_priority,
                MAX_PRIORITY
            );
        }

        if self.tracker.ready_poll_attempts == 0 || self.tracker.render_attempts == 0 {
            anyhow::bail!("tracker attempt counts must be greater than 0");
        }

        if self.submission.post_workers == 0 {
            anyhow::bail!("submission.post_workers must be greater than 0");
        }

        Ok(())
    }

    /// The coordination endpoint; `validate` guarantees it is set
    pub fn endpoint(&self) -> anyhow::Result<&str> {
        self.coordination
            .endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .context("coordination.endpoint is not configured")
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.session_timeout_ms)
    }

    pub fn post_wait(&self) -> Duration {
        Duration::from_secs(self.submission.post_wait_secs)
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            ready_poll_interval: Duration::from_millis(self.tracker.ready_poll_interval_ms),
            ready_poll_attempts: self.tracker.ready_poll_attempts,
            render_attempts: self.tracker.render_attempts,
            render_interval: Duration::from_millis(self.tracker.render_interval_ms),
        }
    }

    /// Working directory for one batch
    pub fn batch_dir(&self, batch_id: &mrt_common::types::BatchId) -> PathBuf {
        self.batches.dir.join(batch_id.as_str())
    }
}
