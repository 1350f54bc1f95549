//! Merritt Ingest Core
//!
//! Job and batch orchestration for a preservation ingest service: a
//! priority-ordered distributed queue and freeze/lock registry on top of a
//! hierarchical coordination namespace, profile-driven handler pipelines
//! with error-skip semantics, and crash-recoverable batch completion
//! tracking.
//!
//! # Modules
//!
//! - [`coord`]: coordination sessions (in-memory and directory backends)
//! - [`queue`]: sequential-node work queue with hold, requeue and cleanup
//! - [`lock`]: global and per-collection freeze flags, named mutexes
//! - [`profile`]: profile files and their handler chains
//! - [`state`]: job and batch state
//! - [`handler`] / [`executor`]: handler registry and stage executor
//! - [`tracker`]: batch readiness, completion counting, snapshots
//! - [`manager`]: submission and consumption
//!
//! # Example
//!
//! ```no_run
//! use mrt_ingest::config::IngestConfig;
//! use mrt_ingest::handler::Handlers;
//! use mrt_ingest::manager::IngestManager;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let manager = IngestManager::from_config(&config, Handlers::with_builtins())?;
//!     while let Some(processed) = manager.process_next().await? {
//!         println!("{} -> {}", processed.job.job_id, processed.job.status());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coord;
pub mod envelope;
pub mod executor;
pub mod handler;
pub mod lock;
pub mod manager;
pub mod profile;
pub mod queue;
pub mod state;
pub mod tracker;
