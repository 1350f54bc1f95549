//! Merritt Ingest Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the ingest workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Custom error types and result types
//! - **Logging**: Centralized `tracing` subscriber setup
//! - **Types**: Local identifiers for jobs and batches
//!
//! # Example
//!
//! ```no_run
//! use mrt_common::types::{BatchId, JobId};
//!
//! let batch = BatchId::generate();
//! let job = JobId::generate();
//! assert!(batch.as_str().starts_with("bid-"));
//! assert!(job.as_str().starts_with("jid-"));
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{MrtError, Result};
