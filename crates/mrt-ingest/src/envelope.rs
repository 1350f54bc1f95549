//! Queue payload for one job

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::state::JobState;
use mrt_common::types::{BatchId, JobId};
use mrt_common::Result;

/// Everything a consumer needs to run a queued job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub profile_id: String,
    /// Batch working directory holding the snapshot
    pub batch_dir: PathBuf,
    pub priority: u8,
    pub job: JobState,
}

impl JobEnvelope {
    pub fn new(batch_id: BatchId, batch_dir: PathBuf, job: JobState) -> Self {
        Self {
            job_id: job.job_id.clone(),
            batch_id,
            profile_id: job.profile_id.clone(),
            batch_dir,
            priority: job.priority,
            job,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_carries_job_identity() {
        let job = JobState::new("jid-a".parse().unwrap(), "demo");
        let envelope = JobEnvelope::new("bid-001".parse().unwrap(), PathBuf::from("/tmp/bid-001"), job);

        let decoded = JobEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.job_id.as_str(), "jid-a");
        assert_eq!(decoded.profile_id, "demo");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        assert!(JobEnvelope::from_bytes(b"not json").is_err());
    }
}
