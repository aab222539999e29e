use serde::Serialize;
use uuid::Uuid;

use crate::models::detection::ResultRecord;
use crate::models::job::JobState;
use crate::services::fingerprint::Fingerprint;

/// Result of `submit_or_join`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub fingerprint: Fingerprint,
    /// Served straight from the result cache.
    pub cached: bool,
    /// Attached to a job another request already started.
    pub inflight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRecord>,
}

impl SubmitOutcome {
    pub fn cached(fingerprint: Fingerprint, record: ResultRecord) -> Self {
        Self {
            fingerprint,
            cached: true,
            inflight: false,
            job_id: None,
            result: Some(record),
        }
    }

    pub fn joined(fingerprint: Fingerprint, job_id: Uuid) -> Self {
        Self {
            fingerprint,
            cached: false,
            inflight: true,
            job_id: Some(job_id),
            result: None,
        }
    }

    pub fn accepted(fingerprint: Fingerprint, job_id: Uuid) -> Self {
        Self {
            fingerprint,
            cached: false,
            inflight: false,
            job_id: Some(job_id),
            result: None,
        }
    }
}

/// Result of `finalize_on_poll`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollOutcome {
    pub job_id: Uuid,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PollOutcome {
    pub fn in_progress(job_id: Uuid, state: JobState) -> Self {
        Self {
            job_id,
            state,
            result: None,
            error: None,
        }
    }

    pub fn succeeded(job_id: Uuid, record: ResultRecord) -> Self {
        Self {
            job_id,
            state: JobState::Succeeded,
            result: Some(record),
            error: None,
        }
    }

    pub fn failed(job_id: Uuid, error: String) -> Self {
        Self {
            job_id,
            state: JobState::Failed,
            result: None,
            error: Some(error),
        }
    }
}

/// How a finalize attempt touched the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Result written under its fingerprint and bookkeeping cleared.
    Cached,
    /// Failure observed and bookkeeping cleared; nothing cached.
    Cleared,
    /// No index entry for the job; nothing written.
    StaleIndex,
}
