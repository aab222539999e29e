use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::detection::{RecordError, ResultRecord};
use crate::services::fingerprint::Fingerprint;

/// Lifecycle of a detection job as reported by the executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// What the coordinator hands to the executor for a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub fingerprint: Fingerprint,
    /// Blob key holding the uploaded image.
    pub input_key: String,
    /// Blob key the annotated artifact will be written to.
    pub output_key: String,
}

/// Executor-owned record of a job. The coordinator only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct JobHandle {
    #[garde(skip)]
    pub job_id: Uuid,
    #[garde(skip)]
    pub fingerprint: Fingerprint,
    #[garde(skip)]
    pub state: JobState,
    #[garde(length(min = 1))]
    pub input_key: String,
    #[garde(length(min = 1))]
    pub output_key: String,
    #[garde(skip)]
    pub attempts: u32,
    #[garde(dive)]
    pub result: Option<ResultRecord>,
    #[garde(skip)]
    pub error: Option<String>,
    #[garde(skip)]
    pub submitted_at: DateTime<Utc>,
    #[garde(skip)]
    pub updated_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn pending(job_id: Uuid, request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            fingerprint: request.fingerprint,
            state: JobState::Pending,
            input_key: request.input_key,
            output_key: request.output_key,
            attempts: 0,
            result: None,
            error: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn encode(&self) -> Result<String, RecordError> {
        serde_json::to_string(self).map_err(RecordError::Json)
    }

    pub fn decode(raw: &str) -> Result<Self, RecordError> {
        let handle: Self = serde_json::from_str(raw).map_err(RecordError::Json)?;
        handle
            .validate()
            .map_err(|e| RecordError::Invalid(e.to_string()))?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_state_names() {
        assert_eq!(JobState::Succeeded.to_string(), "succeeded");
        assert_eq!(JobState::from_str("running").unwrap(), JobState::Running);
        assert_eq!(
            serde_json::to_string(&JobState::Pending).unwrap(),
            "\"pending\""
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn test_handle_decode_rejects_bad_fingerprint() {
        let handle = JobHandle::pending(
            Uuid::new_v4(),
            JobRequest {
                fingerprint: Fingerprint::compute(b"imgA"),
                input_key: "uploads/a.jpg".to_string(),
                output_key: "results/a.jpg".to_string(),
            },
        );
        let raw = handle.encode().unwrap();
        assert_eq!(JobHandle::decode(&raw).unwrap(), handle);

        let tampered = raw.replace(handle.fingerprint.as_str(), "deadbeef");
        assert!(JobHandle::decode(&tampered).is_err());
    }
}
