use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::detection::{Detection, ResultRecord};
use crate::models::submission::{PollOutcome, SubmitOutcome};

/// Response after submitting an image for detection.
#[derive(Debug, Serialize, Deserialize)]
pub struct DetectResponse {
    pub fingerprint: String,
    pub status: String,
    pub cached: bool,
    pub inflight: bool,
    pub job_id: Option<Uuid>,
    pub message: String,
    pub result: Option<DetectionResult>,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub result: Option<DetectionResult>,
    pub error: Option<String>,
}

/// Finished detections as exposed to clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct DetectionResult {
    pub output_image_key: String,
    pub detections: Vec<Detection>,
}

impl From<ResultRecord> for DetectionResult {
    fn from(record: ResultRecord) -> Self {
        Self {
            output_image_key: record.artifact_key,
            detections: record.detections,
        }
    }
}

impl From<SubmitOutcome> for DetectResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        let (status, message) = if outcome.cached {
            ("succeeded", "Served from result cache")
        } else if outcome.inflight {
            ("pending", "Identical image already being processed")
        } else {
            ("pending", "Image submitted for detection")
        };

        Self {
            fingerprint: outcome.fingerprint.to_string(),
            status: status.to_string(),
            cached: outcome.cached,
            inflight: outcome.inflight,
            job_id: outcome.job_id,
            message: message.to_string(),
            result: outcome.result.map(DetectionResult::from),
        }
    }
}

impl From<PollOutcome> for JobStatusResponse {
    fn from(outcome: PollOutcome) -> Self {
        Self {
            job_id: outcome.job_id,
            status: outcome.state.to_string(),
            result: outcome.result.map(DetectionResult::from),
            error: outcome.error,
        }
    }
}
