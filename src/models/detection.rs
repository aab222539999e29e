use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

/// A single detected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Detection {
    #[garde(skip)]
    pub class_id: u32,

    /// Model confidence in `[0, 1]`. Inference backends report this as `conf`.
    #[serde(alias = "conf")]
    #[garde(custom(unit_interval))]
    pub confidence: f64,

    /// `[x1, y1, x2, y2]` in pixel coordinates.
    #[garde(custom(finite_box))]
    pub bbox: [f64; 4],
}

/// Finished analysis for one fingerprint, as held in the result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ResultRecord {
    /// Blob storage key of the annotated output image.
    #[garde(length(min = 1, max = 1024))]
    pub artifact_key: String,

    #[garde(dive)]
    pub detections: Vec<Detection>,

    #[garde(skip)]
    pub created_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn new(artifact_key: impl Into<String>, detections: Vec<Detection>) -> Self {
        Self {
            artifact_key: artifact_key.into(),
            detections,
            created_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, RecordError> {
        serde_json::to_string(self).map_err(RecordError::Json)
    }

    /// Decode and schema-check a stored record.
    pub fn decode(raw: &str) -> Result<Self, RecordError> {
        let record: Self = serde_json::from_str(raw).map_err(RecordError::Json)?;
        record
            .validate()
            .map_err(|e| RecordError::Invalid(e.to_string()))?;
        Ok(record)
    }
}

fn unit_interval(value: &f64, _ctx: &()) -> garde::Result {
    if (0.0..=1.0).contains(value) {
        Ok(())
    } else {
        Err(garde::Error::new("confidence must lie in [0, 1]"))
    }
}

fn finite_box(value: &[f64; 4], _ctx: &()) -> garde::Result {
    if value.iter().all(|c| c.is_finite()) {
        Ok(())
    } else {
        Err(garde::Error::new("bounding box coordinates must be finite"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record failed validation: {0}")]
    Invalid(String),
}
