use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::detection::Detection;

/// Output of one inference run: detections plus the annotated image.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub detections: Vec<Detection>,
    pub artifact: Vec<u8>,
}

/// Black-box object detector: image bytes in, detections and artifact out.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, image: &[u8]) -> Result<InferenceOutput, InferenceError>;
}

/// Client for an HTTP model-serving endpoint (`POST {endpoint}/predict`).
pub struct HttpDetector {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct PredictRequest {
    image: String,
}

#[derive(Deserialize)]
struct PredictResponse {
    detections: Vec<Detection>,
    /// Base64-encoded annotated image.
    annotated_image: String,
}

impl HttpDetector {
    pub fn new(
        endpoint: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(InferenceError::Http)?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, image: &[u8]) -> Result<InferenceOutput, InferenceError> {
        let url = format!("{}/predict", self.endpoint);
        let body = PredictRequest {
            image: base64::engine::general_purpose::STANDARD.encode(image),
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(InferenceError::Http)?;
        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Status(status.as_u16()));
        }

        let predict: PredictResponse = response.json().await.map_err(InferenceError::Http)?;
        let artifact = base64::engine::general_purpose::STANDARD
            .decode(predict.annotated_image)
            .map_err(|e| InferenceError::Artifact(e.to_string()))?;

        Ok(InferenceOutput {
            detections: normalize(predict.detections),
            artifact,
        })
    }
}

/// Round confidences to 4 decimals and box coordinates to 2, and clamp
/// confidence into `[0, 1]`.
pub fn normalize(detections: Vec<Detection>) -> Vec<Detection> {
    detections
        .into_iter()
        .map(|d| Detection {
            class_id: d.class_id,
            confidence: round_to(d.confidence.clamp(0.0, 1.0), 4),
            bbox: d.bbox.map(|c| round_to(c, 2)),
        })
        .collect()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("inference endpoint returned HTTP {0}")]
    Status(u16),

    #[error("annotated image is not valid base64: {0}")]
    Artifact(String),
}

impl InferenceError {
    /// Timeouts, dropped connections, throttling and 5xx replies may succeed
    /// on another attempt. Rejected input and malformed replies will not.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Http(e) => !(e.is_decode() || e.is_builder()),
            InferenceError::Status(status) => matches!(status, 408 | 429) || *status >= 500,
            InferenceError::Artifact(_) => false,
        }
    }
}
