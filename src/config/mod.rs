use serde::Deserialize;
use std::time::Duration;

use crate::services::coordinator::CoordinatorSettings;
use crate::services::storage::BlobPolicy;

/// Jitter on the worker's job retry delays.
pub const JOB_RETRY_RANDOMIZATION_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the stores and the job queue
    pub redis_url: String,

    /// Namespace prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Base URL of the model-serving endpoint
    pub inference_url: String,

    /// Bearer token for the model-serving endpoint
    #[serde(default)]
    pub inference_api_token: Option<String>,

    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    /// How long finished results stay cached
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,

    /// Safety net for orphaned inflight entries
    #[serde(default = "default_inflight_ttl_secs")]
    pub inflight_ttl_secs: u64,

    /// How long job records stay pollable
    #[serde(default = "default_job_record_ttl_secs")]
    pub job_record_ttl_secs: u64,

    /// Bound on a single key-value round-trip
    #[serde(default = "default_kv_timeout_ms")]
    pub kv_timeout_ms: u64,

    /// Bound on a single blob request attempt in the worker
    #[serde(default = "default_blob_timeout_secs")]
    pub blob_timeout_secs: u64,

    #[serde(default = "default_blob_max_attempts")]
    pub blob_max_attempts: u32,

    /// Bound on a single upload attempt while a request is waiting
    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,

    #[serde(default = "default_upload_max_attempts")]
    pub upload_max_attempts: u32,

    /// Retries after the first failed attempt of a job
    #[serde(default = "default_job_max_retries")]
    pub job_max_retries: u32,

    #[serde(default = "default_job_retry_initial_ms")]
    pub job_retry_initial_ms: u64,

    #[serde(default = "default_job_retry_max_delay_secs")]
    pub job_retry_max_delay_secs: u64,

    /// Worker sleep between empty queue polls
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_key_prefix() -> String {
    "detect".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    60
}

fn default_result_ttl_secs() -> u64 {
    86_400
}

fn default_inflight_ttl_secs() -> u64 {
    3_600
}

fn default_job_record_ttl_secs() -> u64 {
    86_400
}

fn default_kv_timeout_ms() -> u64 {
    2_000
}

fn default_blob_timeout_secs() -> u64 {
    60
}

fn default_blob_max_attempts() -> u32 {
    5
}

fn default_upload_timeout_ms() -> u64 {
    3_000
}

fn default_upload_max_attempts() -> u32 {
    2
}

fn default_job_max_retries() -> u32 {
    3
}

fn default_job_retry_initial_ms() -> u64 {
    1_000
}

fn default_job_retry_max_delay_secs() -> u64 {
    60
}

fn default_worker_poll_interval_ms() -> u64 {
    1_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would let an inflight entry expire while its job
    /// can still legitimately be running.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Invalid("KEY_PREFIX must not be empty".to_string()));
        }
        if self.result_ttl_secs == 0 {
            return Err(ConfigError::Invalid("RESULT_TTL_SECS must be positive".to_string()));
        }
        let worst_case = self.worst_case_job_duration();
        if self.inflight_ttl() <= worst_case {
            return Err(ConfigError::Invalid(format!(
                "INFLIGHT_TTL_SECS ({}s) must exceed the worst-case job duration ({}s)",
                self.inflight_ttl_secs,
                worst_case.as_secs()
            )));
        }
        Ok(())
    }

    /// Every attempt running into the inference timeout with both blob
    /// transfers spending their whole retry budget, plus the longest jittered
    /// delay between attempts.
    pub fn worst_case_job_duration(&self) -> Duration {
        let attempts = self.job_max_retries + 1;
        let per_attempt = self.inference_timeout() + self.blob_policy().worst_case_duration() * 2;
        let longest_delay = self
            .job_retry_max_delay()
            .mul_f64(1.0 + JOB_RETRY_RANDOMIZATION_FACTOR);
        per_attempt * attempts + longest_delay * self.job_max_retries
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn inflight_ttl(&self) -> Duration {
        Duration::from_secs(self.inflight_ttl_secs)
    }

    pub fn job_record_ttl(&self) -> Duration {
        Duration::from_secs(self.job_record_ttl_secs)
    }

    pub fn kv_timeout(&self) -> Duration {
        Duration::from_millis(self.kv_timeout_ms)
    }

    pub fn job_retry_initial(&self) -> Duration {
        Duration::from_millis(self.job_retry_initial_ms)
    }

    pub fn job_retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.job_retry_max_delay_secs)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            key_prefix: self.key_prefix.clone(),
            result_ttl: Duration::from_secs(self.result_ttl_secs),
            inflight_ttl: self.inflight_ttl(),
        }
    }

    /// Worker-side transfers: long attempts, generous retries.
    pub fn blob_policy(&self) -> BlobPolicy {
        BlobPolicy {
            request_timeout: Duration::from_secs(self.blob_timeout_secs),
            max_attempts: self.blob_max_attempts,
            ..BlobPolicy::default()
        }
    }

    /// Uploads on the submission path, where a client is waiting.
    pub fn upload_policy(&self) -> BlobPolicy {
        BlobPolicy {
            request_timeout: Duration::from_millis(self.upload_timeout_ms),
            max_attempts: self.upload_max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Vec<(String, String)> {
        [
            ("REDIS_URL", "redis://localhost:6379/0"),
            ("R2_BUCKET", "detections"),
            ("R2_ACCESS_KEY", "key"),
            ("R2_SECRET_KEY", "secret"),
            ("R2_ENDPOINT", "https://example.r2.cloudflarestorage.com"),
            ("INFERENCE_URL", "http://localhost:8000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn with(overrides: &[(&str, &str)]) -> AppConfig {
        let mut vars = required();
        vars.extend(overrides.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        envy::from_iter(vars).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = with(&[]);
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.key_prefix, "detect");
        assert_eq!(config.result_ttl_secs, 86_400);
        assert_eq!(config.inflight_ttl_secs, 3_600);
        assert_eq!(config.job_max_retries, 3);
        assert_eq!(config.blob_max_attempts, 5);
        assert!(config.inference_api_token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worst_case_duration() {
        let config = with(&[]);
        // Blob transfer: 5 * 60s + (0.2 + 0.4 + 0.8 + 1.6)s * 1.5 = 304.5s.
        // Job: 4 * (60 + 2 * 304.5)s + 3 * 60s * 1.5 = 2946s.
        let worst = config.worst_case_job_duration();
        assert!(worst > Duration::from_millis(2_945_900), "{worst:?}");
        assert!(worst < Duration::from_millis(2_946_100), "{worst:?}");
    }

    #[test]
    fn test_rejects_inflight_ttl_below_retry_budget() {
        for ttl in ["900", "901", "2910", "2946"] {
            let config = with(&[("INFLIGHT_TTL_SECS", ttl)]);
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "accepted INFLIGHT_TTL_SECS={ttl}"
            );
        }
        assert!(with(&[("INFLIGHT_TTL_SECS", "2947")]).validate().is_ok());
    }

    #[test]
    fn test_upload_policy_is_short() {
        let config = with(&[]);
        let upload = config.upload_policy();
        assert_eq!(upload.request_timeout, Duration::from_secs(3));
        assert_eq!(upload.max_attempts, 2);
        assert!(upload.worst_case_duration() < Duration::from_secs(7));
        assert!(config.blob_policy().worst_case_duration() > Duration::from_secs(300));
    }

    #[test]
    fn test_rejects_empty_prefix() {
        let config = with(&[("KEY_PREFIX", "")]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_required_variable() {
        let vars: Vec<(String, String)> = required()
            .into_iter()
            .filter(|(k, _)| k != "REDIS_URL")
            .collect();
        assert!(envy::from_iter::<_, AppConfig>(vars).is_err());
    }

    #[test]
    fn test_settings_projection() {
        let config = with(&[("RESULT_TTL_SECS", "120"), ("BLOB_TIMEOUT_SECS", "5")]);
        assert_eq!(config.coordinator_settings().result_ttl, Duration::from_secs(120));
        assert_eq!(config.blob_policy().request_timeout, Duration::from_secs(5));
    }
}
