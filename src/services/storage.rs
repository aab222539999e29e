use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Probe key for health checks; a 404 still proves the bucket is reachable.
const HEALTH_PROBE_KEY: &str = ".health";

/// Write-once blob storage for uploaded images and generated artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn health_check(&self) -> Result<(), StorageError>;
}

/// Jitter applied to every retry delay; a sleep can reach `(1 + factor)` times
/// the nominal interval.
pub const RETRY_RANDOMIZATION_FACTOR: f64 = 0.5;

/// Timeout and retry policy for blob operations.
#[derive(Debug, Clone)]
pub struct BlobPolicy {
    /// Upper bound for a single request attempt.
    pub request_timeout: Duration,
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Cap on the nominal delay between attempts.
    pub max_backoff: Duration,
}

impl Default for BlobPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl BlobPolicy {
    /// Longest a single `put` or `get` can take: every attempt running into
    /// the timeout, with the longest jittered sleep between attempts.
    pub fn worst_case_duration(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let mut total = self.request_timeout * attempts;
        let mut interval = self.initial_backoff;
        for _ in 1..attempts {
            total += interval
                .min(self.max_backoff)
                .mul_f64(1.0 + RETRY_RANDOMIZATION_FACTOR);
            interval = interval.saturating_mul(2);
        }
        total
    }
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
    policy: BlobPolicy,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        policy: BlobPolicy,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket, policy })
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.policy.initial_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(RETRY_RANDOMIZATION_FACTOR)
            .with_max_interval(self.policy.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `op` with a per-attempt timeout, retrying transient failures up to
    /// `max_attempts` times.
    async fn with_retry<T, F, Fut>(&self, what: &str, key: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let timeout = self.policy.request_timeout;
        let mut attempt = 0u32;

        retry_notify(
            self.backoff(),
            || {
                attempt += 1;
                let current = attempt;
                let fut = op();
                async move {
                    let outcome = match tokio::time::timeout(timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(StorageError::Timeout(timeout)),
                    };
                    outcome.map_err(|e| {
                        if e.is_transient() && current < max_attempts {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: StorageError, delay: Duration| {
                tracing::warn!(
                    operation = what,
                    key = key,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Blob operation failed, retrying"
                );
            },
        )
        .await
    }
}

#[async_trait]
impl BlobStore for R2Client {
    /// Upload bytes to R2.
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.with_retry("put", key, || async move {
            let response = self
                .bucket
                .put_object_with_content_type(key, data, content_type)
                .await
                .map_err(StorageError::S3)?;
            check_status(key, response.status_code())
        })
        .await
    }

    /// Download bytes from R2.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.with_retry("get", key, || async move {
            let response = self.bucket.get_object(key).await.map_err(StorageError::S3)?;
            check_status(key, response.status_code())?;
            Ok(response.to_vec())
        })
        .await
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let timeout = self.policy.request_timeout;
        let (_, status) = tokio::time::timeout(timeout, self.bucket.head_object(HEALTH_PROBE_KEY))
            .await
            .map_err(|_| StorageError::Timeout(timeout))?
            .map_err(StorageError::S3)?;
        if status >= 500 {
            return Err(StorageError::Status {
                key: HEALTH_PROBE_KEY.to_string(),
                status,
            });
        }
        Ok(())
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        status => Err(StorageError::Status {
            key: key.to_string(),
            status,
        }),
    }
}

/// In-process blob store for tests and local runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
    fail_writes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail with a transient error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                key: key.to_string(),
                status: 503,
            });
        }
        self.objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .get(key)
            .map(|o| o.value().clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("object {key} request returned HTTP {status}")]
    Status { key: String, status: u16 },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("blob operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Network faults, timeouts, throttling and 5xx replies are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::S3(_) | StorageError::Timeout(_) => true,
            StorageError::Status { status, .. } => *status == 429 || *status >= 500,
            StorageError::NotFound(_) | StorageError::Config(_) => false,
        }
    }
}
