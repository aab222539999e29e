use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::services::fingerprint::Fingerprint;

/// Job payload serialized into Redis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub fingerprint: Fingerprint,
    pub input_key: String,
    pub output_key: String,
}

/// Redis-backed async job queue.
///
/// Dequeued payloads move to a processing list until completed so a crashed
/// worker leaves evidence behind.
pub struct JobQueue {
    client: redis::Client,
    queue_key: String,
    processing_key: String,
    op_timeout: Duration,
}

/// Run one Redis round-trip, giving up after `timeout`.
async fn bounded<T, F>(timeout: Duration, op: F) -> Result<T, QueueError>
where
    F: Future<Output = Result<T, redis::RedisError>>,
{
    tokio::time::timeout(timeout, op)
        .await
        .map_err(|_| QueueError::Timeout(timeout))?
        .map_err(QueueError::Redis)
}

impl JobQueue {
    pub fn new(redis_url: &str, prefix: &str, op_timeout: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            queue_key: format!("{prefix}:jobs"),
            processing_key: format!("{prefix}:processing"),
            op_timeout,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        bounded(self.op_timeout, self.client.get_multiplexed_async_connection()).await
    }

    /// Enqueue a detection job.
    pub async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        let mut conn = self.connection().await?;
        bounded(self.op_timeout, conn.lpush::<_, _, ()>(&self.queue_key, &payload)).await
    }

    /// Dequeue a job for processing (pop with move to processing list).
    pub async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.connection().await?;
        let result: Option<String> = bounded(
            self.op_timeout,
            conn.rpoplpush(&self.queue_key, &self.processing_key),
        )
        .await?;

        match result {
            Some(payload) => {
                let job: QueuedJob = serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Get the current queue depth (pending jobs).
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        bounded(self.op_timeout, conn.llen(&self.queue_key)).await
    }

    /// Mark a job as complete (remove from processing list).
    pub async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        let mut conn = self.connection().await?;
        bounded(
            self.op_timeout,
            conn.lrem::<_, _, ()>(&self.processing_key, 1, &payload),
        )
        .await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("queue operation timed out after {0:?}")]
    Timeout(Duration),
}

impl QueueError {
    /// Connection faults and timeouts may clear up; a bad payload will not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, QueueError::Serialize(_))
    }
}
