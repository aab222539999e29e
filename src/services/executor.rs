use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::detection::ResultRecord;
use crate::models::job::{JobHandle, JobRequest, JobState};
use crate::services::kv::{KeyValueStore, KvError};
use crate::services::queue::{JobQueue, QueueError, QueuedJob};

/// The execution substrate the coordinator hands work to.
///
/// State is owned here; the coordinator only observes it.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn submit(&self, request: JobRequest) -> Result<Uuid, ExecutorError>;

    async fn poll_state(&self, job_id: Uuid) -> Result<JobState, ExecutorError>;

    /// Only valid once the job has succeeded.
    async fn get_result(&self, job_id: Uuid) -> Result<ResultRecord, ExecutorError>;

    /// Only valid once the job has failed.
    async fn get_error(&self, job_id: Uuid) -> Result<String, ExecutorError>;
}

/// Job records (`<prefix>:job:<id>`), kept for `ttl` after the last update.
#[derive(Clone)]
pub struct JobRecords {
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
    ttl: Duration,
}

impl JobRecords {
    pub fn new(kv: Arc<dyn KeyValueStore>, prefix: &str, ttl: Duration) -> Self {
        Self {
            kv,
            prefix: format!("{prefix}:job"),
            ttl,
        }
    }

    fn key(&self, job_id: Uuid) -> String {
        format!("{}:{}", self.prefix, job_id)
    }

    pub async fn load(&self, job_id: Uuid) -> Result<JobHandle, ExecutorError> {
        let key = self.key(job_id);
        let raw = self
            .kv
            .get(&key)
            .await?
            .ok_or(ExecutorError::UnknownJob(job_id))?;
        JobHandle::decode(&raw).map_err(|e| {
            ExecutorError::Store(KvError::Corrupt {
                key,
                reason: e.to_string(),
            })
        })
    }

    pub async fn save(&self, handle: &JobHandle) -> Result<(), ExecutorError> {
        let key = self.key(handle.job_id);
        let raw = handle.encode().map_err(|e| {
            ExecutorError::Store(KvError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })
        })?;
        self.kv.set(&key, &raw, self.ttl).await?;
        Ok(())
    }

    /// Record the start of another execution attempt.
    pub async fn mark_running(&self, job_id: Uuid) -> Result<JobHandle, ExecutorError> {
        let mut handle = self.load(job_id).await?;
        handle.state = JobState::Running;
        handle.attempts += 1;
        handle.updated_at = Utc::now();
        self.save(&handle).await?;
        Ok(handle)
    }

    pub async fn mark_succeeded(
        &self,
        job_id: Uuid,
        record: ResultRecord,
    ) -> Result<JobHandle, ExecutorError> {
        let mut handle = self.load(job_id).await?;
        handle.state = JobState::Succeeded;
        handle.result = Some(record);
        handle.error = None;
        handle.updated_at = Utc::now();
        self.save(&handle).await?;
        Ok(handle)
    }

    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<JobHandle, ExecutorError> {
        let mut handle = self.load(job_id).await?;
        handle.state = JobState::Failed;
        handle.result = None;
        handle.error = Some(error.to_string());
        handle.updated_at = Utc::now();
        self.save(&handle).await?;
        Ok(handle)
    }

    pub async fn result(&self, job_id: Uuid) -> Result<ResultRecord, ExecutorError> {
        let handle = self.load(job_id).await?;
        match (handle.state, handle.result) {
            (JobState::Succeeded, Some(record)) => Ok(record),
            (state, _) => Err(ExecutorError::NotSucceeded { job_id, state }),
        }
    }

    pub async fn error(&self, job_id: Uuid) -> Result<String, ExecutorError> {
        let handle = self.load(job_id).await?;
        match handle.state {
            JobState::Failed => Ok(handle
                .error
                .unwrap_or_else(|| "job failed without a reported error".to_string())),
            state => Err(ExecutorError::NotFailed { job_id, state }),
        }
    }
}

/// Executor backed by the Redis job queue; `bin/worker` drains it.
pub struct QueueJobExecutor {
    queue: JobQueue,
    records: JobRecords,
}

impl QueueJobExecutor {
    pub fn new(queue: JobQueue, records: JobRecords) -> Self {
        Self { queue, records }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn records(&self) -> &JobRecords {
        &self.records
    }
}

#[async_trait]
impl JobExecutor for QueueJobExecutor {
    async fn submit(&self, request: JobRequest) -> Result<Uuid, ExecutorError> {
        let job_id = Uuid::new_v4();
        let handle = JobHandle::pending(job_id, request);
        // The record must exist before a worker can pick the job up.
        self.records.save(&handle).await?;
        self.queue
            .enqueue(&QueuedJob {
                job_id,
                fingerprint: handle.fingerprint.clone(),
                input_key: handle.input_key.clone(),
                output_key: handle.output_key.clone(),
            })
            .await?;

        tracing::debug!(job_id = %job_id, fingerprint = %handle.fingerprint, "Job enqueued");
        Ok(job_id)
    }

    async fn poll_state(&self, job_id: Uuid) -> Result<JobState, ExecutorError> {
        Ok(self.records.load(job_id).await?.state)
    }

    async fn get_result(&self, job_id: Uuid) -> Result<ResultRecord, ExecutorError> {
        self.records.result(job_id).await
    }

    async fn get_error(&self, job_id: Uuid) -> Result<String, ExecutorError> {
        self.records.error(job_id).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("unknown job: {0}")]
    UnknownJob(Uuid),

    #[error("job {job_id} has no result in state {state}")]
    NotSucceeded { job_id: Uuid, state: JobState },

    #[error("job {job_id} has no error in state {state}")]
    NotFailed { job_id: Uuid, state: JobState },

    #[error("job store error: {0}")]
    Store(#[from] KvError),

    #[error("job queue error: {0}")]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::detection::Detection;
    use crate::services::fingerprint::Fingerprint;
    use crate::services::kv::MemoryKv;

    fn records() -> JobRecords {
        JobRecords::new(Arc::new(MemoryKv::new()), "t", Duration::from_secs(60))
    }

    async fn pending(records: &JobRecords) -> Uuid {
        let job_id = Uuid::new_v4();
        let handle = JobHandle::pending(
            job_id,
            JobRequest {
                fingerprint: Fingerprint::compute(b"imgA"),
                input_key: "uploads/a.jpg".to_string(),
                output_key: "results/a.jpg".to_string(),
            },
        );
        records.save(&handle).await.unwrap();
        job_id
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let records = records();
        let missing = Uuid::new_v4();
        assert!(matches!(
            records.load(missing).await,
            Err(ExecutorError::UnknownJob(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_success_transition() {
        let records = records();
        let job_id = pending(&records).await;

        assert!(matches!(
            records.result(job_id).await,
            Err(ExecutorError::NotSucceeded { state: JobState::Pending, .. })
        ));

        let running = records.mark_running(job_id).await.unwrap();
        assert_eq!(running.state, JobState::Running);
        assert_eq!(running.attempts, 1);

        let record = ResultRecord::new(
            "results/a.jpg",
            vec![Detection {
                class_id: 0,
                confidence: 0.91,
                bbox: [10.0, 10.0, 50.0, 50.0],
            }],
        );
        records.mark_succeeded(job_id, record.clone()).await.unwrap();
        assert_eq!(records.load(job_id).await.unwrap().state, JobState::Succeeded);
        assert_eq!(records.result(job_id).await.unwrap(), record);
        assert!(records.error(job_id).await.is_err());
    }

    #[tokio::test]
    async fn test_failure_transition() {
        let records = records();
        let job_id = pending(&records).await;
        records.mark_running(job_id).await.unwrap();
        records.mark_running(job_id).await.unwrap();
        let failed = records.mark_failed(job_id, "model crashed").await.unwrap();

        assert_eq!(failed.attempts, 2);
        assert_eq!(records.error(job_id).await.unwrap(), "model crashed");
        assert!(records.result(job_id).await.is_err());
    }
}
