//! Idempotent submission and result caching in front of the job executor.
//!
//! Per fingerprint the state is derived by probing, in this order:
//!
//! 1. the result cache: a live record is returned as-is;
//! 2. the inflight map: a live entry means another request already started
//!    the job, and its id is returned for polling;
//! 3. otherwise the content is unseen and a new job is submitted.
//!
//! No locks are held across calls. Every store write is a single-key atomic
//! operation and the protocol tolerates any one of them never happening:
//! entries carry TTLs, and finalize is idempotent.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::detection::ResultRecord;
use crate::models::job::{JobRequest, JobState};
use crate::models::submission::{FinalizeOutcome, PollOutcome, SubmitOutcome};
use crate::services::executor::{ExecutorError, JobExecutor};
use crate::services::fingerprint::Fingerprint;
use crate::services::kv::{KeyValueStore, KvError};
use crate::services::storage::{BlobStore, StorageError};
use crate::services::stores::{InflightTracker, JobIndex, ResultStore};

/// Content type recorded for uploads and artifacts.
pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

/// Key-space prefix and expiry policy for the coordinator's stores.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub key_prefix: String,
    /// Cache freshness for finished results.
    pub result_ttl: Duration,
    /// Must exceed the worst-case job duration including retries.
    pub inflight_ttl: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            key_prefix: "detect".to_string(),
            result_ttl: Duration::from_secs(86_400),
            inflight_ttl: Duration::from_secs(3_600),
        }
    }
}

pub struct SubmissionCoordinator {
    results: ResultStore,
    inflight: InflightTracker,
    index: JobIndex,
    blobs: Arc<dyn BlobStore>,
    executor: Arc<dyn JobExecutor>,
}

impl SubmissionCoordinator {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        blobs: Arc<dyn BlobStore>,
        executor: Arc<dyn JobExecutor>,
        settings: &CoordinatorSettings,
    ) -> Self {
        let prefix = settings.key_prefix.as_str();
        Self {
            results: ResultStore::new(kv.clone(), prefix, settings.result_ttl),
            inflight: InflightTracker::new(kv.clone(), prefix, settings.inflight_ttl),
            // The index lives exactly as long as the inflight entry it mirrors.
            index: JobIndex::new(kv, prefix, settings.inflight_ttl),
            blobs,
            executor,
        }
    }

    /// Return a cached result, join a running job, or start a new one.
    #[tracing::instrument(level = "debug", skip_all, fields(size = content.len()))]
    pub async fn submit_or_join(&self, content: &[u8]) -> Result<SubmitOutcome, CoordinatorError> {
        if content.is_empty() {
            return Err(CoordinatorError::EmptyInput);
        }

        let fingerprint = Fingerprint::compute(content);

        // The cache must be consulted first: a live result forbids new work.
        if let Some(record) = self.results.get(&fingerprint).await? {
            tracing::info!(fingerprint = %fingerprint, "Serving result from cache");
            metrics::counter!("detect_submissions_total", "outcome" => "cached").increment(1);
            return Ok(SubmitOutcome::cached(fingerprint, record));
        }

        if let Some(job_id) = self.inflight.get(&fingerprint).await? {
            tracing::info!(fingerprint = %fingerprint, job_id = %job_id, "Joining inflight job");
            metrics::counter!("detect_submissions_total", "outcome" => "joined").increment(1);
            return Ok(SubmitOutcome::joined(fingerprint, job_id));
        }

        let job_id = self.start_job(&fingerprint, content).await?;

        if self.track(&fingerprint, job_id).await? {
            tracing::info!(fingerprint = %fingerprint, job_id = %job_id, "Submitted new job");
            metrics::counter!("detect_submissions_total", "outcome" => "submitted").increment(1);
            return Ok(SubmitOutcome::accepted(fingerprint, job_id));
        }

        // Lost the race for the inflight slot. Our job still runs, harmlessly.
        metrics::counter!("detect_submissions_total", "outcome" => "race_lost").increment(1);
        self.resolve_lost_race(fingerprint, job_id).await
    }

    /// Upload under a fresh random key, then hand the job to the executor.
    async fn start_job(&self, fingerprint: &Fingerprint, content: &[u8]) -> Result<Uuid, CoordinatorError> {
        let submission_id = Uuid::new_v4();
        let input_key = format!("uploads/{submission_id}.jpg");
        let output_key = format!("results/{submission_id}.jpg");

        self.blobs.put(&input_key, content, IMAGE_CONTENT_TYPE).await?;

        let job_id = self
            .executor
            .submit(JobRequest {
                fingerprint: fingerprint.clone(),
                input_key,
                output_key,
            })
            .await?;
        Ok(job_id)
    }

    /// Write the index entry, then try to claim the inflight slot.
    ///
    /// Index first means every live inflight entry already has its index
    /// entry. A lost claim withdraws the index entry again.
    async fn track(&self, fingerprint: &Fingerprint, job_id: Uuid) -> Result<bool, CoordinatorError> {
        self.index.record(job_id, fingerprint).await?;

        match self.inflight.claim(fingerprint, job_id).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.forget_index(job_id).await;
                Ok(false)
            }
            Err(e) => {
                self.forget_index(job_id).await;
                Err(e.into())
            }
        }
    }

    async fn resolve_lost_race(
        &self,
        fingerprint: Fingerprint,
        own_job: Uuid,
    ) -> Result<SubmitOutcome, CoordinatorError> {
        if let Some(winner) = self.inflight.get(&fingerprint).await? {
            tracing::info!(
                fingerprint = %fingerprint,
                job_id = %winner,
                discarded_job_id = %own_job,
                "Lost inflight race, joining winner"
            );
            return Ok(SubmitOutcome::joined(fingerprint, winner));
        }

        // The winner finalized between our claim and the re-read.
        if let Some(record) = self.results.get(&fingerprint).await? {
            return Ok(SubmitOutcome::cached(fingerprint, record));
        }

        // The winner failed and was cleared. One more claim, for our own job.
        if self.track(&fingerprint, own_job).await? {
            return Ok(SubmitOutcome::accepted(fingerprint, own_job));
        }
        match self.inflight.get(&fingerprint).await? {
            Some(winner) => Ok(SubmitOutcome::joined(fingerprint, winner)),
            None => {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    job_id = %own_job,
                    "Inflight slot keeps changing hands, returning untracked job"
                );
                Ok(SubmitOutcome::accepted(fingerprint, own_job))
            }
        }
    }

    /// Observe a job and, once it has finished, finalize it.
    ///
    /// Pending and running jobs are reported as-is. Failure is a state, not
    /// an error.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn finalize_on_poll(&self, job_id: Uuid) -> Result<PollOutcome, CoordinatorError> {
        match self.executor.poll_state(job_id).await? {
            state @ (JobState::Pending | JobState::Running) => {
                Ok(PollOutcome::in_progress(job_id, state))
            }
            JobState::Succeeded => {
                let record = self.executor.get_result(job_id).await?;
                self.finalize_success(job_id, &record).await?;
                Ok(PollOutcome::succeeded(job_id, record))
            }
            JobState::Failed => {
                let error = self.executor.get_error(job_id).await?;
                self.finalize_failure(job_id).await;
                Ok(PollOutcome::failed(job_id, error))
            }
        }
    }

    /// Cache a successful result and clear the job's bookkeeping.
    ///
    /// Idempotent: a second call finds no index entry and writes nothing.
    pub async fn finalize_success(
        &self,
        job_id: Uuid,
        record: &ResultRecord,
    ) -> Result<FinalizeOutcome, CoordinatorError> {
        let Some(fingerprint) = self.index.get(job_id).await? else {
            tracing::warn!(job_id = %job_id, "No index entry for finished job, result not cached");
            metrics::counter!("detect_stale_index_total").increment(1);
            return Ok(FinalizeOutcome::StaleIndex);
        };

        self.results.put(&fingerprint, record).await?;
        self.clear_bookkeeping(&fingerprint, job_id).await;

        tracing::info!(
            job_id = %job_id,
            fingerprint = %fingerprint,
            detections = record.detections.len(),
            "Result cached"
        );
        Ok(FinalizeOutcome::Cached)
    }

    /// Clear a failed job's bookkeeping so the next submission starts fresh.
    ///
    /// Best-effort: store errors are logged and TTLs reclaim the rest.
    pub async fn finalize_failure(&self, job_id: Uuid) -> FinalizeOutcome {
        let fingerprint = match self.index.get(job_id).await {
            Ok(Some(fingerprint)) => fingerprint,
            Ok(None) => return FinalizeOutcome::StaleIndex,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Index lookup failed for failed job");
                return FinalizeOutcome::StaleIndex;
            }
        };

        self.clear_bookkeeping(&fingerprint, job_id).await;
        tracing::info!(job_id = %job_id, fingerprint = %fingerprint, "Failed job cleared");
        FinalizeOutcome::Cleared
    }

    async fn clear_bookkeeping(&self, fingerprint: &Fingerprint, job_id: Uuid) {
        // Only release the slot while it still names this job; after a TTL
        // expiry it may belong to a newer submission.
        if let Err(e) = self.inflight.release(fingerprint, job_id).await {
            tracing::warn!(job_id = %job_id, fingerprint = %fingerprint, error = %e, "Failed to release inflight entry");
        }
        self.forget_index(job_id).await;
    }

    async fn forget_index(&self, job_id: Uuid) {
        if let Err(e) = self.index.remove(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to remove job index entry");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("submitted content is empty")]
    EmptyInput,

    #[error("key-value store unavailable: {0}")]
    StoreUnavailable(KvError),

    /// A stored value could not be encoded or decoded.
    #[error("stored value codec failure: {0}")]
    Codec(KvError),

    #[error("blob storage failure: {0}")]
    BlobStore(#[from] StorageError),

    #[error("unknown job: {0}")]
    UnknownJob(Uuid),

    #[error("job executor error: {0}")]
    Executor(ExecutorError),
}

impl From<KvError> for CoordinatorError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Corrupt { .. } => CoordinatorError::Codec(err),
            other => CoordinatorError::StoreUnavailable(other),
        }
    }
}

impl From<ExecutorError> for CoordinatorError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::UnknownJob(job_id) => CoordinatorError::UnknownJob(job_id),
            ExecutorError::Store(e) => e.into(),
            other => CoordinatorError::Executor(other),
        }
    }
}

impl CoordinatorError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::StoreUnavailable(e) => e.is_transient(),
            CoordinatorError::BlobStore(e) => e.is_transient(),
            CoordinatorError::Executor(ExecutorError::Queue(e)) => e.is_transient(),
            _ => false,
        }
    }
}
