use backoff::future::retry_notify;
use backoff::ExponentialBackoffBuilder;
use detect_dedup::{
    config::{AppConfig, JOB_RETRY_RANDOMIZATION_FACTOR},
    models::detection::ResultRecord,
    services::{
        coordinator::{SubmissionCoordinator, IMAGE_CONTENT_TYPE},
        executor::{ExecutorError, JobRecords, QueueJobExecutor},
        inference::{Detector, HttpDetector, InferenceError},
        kv::{KeyValueStore, RedisKv},
        queue::{JobQueue, QueuedJob},
        storage::{BlobStore, R2Client, StorageError},
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

/// Why a single job attempt failed.
#[derive(Debug, thiserror::Error)]
enum JobError {
    #[error("input download failed: {0}")]
    Download(StorageError),

    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("artifact upload failed: {0}")]
    Upload(StorageError),

    #[error("job record update failed: {0}")]
    Record(#[from] ExecutorError),
}

impl JobError {
    /// Only failures another attempt could fix are worth a retry.
    fn is_transient(&self) -> bool {
        match self {
            JobError::Download(e) | JobError::Upload(e) => e.is_transient(),
            JobError::Inference(e) => e.is_transient(),
            JobError::Record(_) => false,
        }
    }
}

struct Worker {
    executor: Arc<QueueJobExecutor>,
    coordinator: SubmissionCoordinator,
    storage: Arc<dyn BlobStore>,
    detector: HttpDetector,
    max_retries: u32,
    retry_initial: Duration,
    retry_max_delay: Duration,
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting detection worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize services
    tracing::info!("Initializing services");
    let kv: Arc<dyn KeyValueStore> = Arc::new(
        RedisKv::new(&config.redis_url, config.kv_timeout()).expect("Failed to initialize Redis store"),
    );

    let storage: Arc<dyn BlobStore> = Arc::new(
        R2Client::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
            config.blob_policy(),
        )
        .expect("Failed to initialize R2 client"),
    );

    let queue = JobQueue::new(&config.redis_url, &config.key_prefix, config.kv_timeout())
        .expect("Failed to initialize job queue");
    let executor = Arc::new(QueueJobExecutor::new(
        queue,
        JobRecords::new(kv.clone(), &config.key_prefix, config.job_record_ttl()),
    ));

    // Completion callback: the worker finalizes jobs itself, so a result is
    // cached even when no client ever polls for it.
    let coordinator = SubmissionCoordinator::new(
        kv,
        storage.clone(),
        executor.clone(),
        &config.coordinator_settings(),
    );

    let detector = HttpDetector::new(
        &config.inference_url,
        config.inference_api_token.clone(),
        config.inference_timeout(),
    )
    .expect("Failed to initialize inference client");

    let worker = Worker {
        executor,
        coordinator,
        storage,
        detector,
        max_retries: config.job_max_retries,
        retry_initial: config.job_retry_initial(),
        retry_max_delay: config.job_retry_max_delay(),
    };

    tracing::info!("Worker ready, starting job processing loop");

    let poll_interval = config.worker_poll_interval();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received, stopping worker");
                break;
            }
            outcome = worker.process_next_job() => match outcome {
                Ok(true) => {
                    tracing::debug!("Job processed, checking for next job");
                }
                Ok(false) => {
                    tracing::trace!("No jobs available, sleeping");
                    sleep(poll_interval).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error processing job, will retry");
                    sleep(poll_interval).await;
                }
            }
        }
    }
}

impl Worker {
    /// Process the next job from the queue.
    /// Returns Ok(true) if a job was processed, Ok(false) if no job available.
    async fn process_next_job(&self) -> Result<bool, Box<dyn std::error::Error>> {
        let queue = self.executor.queue();
        let records = self.executor.records();

        if let Ok(depth) = queue.queue_depth().await {
            metrics::gauge!("detect_queue_depth").set(depth as f64);
        }

        let job = match queue.dequeue().await? {
            Some(j) => j,
            None => return Ok(false),
        };

        tracing::info!(
            job_id = %job.job_id,
            fingerprint = %job.fingerprint,
            input_key = %job.input_key,
            "Processing detection job"
        );

        let start = std::time::Instant::now();
        match self.run_with_retries(&job).await {
            Ok(record) => {
                records.mark_succeeded(job.job_id, record.clone()).await?;
                metrics::counter!("detect_jobs_completed").increment(1);
                metrics::histogram!("detect_job_seconds").record(start.elapsed().as_secs_f64());

                if let Err(e) = self.coordinator.finalize_success(job.job_id, &record).await {
                    // A later poll finalizes again.
                    tracing::warn!(job_id = %job.job_id, error = %e, "Completion callback failed");
                }

                tracing::info!(
                    job_id = %job.job_id,
                    detections = record.detections.len(),
                    "Job completed successfully"
                );
            }
            Err(e) => {
                let message = format!("Detection failed: {e}");
                records.mark_failed(job.job_id, &message).await?;
                metrics::counter!("detect_jobs_failed").increment(1);
                self.coordinator.finalize_failure(job.job_id).await;

                tracing::warn!(
                    job_id = %job.job_id,
                    error = %e,
                    transient = e.is_transient(),
                    "Job failed"
                );
            }
        }

        queue.complete(&job).await?;
        Ok(true)
    }

    /// Run the job, retrying transient failures with jittered exponential
    /// backoff until the retry budget is spent.
    async fn run_with_retries(&self, job: &QueuedJob) -> Result<ResultRecord, JobError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_initial)
            .with_multiplier(2.0)
            .with_randomization_factor(JOB_RETRY_RANDOMIZATION_FACTOR)
            .with_max_interval(self.retry_max_delay)
            .with_max_elapsed_time(None)
            .build();
        let max_attempts = self.max_retries + 1;

        retry_notify(
            policy,
            || async move {
                let attempt = self
                    .executor
                    .records()
                    .mark_running(job.job_id)
                    .await
                    .map_err(|e| backoff::Error::permanent(JobError::Record(e)))?
                    .attempts;

                self.run_once(job).await.map_err(|e| {
                    if e.is_transient() && attempt < max_attempts {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            },
            |e: JobError, delay: Duration| {
                tracing::warn!(
                    job_id = %job.job_id,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Job attempt failed, retrying"
                );
            },
        )
        .await
    }

    /// Download → detect → upload artifact → build the result record.
    async fn run_once(&self, job: &QueuedJob) -> Result<ResultRecord, JobError> {
        tracing::debug!(job_id = %job.job_id, "Downloading image from R2");
        let image = self
            .storage
            .get(&job.input_key)
            .await
            .map_err(JobError::Download)?;

        let start = std::time::Instant::now();
        let output = self.detector.detect(&image).await?;
        metrics::histogram!("detect_inference_seconds").record(start.elapsed().as_secs_f64());

        tracing::debug!(job_id = %job.job_id, "Uploading annotated image");
        self.storage
            .put(&job.output_key, &output.artifact, IMAGE_CONTENT_TYPE)
            .await
            .map_err(JobError::Upload)?;

        Ok(ResultRecord::new(job.output_key.clone(), output.detections))
    }
}
