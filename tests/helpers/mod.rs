//! Test helper utilities: in-memory collaborators around a real coordinator

#![allow(dead_code)]

use async_trait::async_trait;
use detect_dedup::{
    models::{
        detection::{Detection, ResultRecord},
        job::{JobRequest, JobState},
    },
    services::{
        coordinator::{CoordinatorSettings, SubmissionCoordinator},
        executor::{ExecutorError, JobExecutor},
        fingerprint::Fingerprint,
        kv::{KeyValueStore, KvError, MemoryKv},
        storage::MemoryBlobStore,
    },
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;
use uuid::Uuid;

pub const PREFIX: &str = "test";
pub const INFLIGHT_TTL: Duration = Duration::from_secs(60);
pub const RESULT_TTL: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone)]
pub struct ScriptedJob {
    pub request: JobRequest,
    pub state: JobState,
    pub result: Option<ResultRecord>,
    pub error: Option<String>,
}

/// Executor whose jobs only move when the test says so.
#[derive(Default)]
pub struct ScriptedExecutor {
    jobs: Mutex<HashMap<Uuid, ScriptedJob>>,
    order: Mutex<Vec<Uuid>>,
    submissions: AtomicUsize,
    submit_barrier: Option<Barrier>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every `submit` until `parties` submissions are in flight, so
    /// concurrent callers are all past their store probes before any claims.
    pub fn with_submit_barrier(parties: usize) -> Self {
        Self {
            submit_barrier: Some(Barrier::new(parties)),
            ..Self::default()
        }
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Job ids in submission order.
    pub fn job_ids(&self) -> Vec<Uuid> {
        self.order.lock().unwrap().clone()
    }

    pub fn job(&self, job_id: Uuid) -> ScriptedJob {
        self.jobs.lock().unwrap()[&job_id].clone()
    }

    pub fn start(&self, job_id: Uuid) {
        self.update(job_id, |job| job.state = JobState::Running);
    }

    /// Finish the job, using its own output key as the artifact key.
    pub fn succeed(&self, job_id: Uuid, detections: Vec<Detection>) -> ResultRecord {
        let mut record = None;
        self.update(job_id, |job| {
            let r = ResultRecord::new(job.request.output_key.clone(), detections);
            job.state = JobState::Succeeded;
            job.result = Some(r.clone());
            record = Some(r);
        });
        record.expect("job exists")
    }

    pub fn fail(&self, job_id: Uuid, error: &str) {
        self.update(job_id, |job| {
            job.state = JobState::Failed;
            job.error = Some(error.to_string());
        });
    }

    fn update(&self, job_id: Uuid, f: impl FnOnce(&mut ScriptedJob)) {
        let mut jobs = self.jobs.lock().unwrap();
        f(jobs.get_mut(&job_id).expect("unknown scripted job"));
    }

    fn lookup(&self, job_id: Uuid) -> Result<ScriptedJob, ExecutorError> {
        self.jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or(ExecutorError::UnknownJob(job_id))
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn submit(&self, request: JobRequest) -> Result<Uuid, ExecutorError> {
        let job_id = Uuid::new_v4();
        self.jobs.lock().unwrap().insert(
            job_id,
            ScriptedJob {
                request,
                state: JobState::Pending,
                result: None,
                error: None,
            },
        );
        self.order.lock().unwrap().push(job_id);
        self.submissions.fetch_add(1, Ordering::SeqCst);

        if let Some(barrier) = &self.submit_barrier {
            barrier.wait().await;
        }
        Ok(job_id)
    }

    async fn poll_state(&self, job_id: Uuid) -> Result<JobState, ExecutorError> {
        Ok(self.lookup(job_id)?.state)
    }

    async fn get_result(&self, job_id: Uuid) -> Result<ResultRecord, ExecutorError> {
        let job = self.lookup(job_id)?;
        job.result.ok_or(ExecutorError::NotSucceeded {
            job_id,
            state: job.state,
        })
    }

    async fn get_error(&self, job_id: Uuid) -> Result<String, ExecutorError> {
        let job = self.lookup(job_id)?;
        job.error.ok_or(ExecutorError::NotFailed {
            job_id,
            state: job.state,
        })
    }
}

/// In-memory store that can lose inflight claims and refuse result writes
/// on demand, to steer the coordinator down its rarer paths.
pub struct ScriptedKv {
    inner: Arc<MemoryKv>,
    lost_claims: Mutex<VecDeque<Vec<(String, String)>>>,
    fail_result_writes: AtomicBool,
}

impl ScriptedKv {
    pub fn new(inner: Arc<MemoryKv>) -> Self {
        Self {
            inner,
            lost_claims: Mutex::new(VecDeque::new()),
            fail_result_writes: AtomicBool::new(false),
        }
    }

    /// The next inflight claim loses. `writes` land first, standing in for
    /// whatever the winning request did in the meantime.
    pub fn lose_next_claim(&self, writes: Vec<(String, String)>) {
        self.lost_claims.lock().unwrap().push_back(writes);
    }

    pub fn fail_result_writes(&self, fail: bool) {
        self.fail_result_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for ScriptedKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.inner.get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let scripted = if key.contains(":inflight:") {
            self.lost_claims.lock().unwrap().pop_front()
        } else {
            None
        };
        match scripted {
            Some(writes) => {
                for (k, v) in writes {
                    self.inner.set(&k, &v, ttl).await?;
                }
                Ok(false)
            }
            None => self.inner.set_if_absent(key, value, ttl).await,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        if key.contains(":result:") && self.fail_result_writes.load(Ordering::SeqCst) {
            return Err(KvError::Timeout(Duration::from_millis(250)));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        self.inner.delete_if_equals(key, expected).await
    }

    async fn health_check(&self) -> Result<(), KvError> {
        Ok(())
    }
}

/// A coordinator wired to in-memory collaborators the test can inspect.
pub struct Harness {
    pub kv: Arc<MemoryKv>,
    pub blobs: Arc<MemoryBlobStore>,
    pub executor: Arc<ScriptedExecutor>,
    pub coordinator: Arc<SubmissionCoordinator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_executor(ScriptedExecutor::new())
    }

    pub fn with_executor(executor: ScriptedExecutor) -> Self {
        let kv = Arc::new(MemoryKv::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let executor = Arc::new(executor);
        let coordinator = Arc::new(SubmissionCoordinator::new(
            kv.clone(),
            blobs.clone(),
            executor.clone(),
            &settings(),
        ));
        Self {
            kv,
            blobs,
            executor,
            coordinator,
        }
    }

    /// Like `new`, but the coordinator talks to a [`ScriptedKv`] over the
    /// inspectable store.
    pub fn with_scripted_kv() -> (Self, Arc<ScriptedKv>) {
        let kv = Arc::new(MemoryKv::new());
        let scripted = Arc::new(ScriptedKv::new(kv.clone()));
        let blobs = Arc::new(MemoryBlobStore::new());
        let executor = Arc::new(ScriptedExecutor::new());
        let coordinator = Arc::new(SubmissionCoordinator::new(
            scripted.clone(),
            blobs.clone(),
            executor.clone(),
            &settings(),
        ));
        let harness = Self {
            kv,
            blobs,
            executor,
            coordinator,
        };
        (harness, scripted)
    }

    pub fn inflight_entries(&self) -> usize {
        self.kv.live_count(&format!("{PREFIX}:inflight:"))
    }

    pub fn index_entries(&self) -> usize {
        self.kv.live_count(&format!("{PREFIX}:job_index:"))
    }

    pub fn cached_results(&self) -> usize {
        self.kv.live_count(&format!("{PREFIX}:result:"))
    }
}

pub fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        key_prefix: PREFIX.to_string(),
        result_ttl: RESULT_TTL,
        inflight_ttl: INFLIGHT_TTL,
    }
}

pub fn result_key(fingerprint: &Fingerprint) -> String {
    format!("{PREFIX}:result:{fingerprint}")
}

pub fn inflight_key(fingerprint: &Fingerprint) -> String {
    format!("{PREFIX}:inflight:{fingerprint}")
}

/// The single detection used by the imgA walkthrough.
pub fn person_detection() -> Vec<Detection> {
    vec![Detection {
        class_id: 0,
        confidence: 0.91,
        bbox: [10.0, 10.0, 50.0, 50.0],
    }]
}
