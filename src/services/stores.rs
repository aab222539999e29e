//! Typed key-spaces over a shared [`KeyValueStore`].
//!
//! Three independent namespaces, each entry carrying its own expiry:
//! `<prefix>:result:<fingerprint>`, `<prefix>:inflight:<fingerprint>` and
//! `<prefix>:job_index:<job_id>`.
//!
//! An entry that no longer decodes is evicted and read as absent, so a bad
//! write or a schema change costs one recomputation instead of blocking the
//! key until its TTL runs out.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::detection::ResultRecord;
use crate::services::fingerprint::Fingerprint;
use crate::services::kv::{KeyValueStore, KvError};

/// Read `key` and decode it, evicting the entry when decoding fails.
async fn read_or_evict<T, E, F>(kv: &dyn KeyValueStore, key: &str, decode: F) -> Result<Option<T>, KvError>
where
    E: Display,
    F: FnOnce(&str) -> Result<T, E>,
{
    let Some(raw) = kv.get(key).await? else {
        return Ok(None);
    };
    match decode(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(key = key, error = %e, "Evicting undecodable entry");
            metrics::counter!("detect_corrupt_entries_total").increment(1);
            // Only the bytes we saw; a fresh write under the same key survives.
            if let Err(e) = kv.delete_if_equals(key, &raw).await {
                tracing::warn!(key = key, error = %e, "Failed to evict undecodable entry");
            }
            Ok(None)
        }
    }
}

/// Fingerprint → finished result.
#[derive(Clone)]
pub struct ResultStore {
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
    ttl: Duration,
}

impl ResultStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, prefix: &str, ttl: Duration) -> Self {
        Self {
            kv,
            prefix: format!("{prefix}:result"),
            ttl,
        }
    }

    fn key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}:{}", self.prefix, fingerprint)
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<ResultRecord>, KvError> {
        read_or_evict(self.kv.as_ref(), &self.key(fingerprint), ResultRecord::decode).await
    }

    /// Unconditional write; the last finalize for a fingerprint wins.
    pub async fn put(&self, fingerprint: &Fingerprint, record: &ResultRecord) -> Result<(), KvError> {
        let key = self.key(fingerprint);
        let raw = record.encode().map_err(|e| KvError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.kv.set(&key, &raw, self.ttl).await
    }
}

/// Fingerprint → job currently computing it.
#[derive(Clone)]
pub struct InflightTracker {
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
    ttl: Duration,
}

impl InflightTracker {
    pub fn new(kv: Arc<dyn KeyValueStore>, prefix: &str, ttl: Duration) -> Self {
        Self {
            kv,
            prefix: format!("{prefix}:inflight"),
            ttl,
        }
    }

    fn key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}:{}", self.prefix, fingerprint)
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Uuid>, KvError> {
        read_or_evict(self.kv.as_ref(), &self.key(fingerprint), Uuid::parse_str).await
    }

    /// Claim the fingerprint for `job_id`. Returns `false` when another job
    /// already holds a live claim.
    pub async fn claim(&self, fingerprint: &Fingerprint, job_id: Uuid) -> Result<bool, KvError> {
        self.kv
            .set_if_absent(&self.key(fingerprint), &job_id.to_string(), self.ttl)
            .await
    }

    /// Drop the claim, but only while it still belongs to `job_id`.
    pub async fn release(&self, fingerprint: &Fingerprint, job_id: Uuid) -> Result<bool, KvError> {
        self.kv
            .delete_if_equals(&self.key(fingerprint), &job_id.to_string())
            .await
    }
}

/// Job → fingerprint that spawned it.
#[derive(Clone)]
pub struct JobIndex {
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
    ttl: Duration,
}

impl JobIndex {
    pub fn new(kv: Arc<dyn KeyValueStore>, prefix: &str, ttl: Duration) -> Self {
        Self {
            kv,
            prefix: format!("{prefix}:job_index"),
            ttl,
        }
    }

    fn key(&self, job_id: Uuid) -> String {
        format!("{}:{}", self.prefix, job_id)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Fingerprint>, KvError> {
        read_or_evict(self.kv.as_ref(), &self.key(job_id), Fingerprint::parse).await
    }

    pub async fn record(&self, job_id: Uuid, fingerprint: &Fingerprint) -> Result<(), KvError> {
        self.kv
            .set(&self.key(job_id), fingerprint.as_str(), self.ttl)
            .await
    }

    pub async fn remove(&self, job_id: Uuid) -> Result<(), KvError> {
        self.kv.delete(&self.key(job_id)).await
    }
}
