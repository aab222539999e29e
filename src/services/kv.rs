use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Compare-and-delete, so a finalize never removes an entry that a newer
/// submission has since claimed.
const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Single-key atomic operations with per-entry expiry.
///
/// Every method is atomic on its own; callers never rely on multi-key
/// transactions.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write only if no live entry exists. Returns `true` when this call won.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Delete only if the live value equals `expected`. Returns `true` when removed.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    async fn health_check(&self) -> Result<(), KvError>;
}

/// Redis-backed store. Every round-trip is bounded by `op_timeout`.
pub struct RedisKv {
    client: redis::Client,
    op_timeout: Duration,
    delete_if_equals: redis::Script,
}

impl RedisKv {
    pub fn new(redis_url: &str, op_timeout: Duration) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url).map_err(KvError::Redis)?;
        Ok(Self {
            client,
            op_timeout,
            delete_if_equals: redis::Script::new(DELETE_IF_EQUALS),
        })
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, KvError>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| KvError::Timeout(self.op_timeout))?
            .map_err(KvError::Redis)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, KvError> {
        self.bounded(self.client.get_multiplexed_async_connection())
            .await
    }
}

#[async_trait]
impl KeyValueStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.get::<_, Option<String>>(key)).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.connection().await?;
        // SET NX replies nil when the key already exists.
        let reply: Option<String> = self
            .bounded(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)))
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.del::<_, ()>(key)).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut conn = self.connection().await?;
        let mut invocation = self.delete_if_equals.key(key);
        invocation.arg(expected);
        let removed: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(removed > 0)
    }

    async fn health_check(&self) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        self.bounded(redis::cmd("PING").query_async::<String>(&mut conn))
            .await?;
        Ok(())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry.
    (ttl.as_millis() as u64).max(1)
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-process store with the same expiry semantics as [`RedisKv`].
///
/// Expiry runs on the tokio clock, so paused-time tests can advance past a TTL.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries whose key starts with `prefix`.
    pub fn live_count(&self, prefix: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_live())
            .count()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone()))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    return Ok(false);
                }
                occupied.insert(MemoryEntry::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        self.entries
            .insert(key.to_string(), MemoryEntry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        Ok(self
            .entries
            .remove_if(key, |_, e| e.is_live() && e.value == expected)
            .is_some())
    }

    async fn health_check(&self) -> Result<(), KvError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("key-value operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("stored value under {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

impl KvError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, KvError::Corrupt { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_set_if_absent_only_first_wins() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("k", "a", TTL).await.unwrap());
        assert!(!kv.set_if_absent("k", "b", TTL).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_absent_and_reclaimable() {
        let kv = MemoryKv::new();
        kv.set("k", "a", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_millis(1001)).await;

        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(kv.set_if_absent("k", "b", TTL).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_set_overwrites_unconditionally() {
        let kv = MemoryKv::new();
        kv.set("k", "a", TTL).await.unwrap();
        kv.set("k", "b", TTL).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_delete_if_equals_checks_value() {
        let kv = MemoryKv::new();
        kv.set("k", "a", TTL).await.unwrap();

        assert!(!kv.delete_if_equals("k", "b").await.unwrap());
        assert!(kv.get("k").await.unwrap().is_some());

        assert!(kv.delete_if_equals("k", "a").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(!kv.delete_if_equals("k", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_set_if_absent_has_one_winner() {
        let kv = std::sync::Arc::new(MemoryKv::new());
        let attempts = (0..32).map(|i| {
            let kv = kv.clone();
            tokio::spawn(async move { kv.set_if_absent("k", &i.to_string(), TTL).await.unwrap() })
        });
        let wins = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|won| *won.as_ref().unwrap())
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_live_count_by_prefix() {
        let kv = MemoryKv::new();
        kv.set("a:1", "x", TTL).await.unwrap();
        kv.set("a:2", "x", TTL).await.unwrap();
        kv.set("b:1", "x", TTL).await.unwrap();
        assert_eq!(kv.live_count("a:"), 2);
    }

    #[test]
    fn test_corrupt_is_not_transient() {
        let err = KvError::Corrupt {
            key: "k".to_string(),
            reason: "bad".to_string(),
        };
        assert!(!err.is_transient());
        assert!(KvError::Timeout(Duration::from_millis(5)).is_transient());
    }
}
