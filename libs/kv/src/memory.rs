use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::{KvError, KvStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: OffsetDateTime,
}

/// In-memory store used in tests and as a boot-time fallback when the
/// JetStream bucket is unreachable. TTLs are honored lazily on access.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: RwLock<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entry: Option<&Entry>, now: OffsetDateTime) -> Option<&Entry> {
        entry.filter(|e| e.expires_at > now)
    }

    fn expiry(ttl: Duration) -> OffsetDateTime {
        OffsetDateTime::now_utc() + time::Duration::seconds(ttl.as_secs().max(1) as i64)
    }

    /// Drops expired entries eagerly; tests use this to assert TTL behavior.
    pub async fn purge_expired(&self) {
        let now = OffsetDateTime::now_utc();
        self.inner.write().await.retain(|_, e| e.expires_at > now);
    }

    fn window_bucket(key: &str, window: Duration) -> String {
        let secs = window.as_secs().max(1);
        let bucket = OffsetDateTime::now_utc().unix_timestamp() as u64 / secs;
        format!("{key}@{bucket}")
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let now = OffsetDateTime::now_utc();
        let guard = self.inner.read().await;
        Ok(Self::live(guard.get(key), now).is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = OffsetDateTime::now_utc();
        let guard = self.inner.read().await;
        Ok(Self::live(guard.get(key), now).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: Self::expiry(ttl),
        };
        self.inner.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = OffsetDateTime::now_utc();
        let mut guard = self.inner.write().await;
        if Self::live(guard.get(key), now).is_some() {
            return Ok(false);
        }
        guard.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.write().await.remove(key);
        Ok(())
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, KvError> {
        let bucket_key = Self::window_bucket(key, window);
        let now = OffsetDateTime::now_utc();
        let mut guard = self.inner.write().await;
        let next = match Self::live(guard.get(&bucket_key), now) {
            Some(entry) => entry.value.parse::<u64>().unwrap_or(0) + 1,
            None => 1,
        };
        guard.insert(
            bucket_key,
            Entry {
                value: next.to_string(),
                expires_at: Self::expiry(window),
            },
        );
        Ok(next)
    }

    async fn ping(&self) -> Result<Duration, KvError> {
        Ok(Duration::from_micros(1))
    }
}
