use std::sync::Arc;
use std::time::Duration;

use guildsmith_core::keys;
use guildsmith_telemetry::names;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{KvError, KvStore};

/// Scoped helpers over a [`KvStore`]: idempotency marks, cooldowns, and
/// short-lived sessions. Fail-open policy lives in the callers; every method
/// here surfaces store failures as-is.
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn KvStore>,
    idempotency_ttl: Duration,
}

impl StateStore {
    pub fn new(store: Arc<dyn KvStore>, idempotency_ttl: Duration) -> Self {
        Self {
            store,
            idempotency_ttl: idempotency_ttl.max(Duration::from_secs(60)),
        }
    }

    pub fn raw(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn idempotency_ttl(&self) -> Duration {
        self.idempotency_ttl
    }

    /// Probes an idempotency mark and records the hit/miss counters.
    pub async fn is_processed(&self, key: &str) -> Result<bool, KvError> {
        let seen = self.store.exists(key).await?;
        if seen {
            counter!(names::IDEMPOTENCY_HITS_TOTAL).increment(1);
            debug!(key = %key, "idempotency hit");
        } else {
            counter!(names::IDEMPOTENCY_MISSES_TOTAL).increment(1);
        }
        Ok(seen)
    }

    /// Records an idempotency mark with the configured TTL.
    pub async fn mark_processed(&self, key: &str) -> Result<(), KvError> {
        self.store.set(key, "1", self.idempotency_ttl).await
    }

    /// Atomic mark: `true` when this caller created the mark first.
    pub async fn mark_processed_nx(&self, key: &str) -> Result<bool, KvError> {
        self.store.set_nx(key, "1", self.idempotency_ttl).await
    }

    pub async fn cooldown_active(&self, scope: &str, subject: &str) -> Result<bool, KvError> {
        self.store.exists(&keys::cooldown_key(scope, subject)).await
    }

    pub async fn set_cooldown(
        &self,
        scope: &str,
        subject: &str,
        ttl: Duration,
    ) -> Result<(), KvError> {
        self.store
            .set(&keys::cooldown_key(scope, subject), "1", ttl)
            .await
    }

    pub async fn clear_cooldown(&self, scope: &str, subject: &str) -> Result<(), KvError> {
        self.store.delete(&keys::cooldown_key(scope, subject)).await
    }

    pub async fn put_session<T: Serialize + Sync>(
        &self,
        scope: &str,
        subject: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), KvError> {
        let encoded = serde_json::to_string(value).map_err(KvError::Encode)?;
        self.store
            .set(&keys::session_key(scope, subject), &encoded, ttl)
            .await
    }

    pub async fn get_session<T: DeserializeOwned>(
        &self,
        scope: &str,
        subject: &str,
    ) -> Result<Option<T>, KvError> {
        let raw = self.store.get(&keys::session_key(scope, subject)).await?;
        match raw {
            Some(encoded) => serde_json::from_str(&encoded)
                .map(Some)
                .map_err(KvError::Decode),
            None => Ok(None),
        }
    }

    pub async fn delete_session(&self, scope: &str, subject: &str) -> Result<(), KvError> {
        self.store.delete(&keys::session_key(scope, subject)).await
    }

    pub async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, KvError> {
        self.store.incr_window(key, window).await
    }

    pub async fn ping(&self) -> Result<Duration, KvError> {
        self.store.ping().await
    }
}
