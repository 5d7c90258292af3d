use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_nats::jetstream::{
    Context as JsContext,
    context::KeyValueErrorKind,
    kv::{self, CreateErrorKind, UpdateErrorKind},
};
use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::warn;

use crate::{KvError, KvStore};

const CAS_RETRY_LIMIT: usize = 8;

/// Maps a logical key (colon-delimited prefixes) onto the bucket's legal
/// character set. Idempotency ids are platform snowflakes, so collisions from
/// the mapping are not a practical concern.
fn bucket_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '/' | '=' | '.' => c,
            _ => '.',
        })
        .collect()
}

/// JetStream-backed state store. The bucket is ensured at construction; keys
/// carry their own TTLs via create-with-TTL semantics.
pub struct JetStreamKvStore {
    bucket: kv::Store,
}

impl JetStreamKvStore {
    pub async fn new(js: &JsContext, namespace: &str) -> Result<Self, KvError> {
        let bucket = match js.get_key_value(namespace).await {
            Ok(store) => store,
            Err(err) if err.kind() == KeyValueErrorKind::GetBucket => js
                .create_key_value(kv::Config {
                    bucket: namespace.to_string(),
                    description: "guildsmith shared state".into(),
                    history: 1,
                    max_age: Duration::from_secs(0),
                    ..Default::default()
                })
                .await
                .map_err(|err| {
                    KvError::unavailable(anyhow!(err).context(format!(
                        "create JetStream KV bucket {namespace}"
                    )))
                })?,
            Err(err) => return Err(KvError::unavailable(err)),
        };
        Ok(Self { bucket })
    }

    fn window_bucket(key: &str, window: Duration) -> String {
        let secs = window.as_secs().max(1);
        let slot = OffsetDateTime::now_utc().unix_timestamp() as u64 / secs;
        format!("{key}/{slot}")
    }
}

#[async_trait]
impl KvStore for JetStreamKvStore {
    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let value = self
            .bucket
            .get(bucket_key(key))
            .await
            .map_err(KvError::unavailable)?;
        Ok(value.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let value = self
            .bucket
            .get(bucket_key(key))
            .await
            .map_err(KvError::unavailable)?;
        Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let key = bucket_key(key);
        let payload: Vec<u8> = value.as_bytes().to_vec();
        for _ in 0..CAS_RETRY_LIMIT {
            match self
                .bucket
                .create_with_ttl(key.as_str(), payload.clone().into(), ttl)
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == CreateErrorKind::AlreadyExists => {
                    // Replace: drop the old key (and its TTL) and recreate.
                    self.bucket
                        .purge(key.as_str())
                        .await
                        .map_err(KvError::unavailable)?;
                }
                Err(err) => return Err(KvError::unavailable(err)),
            }
        }
        Err(KvError::unavailable(anyhow!(
            "set lost create race {CAS_RETRY_LIMIT} times for {key}"
        )))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let key = bucket_key(key);
        match self
            .bucket
            .create_with_ttl(key.as_str(), value.as_bytes().to_vec().into(), ttl)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == CreateErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(KvError::unavailable(err)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.bucket
            .purge(bucket_key(key))
            .await
            .map_err(KvError::unavailable)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, KvError> {
        let key = bucket_key(&Self::window_bucket(key, window));
        let mut retries = 0usize;
        loop {
            let entry = self
                .bucket
                .entry(key.as_str())
                .await
                .map_err(KvError::unavailable)?;
            match entry {
                None => {
                    match self
                        .bucket
                        .create_with_ttl(key.as_str(), b"1".to_vec().into(), window)
                        .await
                    {
                        Ok(_) => return Ok(1),
                        Err(err) if err.kind() == CreateErrorKind::AlreadyExists => {}
                        Err(err) => return Err(KvError::unavailable(err)),
                    }
                }
                Some(entry) => {
                    let current = String::from_utf8_lossy(&entry.value)
                        .parse::<u64>()
                        .unwrap_or(0);
                    let next = current + 1;
                    match self
                        .bucket
                        .update(key.as_str(), next.to_string().into_bytes().into(), entry.revision)
                        .await
                    {
                        Ok(_) => return Ok(next),
                        Err(err) if err.kind() == UpdateErrorKind::WrongLastRevision => {}
                        Err(err) => return Err(KvError::unavailable(err)),
                    }
                }
            }
            retries += 1;
            if retries >= CAS_RETRY_LIMIT {
                warn!(key = %key, retries, "counter CAS contention, giving up");
                return Err(KvError::unavailable(anyhow!(
                    "counter update lost {retries} CAS races for {key}"
                )));
            }
        }
    }

    async fn ping(&self) -> Result<Duration, KvError> {
        let started = Instant::now();
        self.bucket.status().await.map_err(KvError::unavailable)?;
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_key_maps_colons() {
        assert_eq!(bucket_key("event:processed:e1"), "event.processed.e1");
        assert_eq!(bucket_key("rate/acme"), "rate/acme");
        assert_eq!(bucket_key("weird key!"), "weird.key.");
    }

    #[test]
    fn window_bucket_is_stable_within_a_window() {
        let a = JetStreamKvStore::window_bucket("hits", Duration::from_secs(3600));
        let b = JetStreamKvStore::window_bucket("hits", Duration::from_secs(3600));
        assert_eq!(a, b);
    }
}
