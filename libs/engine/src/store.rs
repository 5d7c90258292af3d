use std::collections::HashMap;
use std::time::Duration;

use anyhow::anyhow;
use async_nats::jetstream::{
    Context as JsContext,
    context::KeyValueErrorKind,
    kv::{self, CreateErrorKind, UpdateErrorKind},
};
use async_trait::async_trait;
use futures::TryStreamExt;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::warn;

use crate::record::{JobCounts, JobRecord, JobState};
use crate::EngineError;

/// Persistence seam for the job queue. The engine schedules through this
/// trait only, so durability is a deployment choice: JetStream KV in
/// production, the in-memory table in tests.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, record: JobRecord) -> Result<(), EngineError>;

    async fn update(&self, record: &JobRecord) -> Result<(), EngineError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, EngineError>;

    async fn remove(&self, job_id: &str) -> Result<(), EngineError>;

    async fn list_by_community(
        &self,
        community_id: &str,
        state: Option<JobState>,
    ) -> Result<Vec<JobRecord>, EngineError>;

    /// Atomically claims the best ready job (highest priority, oldest first)
    /// and transitions it to `Active`.
    async fn claim_next_ready(&self, now: OffsetDateTime)
    -> Result<Option<JobRecord>, EngineError>;

    /// Time until the earliest delayed job ripens, when one exists.
    async fn next_delay(&self, now: OffsetDateTime) -> Result<Option<Duration>, EngineError>;

    async fn counts(&self) -> Result<JobCounts, EngineError>;

    /// Discards terminal records past their retention age. Returns how many
    /// were removed.
    async fn purge_finished(
        &self,
        completed_before: OffsetDateTime,
        failed_before: OffsetDateTime,
    ) -> Result<usize, EngineError>;
}

/// Claim order: priority descending, then age, then id for determinism.
fn claim_rank(record: &JobRecord) -> (i32, OffsetDateTime, String) {
    (-record.priority, record.created_at, record.job_id.clone())
}

fn until(now: OffsetDateTime, target: OffsetDateTime) -> Duration {
    let millis = (target - now).whole_milliseconds();
    if millis <= 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(millis as u64)
    }
}

/// In-memory job table used by the test suite and single-process setups.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), EngineError> {
        self.jobs
            .lock()
            .await
            .insert(record.job_id.clone(), record);
        Ok(())
    }

    async fn update(&self, record: &JobRecord) -> Result<(), EngineError> {
        self.jobs
            .lock()
            .await
            .insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, EngineError> {
        Ok(self.jobs.lock().await.get(job_id).cloned())
    }

    async fn remove(&self, job_id: &str) -> Result<(), EngineError> {
        self.jobs.lock().await.remove(job_id);
        Ok(())
    }

    async fn list_by_community(
        &self,
        community_id: &str,
        state: Option<JobState>,
    ) -> Result<Vec<JobRecord>, EngineError> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<JobRecord> = jobs
            .values()
            .filter(|r| r.job.community_id == community_id)
            .filter(|r| state.map(|s| r.state == s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn claim_next_ready(
        &self,
        now: OffsetDateTime,
    ) -> Result<Option<JobRecord>, EngineError> {
        let mut jobs = self.jobs.lock().await;
        let best_id = jobs
            .values()
            .filter(|r| r.is_ready(now))
            .min_by_key(|r| claim_rank(r))
            .map(|r| r.job_id.clone());
        let Some(job_id) = best_id else {
            return Ok(None);
        };
        let Some(record) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        record.state = JobState::Active;
        record.not_before = None;
        Ok(Some(record.clone()))
    }

    async fn next_delay(&self, now: OffsetDateTime) -> Result<Option<Duration>, EngineError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|r| r.state == JobState::Delayed)
            .filter_map(|r| r.not_before)
            .min()
            .map(|t| until(now, t)))
    }

    async fn counts(&self) -> Result<JobCounts, EngineError> {
        let jobs = self.jobs.lock().await;
        let mut counts = JobCounts::default();
        for record in jobs.values() {
            counts.add(record.state);
        }
        Ok(counts)
    }

    async fn purge_finished(
        &self,
        completed_before: OffsetDateTime,
        failed_before: OffsetDateTime,
    ) -> Result<usize, EngineError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, r| {
            let cutoff = match r.state {
                JobState::Completed => completed_before,
                JobState::Failed => failed_before,
                _ => return true,
            };
            r.finished_at.map(|t| t > cutoff).unwrap_or(true)
        });
        Ok(before - jobs.len())
    }
}

/// JetStream-KV-backed store: one key per job, JSON-encoded records, claims
/// guarded by revision CAS so concurrent workers never double-claim.
pub struct KvJobStore {
    bucket: kv::Store,
}

impl KvJobStore {
    pub async fn new(js: &JsContext, namespace: &str) -> Result<Self, EngineError> {
        let bucket = match js.get_key_value(namespace).await {
            Ok(store) => store,
            Err(err) if err.kind() == KeyValueErrorKind::GetBucket => js
                .create_key_value(kv::Config {
                    bucket: namespace.to_string(),
                    description: "guildsmith synthesis jobs".into(),
                    history: 1,
                    max_age: Duration::from_secs(0),
                    ..Default::default()
                })
                .await
                .map_err(|err| {
                    EngineError::store(
                        anyhow!(err).context(format!("create job bucket {namespace}")),
                    )
                })?,
            Err(err) => return Err(EngineError::store(err)),
        };
        Ok(Self { bucket })
    }

    async fn entries(&self) -> Result<Vec<(JobRecord, u64)>, EngineError> {
        let keys: Vec<String> = self
            .bucket
            .keys()
            .await
            .map_err(EngineError::store)?
            .try_collect()
            .await
            .map_err(EngineError::store)?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(entry) = self
                .bucket
                .entry(key.as_str())
                .await
                .map_err(EngineError::store)?
            else {
                continue;
            };
            match serde_json::from_slice::<JobRecord>(&entry.value) {
                Ok(record) => out.push((record, entry.revision)),
                Err(err) => warn!(key = %key, error = %err, "skipping undecodable job record"),
            }
        }
        Ok(out)
    }

    async fn write(&self, record: &JobRecord, revision: Option<u64>) -> Result<bool, EngineError> {
        let payload = serde_json::to_vec(record).map_err(EngineError::store)?;
        match revision {
            Some(revision) => match self
                .bucket
                .update(record.job_id.as_str(), payload.into(), revision)
                .await
            {
                Ok(_) => Ok(true),
                Err(err) if err.kind() == UpdateErrorKind::WrongLastRevision => Ok(false),
                Err(err) => Err(EngineError::store(err)),
            },
            None => match self
                .bucket
                .create(record.job_id.as_str(), payload.into())
                .await
            {
                Ok(_) => Ok(true),
                Err(err) if err.kind() == CreateErrorKind::AlreadyExists => Ok(false),
                Err(err) => Err(EngineError::store(err)),
            },
        }
    }
}

#[async_trait]
impl JobStore for KvJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), EngineError> {
        if self.write(&record, None).await? {
            Ok(())
        } else {
            Err(EngineError::store(anyhow!(
                "job id collision for {}",
                record.job_id
            )))
        }
    }

    async fn update(&self, record: &JobRecord) -> Result<(), EngineError> {
        let payload = serde_json::to_vec(record).map_err(EngineError::store)?;
        self.bucket
            .put(record.job_id.as_str(), payload.into())
            .await
            .map_err(EngineError::store)?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, EngineError> {
        let value = self.bucket.get(job_id).await.map_err(EngineError::store)?;
        match value {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(EngineError::store),
            None => Ok(None),
        }
    }

    async fn remove(&self, job_id: &str) -> Result<(), EngineError> {
        self.bucket.purge(job_id).await.map_err(EngineError::store)
    }

    async fn list_by_community(
        &self,
        community_id: &str,
        state: Option<JobState>,
    ) -> Result<Vec<JobRecord>, EngineError> {
        let mut out: Vec<JobRecord> = self
            .entries()
            .await?
            .into_iter()
            .map(|(record, _)| record)
            .filter(|r| r.job.community_id == community_id)
            .filter(|r| state.map(|s| r.state == s).unwrap_or(true))
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn claim_next_ready(
        &self,
        now: OffsetDateTime,
    ) -> Result<Option<JobRecord>, EngineError> {
        // Lost CAS races mean another worker claimed the same record; rescan.
        for _ in 0..4 {
            let mut ready: Vec<(JobRecord, u64)> = self
                .entries()
                .await?
                .into_iter()
                .filter(|(r, _)| r.is_ready(now))
                .collect();
            ready.sort_by_key(|(r, _)| claim_rank(r));
            let Some((mut record, revision)) = ready.into_iter().next() else {
                return Ok(None);
            };
            record.state = JobState::Active;
            record.not_before = None;
            if self.write(&record, Some(revision)).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn next_delay(&self, now: OffsetDateTime) -> Result<Option<Duration>, EngineError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|(r, _)| r.state == JobState::Delayed)
            .filter_map(|(r, _)| r.not_before)
            .min()
            .map(|t| until(now, t)))
    }

    async fn counts(&self) -> Result<JobCounts, EngineError> {
        let mut counts = JobCounts::default();
        for (record, _) in self.entries().await? {
            counts.add(record.state);
        }
        Ok(counts)
    }

    async fn purge_finished(
        &self,
        completed_before: OffsetDateTime,
        failed_before: OffsetDateTime,
    ) -> Result<usize, EngineError> {
        let mut purged = 0usize;
        for (record, _) in self.entries().await? {
            let cutoff = match record.state {
                JobState::Completed => completed_before,
                JobState::Failed => failed_before,
                _ => continue,
            };
            if record.finished_at.map(|t| t <= cutoff).unwrap_or(false) {
                self.remove(&record.job_id).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guildsmith_core::{JobSpec, SynthesisJob};

    fn job(key: &str, priority: Option<i32>, delay_ms: Option<u64>) -> SynthesisJob {
        SynthesisJob {
            spec: JobSpec::AssignRole {
                user_id: "u1".into(),
                role_id: "r1".into(),
            },
            guild_id: "g1".into(),
            community_id: "acme".into(),
            idempotency_key: key.into(),
            priority,
            delay_ms,
        }
    }

    fn record(id: &str, priority: Option<i32>, delay_ms: Option<u64>) -> JobRecord {
        JobRecord::new(id.into(), job(id, priority, delay_ms), OffsetDateTime::now_utc())
    }

    #[tokio::test]
    async fn claim_prefers_priority_then_age() {
        let store = MemoryJobStore::new();
        store.insert(record("low", Some(0), None)).await.unwrap();
        store.insert(record("high", Some(5), None)).await.unwrap();

        let claimed = store
            .claim_next_ready(OffsetDateTime::now_utc())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.job_id, "high");
        assert_eq!(claimed.state, JobState::Active);

        let next = store
            .claim_next_ready(OffsetDateTime::now_utc())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.job_id, "low");

        assert!(store
            .claim_next_ready(OffsetDateTime::now_utc())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_claimable_early() {
        let store = MemoryJobStore::new();
        store
            .insert(record("later", None, Some(60_000)))
            .await
            .unwrap();
        let now = OffsetDateTime::now_utc();
        assert!(store.claim_next_ready(now).await.unwrap().is_none());
        let wait = store.next_delay(now).await.unwrap().unwrap();
        assert!(wait > Duration::from_secs(30));

        let claimed = store
            .claim_next_ready(now + time::Duration::minutes(2))
            .await
            .unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn counts_and_purge_track_terminal_states() {
        let store = MemoryJobStore::new();
        let mut done = record("done", None, None);
        done.state = JobState::Completed;
        done.finished_at = Some(OffsetDateTime::now_utc() - time::Duration::hours(2));
        store.insert(done).await.unwrap();
        store.insert(record("pending", None, None)).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.waiting, 1);

        let purged = store
            .purge_finished(
                OffsetDateTime::now_utc() - time::Duration::hours(1),
                OffsetDateTime::now_utc() - time::Duration::hours(24),
            )
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.counts().await.unwrap().completed, 0);
    }

    #[tokio::test]
    async fn list_filters_by_community_and_state() {
        let store = MemoryJobStore::new();
        store.insert(record("a", None, None)).await.unwrap();
        let mut other = record("b", None, None);
        other.job.community_id = "umbra".into();
        store.insert(other).await.unwrap();

        let acme = store.list_by_community("acme", None).await.unwrap();
        assert_eq!(acme.len(), 1);
        let none = store
            .list_by_community("acme", Some(JobState::Failed))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
