use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use nanoid::nanoid;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use guildsmith_core::{
    ChannelTemplate, EngineConfig, JobSpec, RoleTemplate, SynthesisJob, SynthesisManifest, keys,
};
use guildsmith_kv::StateStore;
use guildsmith_ratelimit::{BucketStatus, OpsPerSecond, TokenBucket};
use guildsmith_rest::{ApiResult, ChatApi, NewChannel, NewRole, RestError};
use guildsmith_telemetry::names;

use crate::backoff::retry_delay;
use crate::dlq::{DeadLetter, DeadLetterSink, DeadLetterStage};
use crate::record::{JobCounts, JobRecord, JobState};
use crate::store::JobStore;
use crate::EngineError;

/// Fixed stagger between manifest-expanded jobs, to smooth bursts.
const BATCH_STAGGER_MS: u64 = 100;
/// Idle worker wake-up cadence when no delayed job sets an earlier deadline.
const IDLE_POLL: Duration = Duration::from_millis(500);
/// Sweeper cadence for retention and depth gauges.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const STATS_WINDOW: Duration = Duration::from_secs(3600);

/// Result of a manifest expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReceipt {
    pub job_ids: Vec<String>,
    pub count: usize,
}

/// Snapshot returned by [`SynthesisEngine::stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub counts: JobCounts,
    pub bucket: BucketStatus,
    pub rate_limit_hits_last_hour: usize,
    pub platform_429s_last_hour: usize,
    pub paused: bool,
}

/// Event timestamps pruned to a rolling window.
#[derive(Default)]
struct RollingCounter {
    events: StdMutex<VecDeque<Instant>>,
}

impl RollingCounter {
    fn record(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Instant::now());
    }

    fn count_within(&self, window: Duration) -> usize {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = Instant::now().checked_sub(window);
        if let Some(cutoff) = cutoff {
            while events.front().map(|t| *t < cutoff).unwrap_or(false) {
                events.pop_front();
            }
        }
        events.len()
    }
}

/// Engine-wide stop sign raised by a global 429; workers wait it out before
/// claiming new jobs.
#[derive(Default)]
struct HaltGate {
    until: StdMutex<Option<Instant>>,
}

impl HaltGate {
    fn raise(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut halt = self.until.lock().unwrap_or_else(|e| e.into_inner());
        *halt = Some(halt.map_or(until, |current| current.max(until)));
    }

    fn remaining(&self) -> Option<Duration> {
        let mut halt = self.until.lock().unwrap_or_else(|e| e.into_inner());
        match *halt {
            Some(until) => {
                let now = Instant::now();
                if until > now {
                    Some(until - now)
                } else {
                    *halt = None;
                    None
                }
            }
            None => None,
        }
    }
}

/// The synthesis engine: durable queue plus worker pool.
///
/// One instance per process, shared behind an `Arc`. `start` spawns the
/// workers; `pause` stops new pickups while in-flight jobs finish; `close`
/// cancels and joins everything.
pub struct SynthesisEngine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    state: StateStore,
    api: Arc<dyn ChatApi>,
    bucket: Arc<TokenBucket>,
    ops_limit: OpsPerSecond,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    halt: HaltGate,
    wake: Notify,
    rate_limit_hits: RollingCounter,
    platform_429s: RollingCounter,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SynthesisEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        state: StateStore,
        api: Arc<dyn ChatApi>,
        bucket: Arc<TokenBucket>,
        dead_letters: Option<Arc<dyn DeadLetterSink>>,
    ) -> Arc<Self> {
        let (paused, _) = watch::channel(false);
        let ops_limit = OpsPerSecond::new(config.rate_limit_max);
        Arc::new(Self {
            config,
            store,
            state,
            api,
            bucket,
            ops_limit,
            dead_letters,
            cancel: CancellationToken::new(),
            paused,
            halt: HaltGate::default(),
            wake: Notify::new(),
            rate_limit_hits: RollingCounter::default(),
            platform_429s: RollingCounter::default(),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Spawns the worker pool and the retention sweeper.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for idx in 0..self.config.concurrency {
            let engine = Arc::clone(self);
            workers.push(tokio::spawn(engine.worker_loop(idx)));
        }
        let engine = Arc::clone(self);
        workers.push(tokio::spawn(engine.sweeper_loop()));
        info!(concurrency = self.config.concurrency, "synthesis engine started");
    }

    /// Persists one job and returns its id.
    pub async fn enqueue(&self, job: SynthesisJob) -> Result<String, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        let job_id = nanoid!();
        let kind = job.spec.kind();
        let record = JobRecord::new(job_id.clone(), job, OffsetDateTime::now_utc());
        self.store.insert(record).await?;
        counter!(names::JOBS_ENQUEUED_TOTAL, "type" => kind).increment(1);
        self.wake.notify_one();
        Ok(job_id)
    }

    /// Expands a manifest into role/channel jobs, staggered by a fixed delay
    /// per index to smooth the burst.
    pub async fn enqueue_batch(
        &self,
        community_id: &str,
        guild_id: &str,
        manifest: &SynthesisManifest,
    ) -> Result<BatchReceipt, EngineError> {
        let mut job_ids = Vec::with_capacity(manifest.len());
        let mut idx = 0u64;
        for role in &manifest.roles {
            let job = Self::role_job(community_id, guild_id, role, idx * BATCH_STAGGER_MS);
            job_ids.push(self.enqueue(job).await?);
            idx += 1;
        }
        for channel in &manifest.channels {
            let job = Self::channel_job(community_id, guild_id, channel, idx * BATCH_STAGGER_MS);
            job_ids.push(self.enqueue(job).await?);
            idx += 1;
        }
        let count = job_ids.len();
        Ok(BatchReceipt { job_ids, count })
    }

    fn role_job(
        community_id: &str,
        guild_id: &str,
        role: &RoleTemplate,
        delay_ms: u64,
    ) -> SynthesisJob {
        SynthesisJob {
            spec: JobSpec::CreateRole {
                name: role.name.clone(),
                color: role.color,
                hoist: role.hoist,
                mentionable: role.mentionable,
                permissions: role.permissions.clone(),
            },
            guild_id: guild_id.to_string(),
            community_id: community_id.to_string(),
            idempotency_key: format!("role:{community_id}:{}", role.key),
            priority: None,
            delay_ms: (delay_ms > 0).then_some(delay_ms),
        }
    }

    fn channel_job(
        community_id: &str,
        guild_id: &str,
        channel: &ChannelTemplate,
        delay_ms: u64,
    ) -> SynthesisJob {
        SynthesisJob {
            spec: JobSpec::CreateChannel {
                name: channel.name.clone(),
                kind: channel.kind,
                parent_id: channel.parent_id.clone(),
                topic: channel.topic.clone(),
                overwrites: channel.overwrites.clone(),
            },
            guild_id: guild_id.to_string(),
            community_id: community_id.to_string(),
            idempotency_key: format!("channel:{community_id}:{}", channel.key),
            priority: None,
            delay_ms: (delay_ms > 0).then_some(delay_ms),
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, EngineError> {
        self.store.get(job_id).await
    }

    pub async fn jobs_for_community(
        &self,
        community_id: &str,
        state: Option<JobState>,
    ) -> Result<Vec<JobRecord>, EngineError> {
        self.store.list_by_community(community_id, state).await
    }

    /// Removes a job that has not run yet. Refused while `active` or after
    /// completion.
    pub async fn cancel_job(&self, job_id: &str) -> Result<JobRecord, EngineError> {
        let record = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))?;
        if matches!(record.state, JobState::Active | JobState::Completed) {
            return Err(EngineError::InvalidState {
                job_id: job_id.to_string(),
                action: "cancel",
                state: record.state.as_str(),
            });
        }
        self.store.remove(job_id).await?;
        Ok(record)
    }

    /// Puts a failed job back in the queue with a fresh attempt budget.
    pub async fn retry_job(&self, job_id: &str) -> Result<JobRecord, EngineError> {
        let mut record = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))?;
        if record.state != JobState::Failed {
            return Err(EngineError::InvalidState {
                job_id: job_id.to_string(),
                action: "retry",
                state: record.state.as_str(),
            });
        }
        record.state = JobState::Waiting;
        record.attempts_made = 0;
        record.not_before = None;
        record.finished_at = None;
        record.failed_reason = None;
        self.store.update(&record).await?;
        self.wake.notify_one();
        Ok(record)
    }

    /// Idempotency probe for a caller-supplied key.
    pub async fn is_processed(&self, idempotency_key: &str) -> Result<bool, EngineError> {
        Ok(self
            .state
            .is_processed(&keys::synthesis_processed_key(idempotency_key))
            .await?)
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            counts: self.store.counts().await?,
            bucket: self.bucket.status(),
            rate_limit_hits_last_hour: self.rate_limit_hits.count_within(STATS_WINDOW),
            platform_429s_last_hour: self.platform_429s.count_within(STATS_WINDOW),
            paused: *self.paused.borrow(),
        })
    }

    /// Stops new pickups; in-flight jobs run to completion.
    pub fn pause(&self) {
        let _ = self.paused.send(true);
        info!("synthesis engine paused");
    }

    pub fn resume(&self) {
        let _ = self.paused.send(false);
        self.wake.notify_waiters();
        info!("synthesis engine resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Cancels the pool and waits for every worker to exit. Terminal.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if let Err(err) = handle.await {
                warn!(error = %err, "engine worker join failed");
            }
        }
        info!("synthesis engine closed");
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        let mut paused_rx = self.paused.subscribe();
        debug!(worker, "engine worker online");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if *paused_rx.borrow() {
                tokio::select! {
                    _ = paused_rx.changed() => continue,
                    _ = self.cancel.cancelled() => break,
                }
            }
            if let Some(wait) = self.halt.remaining() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => continue,
                    _ = self.cancel.cancelled() => break,
                }
            }
            match self.store.claim_next_ready(OffsetDateTime::now_utc()).await {
                Ok(Some(record)) => self.process(record).await,
                Ok(None) => {
                    let wait = self
                        .store
                        .next_delay(OffsetDateTime::now_utc())
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or(IDLE_POLL)
                        .clamp(Duration::from_millis(10), IDLE_POLL);
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Err(err) => {
                    error!(worker, error = %err, "job claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
            }
        }
        debug!(worker, "engine worker stopped");
    }

    async fn sweeper_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = self.cancel.cancelled() => break,
            }
            let now = OffsetDateTime::now_utc();
            let completed_cutoff =
                now - time::Duration::seconds(self.config.remove_on_complete_age.as_secs() as i64);
            let failed_cutoff =
                now - time::Duration::seconds(self.config.remove_on_fail_age.as_secs() as i64);
            match self.store.purge_finished(completed_cutoff, failed_cutoff).await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "discarded finished jobs past retention"),
                Err(err) => warn!(error = %err, "retention sweep failed"),
            }
            if let Ok(counts) = self.store.counts().await {
                gauge!(names::QUEUE_DEPTH, "state" => "waiting").set(counts.waiting as f64);
                gauge!(names::QUEUE_DEPTH, "state" => "delayed").set(counts.delayed as f64);
                gauge!(names::QUEUE_DEPTH, "state" => "active").set(counts.active as f64);
                gauge!(names::QUEUE_DEPTH, "state" => "completed").set(counts.completed as f64);
                gauge!(names::QUEUE_DEPTH, "state" => "failed").set(counts.failed as f64);
            }
        }
    }

    /// Runs one claimed job. Every failure path converts into a retry or a
    /// terminal `Failed`; nothing escapes to kill the worker.
    async fn process(&self, mut record: JobRecord) {
        record.attempts_made += 1;
        record.processed_at = Some(OffsetDateTime::now_utc());
        if let Err(err) = self.store.update(&record).await {
            warn!(job_id = %record.job_id, error = %err, "failed to persist attempt start");
        }

        let mark_key = keys::synthesis_processed_key(&record.job.idempotency_key);
        // Probe before spending a token; a store outage reads as unprocessed.
        match self.state.is_processed(&mark_key).await {
            Ok(true) => {
                debug!(job_id = %record.job_id, key = %record.job.idempotency_key, "idempotency hit, skipping side effect");
                self.finish_completed(record).await;
                return;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(job_id = %record.job_id, error = %err, "idempotency probe failed, proceeding");
            }
        }

        if self.bucket.acquire(&self.cancel).await.is_err() {
            self.hand_back(record).await;
            return;
        }
        loop {
            match self.ops_limit.try_acquire() {
                Ok(()) => break,
                Err(wait) => {
                    self.rate_limit_hits.record();
                    tokio::select! {
                        _ = tokio::time::sleep(wait.max(Duration::from_millis(10))) => {}
                        _ = self.cancel.cancelled() => {
                            self.hand_back(record).await;
                            return;
                        }
                    }
                }
            }
        }

        match self.execute(&record.job).await {
            Ok(outcome) if outcome.ok => {
                if let Err(err) = self.state.mark_processed_nx(&mark_key).await {
                    warn!(job_id = %record.job_id, error = %err, "failed to record idempotency mark");
                }
                self.finish_completed(record).await;
            }
            Ok(outcome) if outcome.is_rate_limited() => {
                let retry_after = Duration::from_millis(outcome.retry_after_ms.unwrap_or(1_000));
                self.platform_429s.record();
                self.rate_limit_hits.record();
                counter!(
                    names::PLATFORM_429_TOTAL,
                    "type" => record.kind(),
                    "guild" => record.job.guild_id.clone(),
                    "global" => if outcome.global { "true" } else { "false" }
                )
                .increment(1);
                if outcome.global {
                    error!(
                        job_id = %record.job_id,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "global rate limit reached, halting new pickups"
                    );
                    self.halt.raise(retry_after);
                }
                self.retry_or_fail(record, "ratelimited", Some(retry_after)).await;
            }
            Ok(outcome) => {
                // Non-429 rejections do not improve on replay.
                let reason = outcome.error.unwrap_or_else(|| "rejected".into());
                self.fail(record, &reason, true).await;
            }
            Err(RestError::Unavailable(err)) => {
                warn!(job_id = %record.job_id, error = %err, "platform unavailable");
                self.retry_or_fail(record, "unavailable", None).await;
            }
        }
    }

    async fn execute(&self, job: &SynthesisJob) -> ApiResult {
        match &job.spec {
            JobSpec::CreateRole {
                name,
                color,
                hoist,
                mentionable,
                permissions,
            } => {
                let role = NewRole {
                    name: name.clone(),
                    color: *color,
                    hoist: *hoist,
                    mentionable: *mentionable,
                    permissions: permissions.clone(),
                };
                self.api.create_role(&job.guild_id, &role).await
            }
            JobSpec::DeleteRole { role_id } => self.api.delete_role(&job.guild_id, role_id).await,
            JobSpec::AssignRole { user_id, role_id } => {
                self.api.assign_role(&job.guild_id, user_id, role_id).await
            }
            JobSpec::RemoveRole { user_id, role_id } => {
                self.api.remove_role(&job.guild_id, user_id, role_id).await
            }
            JobSpec::CreateChannel {
                name,
                kind,
                parent_id,
                topic,
                overwrites,
            } => {
                let channel = NewChannel {
                    name: name.clone(),
                    kind: *kind,
                    parent_id: parent_id.clone(),
                    topic: topic.clone(),
                    overwrites: overwrites.clone(),
                };
                self.api.create_channel(&job.guild_id, &channel).await
            }
            JobSpec::DeleteChannel { channel_id } => self.api.delete_channel(channel_id).await,
            JobSpec::UpdatePermissions {
                channel_id,
                overwrites,
            } => {
                self.api
                    .update_channel_permissions(channel_id, overwrites)
                    .await
            }
        }
    }

    /// Returns a claimed job untouched after a shutdown-cancelled wait; the
    /// attempt is not counted.
    async fn hand_back(&self, mut record: JobRecord) {
        record.state = JobState::Waiting;
        record.attempts_made = record.attempts_made.saturating_sub(1);
        record.processed_at = None;
        if let Err(err) = self.store.update(&record).await {
            warn!(job_id = %record.job_id, error = %err, "failed to hand back job on shutdown");
        }
    }

    async fn finish_completed(&self, mut record: JobRecord) {
        record.state = JobState::Completed;
        record.finished_at = Some(OffsetDateTime::now_utc());
        record.not_before = None;
        if let Err(err) = self.store.update(&record).await {
            warn!(job_id = %record.job_id, error = %err, "failed to persist completion");
        }
        counter!(names::JOBS_COMPLETED_TOTAL, "type" => record.kind()).increment(1);
        debug!(job_id = %record.job_id, kind = record.kind(), "job completed");
    }

    async fn retry_or_fail(
        &self,
        mut record: JobRecord,
        reason: &str,
        retry_after: Option<Duration>,
    ) {
        if record.attempts_made >= self.config.max_attempts {
            self.fail(record, reason, false).await;
            return;
        }
        let delay = retry_delay(self.config.backoff_base, record.attempts_made, retry_after);
        record.state = JobState::Delayed;
        record.not_before =
            Some(OffsetDateTime::now_utc() + time::Duration::milliseconds(delay.as_millis() as i64));
        counter!(names::JOBS_RETRIED_TOTAL, "type" => record.kind()).increment(1);
        debug!(
            job_id = %record.job_id,
            attempt = record.attempts_made,
            delay_ms = delay.as_millis() as u64,
            reason,
            "scheduling retry"
        );
        if let Err(err) = self.store.update(&record).await {
            warn!(job_id = %record.job_id, error = %err, "failed to persist retry");
        }
    }

    async fn fail(&self, mut record: JobRecord, reason: &str, permanent: bool) {
        record.state = JobState::Failed;
        record.finished_at = Some(OffsetDateTime::now_utc());
        record.failed_reason = Some(reason.to_string());
        // A permanent rejection exhausts the attempt budget: `failed` always
        // means no attempts remain.
        if permanent {
            record.attempts_made = record.attempts_made.max(self.config.max_attempts);
        }
        if let Err(err) = self.store.update(&record).await {
            warn!(job_id = %record.job_id, error = %err, "failed to persist failure");
        }
        counter!(
            names::JOBS_FAILED_TOTAL,
            "type" => record.kind(),
            "reason" => reason.to_string()
        )
        .increment(1);
        error!(
            job_id = %record.job_id,
            kind = record.kind(),
            attempts = record.attempts_made,
            reason,
            "job failed"
        );
        if let Some(sink) = &self.dead_letters {
            let letter = DeadLetter::new(
                DeadLetterStage::Synthesis,
                record.job.community_id.clone(),
                record.job_id.clone(),
                record.attempts_made,
                reason,
                serde_json::to_value(&record.job).unwrap_or_default(),
            );
            if let Err(err) = sink.publish(letter).await {
                warn!(job_id = %record.job_id, error = %err, "dead letter publish failed");
            }
        }
    }
}
