use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::serde::rfc3339;

use guildsmith_core::SynthesisJob;

/// Queue-internal job lifecycle.
///
/// `Completed` and `Failed` are terminal; `Delayed` covers both caller-set
/// delays and retry backoff windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A [`SynthesisJob`] plus the bookkeeping the queue tracks for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub job: SynthesisJob,
    pub state: JobState,
    pub attempts_made: u32,
    pub priority: i32,
    /// Earliest instant the job may be picked up; set for `Delayed` jobs.
    #[serde(with = "rfc3339::option")]
    pub not_before: Option<OffsetDateTime>,
    #[serde(with = "rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(with = "rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub failed_reason: Option<String>,
}

impl JobRecord {
    pub fn new(job_id: String, job: SynthesisJob, now: OffsetDateTime) -> Self {
        let priority = job.priority.unwrap_or(0);
        let delay = job.delay_ms.unwrap_or(0);
        let (state, not_before) = if delay > 0 {
            (
                JobState::Delayed,
                Some(now + time::Duration::milliseconds(delay as i64)),
            )
        } else {
            (JobState::Waiting, None)
        };
        Self {
            job_id,
            job,
            state,
            attempts_made: 0,
            priority,
            not_before,
            created_at: now,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
        }
    }

    /// Ready to be claimed: waiting, or delayed past its `not_before`.
    pub fn is_ready(&self, now: OffsetDateTime) -> bool {
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.not_before.map(|t| t <= now).unwrap_or(true),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.job.spec.kind()
    }
}

/// Per-state queue depths, reported by `stats()` and the depth gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guildsmith_core::JobSpec;

    fn job(delay_ms: Option<u64>) -> SynthesisJob {
        SynthesisJob {
            spec: JobSpec::DeleteRole {
                role_id: "r1".into(),
            },
            guild_id: "g1".into(),
            community_id: "acme".into(),
            idempotency_key: "k1".into(),
            priority: Some(2),
            delay_ms,
        }
    }

    #[test]
    fn fresh_record_is_waiting_and_ready() {
        let now = OffsetDateTime::now_utc();
        let record = JobRecord::new("j1".into(), job(None), now);
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.priority, 2);
        assert!(record.is_ready(now));
    }

    #[test]
    fn delayed_record_ripens() {
        let now = OffsetDateTime::now_utc();
        let record = JobRecord::new("j1".into(), job(Some(500)), now);
        assert_eq!(record.state, JobState::Delayed);
        assert!(!record.is_ready(now));
        assert!(record.is_ready(now + time::Duration::seconds(1)));
    }

    #[test]
    fn record_roundtrips_json() {
        let now = OffsetDateTime::now_utc();
        let record = JobRecord::new("j1".into(), job(Some(100)), now);
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: JobRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.job_id, "j1");
        assert_eq!(decoded.state, JobState::Delayed);
        assert_eq!(decoded.kind(), "delete_role");
    }
}
