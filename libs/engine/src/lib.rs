//! Durable synthesis job queue.
//!
//! Handlers enqueue typed guild mutations; a worker pool drains them against
//! the chat platform under the process-wide token bucket plus an engine-local
//! actions-per-second limit, with idempotency marks, exponential backoff, and
//! dead-letter publication for exhausted jobs.

mod backoff;
pub mod dlq;
mod engine;
mod record;
mod store;

use thiserror::Error;

pub use backoff::{full_jitter, retry_delay, scheduled_backoff};
pub use engine::{BatchReceipt, EngineStats, SynthesisEngine};
pub use record::{JobCounts, JobRecord, JobState};
pub use store::{JobStore, KvJobStore, MemoryJobStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job store unavailable: {0}")]
    Store(#[source] anyhow::Error),
    #[error("state store error: {0}")]
    State(#[from] guildsmith_kv::KvError),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {job_id} is {state}, refusing to {action}")]
    InvalidState {
        job_id: String,
        action: &'static str,
        state: &'static str,
    },
    #[error("engine is closed")]
    Closed,
}

impl EngineError {
    pub fn store(err: impl Into<anyhow::Error>) -> Self {
        EngineError::Store(err.into())
    }
}
