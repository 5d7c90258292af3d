//! Key/value state store adapter.
//!
//! The core keeps no domain data of its own; this crate is the one place it
//! touches shared state: idempotency marks, cooldowns, short-lived sessions,
//! and windowed counters. Two implementations are provided: a JetStream
//! bucket for deployments and an in-memory map for tests and boot fallback.

mod jetstream;
mod memory;
mod state;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use jetstream::JetStreamKvStore;
pub use memory::MemoryKvStore;
pub use state::StateStore;

/// Store failures. `Unavailable` is deliberately the only transport variant:
/// callers decide between fail-open and fail-closed, not this crate.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("state store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    #[error("failed to encode state value: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode state value: {0}")]
    Decode(#[source] serde_json::Error),
}

impl KvError {
    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        KvError::Unavailable(err.into())
    }
}

/// Contract implemented by state stores. All operations are asynchronous and
/// may fail with [`KvError::Unavailable`].
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Writes `value` under `key`, replacing any previous value and resetting
    /// the TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// Put-if-absent. Returns `true` when this call created the key, `false`
    /// when it already existed (and its TTL is left untouched).
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Increments a counter scoped to the current fixed window and returns
    /// the post-increment value. Counters expire with their window.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, KvError>;

    /// Round-trip health probe.
    async fn ping(&self) -> Result<Duration, KvError>;
}
