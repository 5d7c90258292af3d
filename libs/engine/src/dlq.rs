//! Dead-letter publication for exhausted jobs and dropped deliveries.
//!
//! Letters land on a dedicated work-queue stream so operators can inspect and
//! replay them without touching the live queues.

use std::sync::Mutex;

use anyhow::{Context as _, Result};
use async_nats::jetstream::{
    Context as JsContext,
    stream::{Config as StreamConfig, RetentionPolicy},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::info;

const DLQ_STREAM_NAME: &str = "GUILDSMITH-DLQ";
const DLQ_SUBJECT_PREFIX: &str = "dlq.guildsmith";

/// Pipeline stage a letter came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStage {
    Event,
    Interaction,
    Synthesis,
}

impl DeadLetterStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStage::Event => "event",
            DeadLetterStage::Interaction => "interaction",
            DeadLetterStage::Synthesis => "synthesis",
        }
    }
}

/// Payload stored for each dead letter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub stage: DeadLetterStage,
    pub community_id: String,
    /// Job id or event id, whichever the stage tracks.
    pub ref_id: String,
    pub attempts: u32,
    pub reason: String,
    pub ts: String,
    pub payload: Value,
}

impl DeadLetter {
    pub fn new(
        stage: DeadLetterStage,
        community_id: impl Into<String>,
        ref_id: impl Into<String>,
        attempts: u32,
        reason: impl Into<String>,
        payload: Value,
    ) -> Self {
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into());
        Self {
            stage,
            community_id: community_id.into(),
            ref_id: ref_id.into(),
            attempts,
            reason: reason.into(),
            ts,
            payload,
        }
    }

    pub fn subject(&self) -> String {
        format!("{DLQ_SUBJECT_PREFIX}.{}.{}", self.stage.as_str(), self.community_id)
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: DeadLetter) -> Result<()>;
}

/// JetStream-backed sink; the DLQ stream is ensured at construction.
pub struct NatsDeadLetters {
    js: JsContext,
}

impl NatsDeadLetters {
    pub async fn new(js: JsContext) -> Result<Self> {
        let cfg = StreamConfig {
            name: DLQ_STREAM_NAME.into(),
            subjects: vec![format!("{DLQ_SUBJECT_PREFIX}.>")],
            retention: RetentionPolicy::WorkQueue,
            max_messages: -1,
            max_messages_per_subject: -1,
            max_bytes: -1,
            description: Some("guildsmith dead letters".into()),
            ..StreamConfig::default()
        };
        if js.get_stream(DLQ_STREAM_NAME).await.is_err() {
            js.create_stream(cfg).await.context("create DLQ stream")?;
        }
        Ok(Self { js })
    }
}

#[async_trait]
impl DeadLetterSink for NatsDeadLetters {
    async fn publish(&self, letter: DeadLetter) -> Result<()> {
        let subject = letter.subject();
        let payload = serde_json::to_vec(&letter)?;
        self.js
            .publish(subject.clone(), payload.into())
            .await
            .with_context(|| format!("publish dead letter to {subject}"))?;
        info!(
            stage = letter.stage.as_str(),
            community = %letter.community_id,
            ref_id = %letter.ref_id,
            reason = %letter.reason,
            "dead letter published"
        );
        Ok(())
    }
}

/// Collecting sink for tests.
#[derive(Default)]
pub struct MemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn publish(&self, letter: DeadLetter) -> Result<()> {
        self.letters.lock().unwrap().push(letter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subject_encodes_stage_and_community() {
        let letter = DeadLetter::new(
            DeadLetterStage::Synthesis,
            "acme",
            "job-1",
            3,
            "unavailable",
            json!({"type": "create_role"}),
        );
        assert_eq!(letter.subject(), "dlq.guildsmith.synthesis.acme");
    }

    #[test]
    fn letter_roundtrips_json() {
        let letter = DeadLetter::new(
            DeadLetterStage::Event,
            "acme",
            "e-9",
            1,
            "malformed payload",
            json!({"raw": "aGk="}),
        );
        let encoded = serde_json::to_string(&letter).unwrap();
        let decoded: DeadLetter = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.stage, DeadLetterStage::Event);
        assert_eq!(decoded.ref_id, "e-9");
    }

    #[tokio::test]
    async fn memory_sink_collects() {
        let sink = MemoryDeadLetters::new();
        sink.publish(DeadLetter::new(
            DeadLetterStage::Synthesis,
            "acme",
            "job-1",
            3,
            "403",
            json!({}),
        ))
        .await
        .unwrap();
        assert_eq!(sink.letters().len(), 1);
    }
}
