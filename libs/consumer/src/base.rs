use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_nats::jetstream::{
    AckKind,
    consumer::{AckPolicy, push},
    stream::{Config as StreamConfig, RetentionPolicy},
};
use futures::StreamExt;
use metrics::counter;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use guildsmith_core::EventEnvelope;
use guildsmith_engine::dlq::{DeadLetter, DeadLetterSink, DeadLetterStage};
use guildsmith_telemetry::names;

use crate::{AckDecision, ConsumerError, Dispatcher};

/// Point-in-time consumer state for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatus {
    pub connected: bool,
    pub consuming: bool,
    pub messages_processed: u64,
    pub messages_errored: u64,
}

/// Dispatch guts shared between the consume loop and direct test drives.
struct ConsumerInner {
    queue: String,
    stage: DeadLetterStage,
    dispatcher: Arc<dyn Dispatcher>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    connected: AtomicBool,
    consuming: AtomicBool,
    processed: AtomicU64,
    errored: AtomicU64,
}

impl ConsumerInner {
    /// Parses, dispatches, and counts one delivery. Malformed or
    /// schema-invalid payloads never reach the dispatcher; every dropped
    /// delivery leaves a dead letter carrying the raw payload.
    async fn handle_payload(&self, payload: &[u8]) -> AckDecision {
        let (decision, ref_id, reason) = match EventEnvelope::from_bytes(payload) {
            Ok(event) => {
                let event_id = event.event_id.clone();
                let decision = self.dispatcher.dispatch(event).await;
                (decision, event_id, "handler dropped delivery".to_string())
            }
            Err(err) => {
                warn!(queue = %self.queue, error = %err, "dropping undecodable delivery");
                (AckDecision::Drop, "unparsed".to_string(), err.to_string())
            }
        };
        match decision {
            AckDecision::Ack => {
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
            AckDecision::Requeue => {
                self.errored.fetch_add(1, Ordering::Relaxed);
            }
            AckDecision::Drop => {
                self.errored.fetch_add(1, Ordering::Relaxed);
                self.publish_raw_letter(payload, &ref_id, &reason).await;
            }
        }
        counter!(
            names::CONSUMER_MESSAGES_TOTAL,
            "queue" => self.queue.clone(),
            "outcome" => decision.as_str()
        )
        .increment(1);
        decision
    }

    async fn publish_raw_letter(&self, payload: &[u8], ref_id: &str, reason: &str) {
        let Some(sink) = &self.dead_letters else {
            return;
        };
        let body = serde_json::json!({
            "raw": String::from_utf8_lossy(payload),
        });
        let letter = DeadLetter::new(self.stage, "unknown", ref_id, 0, reason, body);
        if let Err(err) = sink.publish(letter).await {
            warn!(queue = %self.queue, error = %err, "dead letter publish failed");
        }
    }

    fn status(&self) -> ConsumerStatus {
        ConsumerStatus {
            connected: self.connected.load(Ordering::Acquire),
            consuming: self.consuming.load(Ordering::Acquire),
            messages_processed: self.processed.load(Ordering::Relaxed),
            messages_errored: self.errored.load(Ordering::Relaxed),
        }
    }
}

struct BrokerChannel {
    client: async_nats::Client,
    messages: Option<push::Messages>,
}

/// One queue subscription with explicit acks and bounded in-flight deliveries.
///
/// Lifecycle: `connect` → `start` → (`stop` ⟶ no new deliveries, in-flight
/// drains) → `close`. The consumer never reconnects on its own; an unexpected
/// broker close flips `connected` and is the supervisor's cue to restart.
pub struct QueueConsumer {
    broker_url: String,
    prefetch: usize,
    inner: Arc<ConsumerInner>,
    channel: Mutex<Option<BrokerChannel>>,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QueueConsumer {
    pub fn new(
        broker_url: impl Into<String>,
        queue: impl Into<String>,
        stage: DeadLetterStage,
        prefetch: usize,
        dispatcher: Arc<dyn Dispatcher>,
        dead_letters: Option<Arc<dyn DeadLetterSink>>,
    ) -> Self {
        Self {
            broker_url: broker_url.into(),
            prefetch: prefetch.max(1),
            inner: Arc::new(ConsumerInner {
                queue: queue.into(),
                stage,
                dispatcher,
                dead_letters,
                connected: AtomicBool::new(false),
                consuming: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                errored: AtomicU64::new(0),
            }),
            channel: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn status(&self) -> ConsumerStatus {
        self.inner.status()
    }

    /// Drives one raw payload through parse → dispatch → counters, exactly as
    /// the consume loop does. Tests use this to avoid a live broker.
    pub async fn dispatch_payload(&self, payload: &[u8]) -> AckDecision {
        self.inner.handle_payload(payload).await
    }

    /// Connects to the broker and ensures the stream plus its durable
    /// explicit-ack consumer. Prefetch maps to the consumer's max in-flight
    /// unacknowledged deliveries.
    pub async fn connect(&self) -> Result<(), ConsumerError> {
        let mut channel = self.channel.lock().await;
        if channel.is_some() {
            return Ok(());
        }

        let monitor = Arc::clone(&self.inner);
        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let monitor = Arc::clone(&monitor);
                async move {
                    match event {
                        async_nats::Event::Connected => {
                            monitor.connected.store(true, Ordering::Release);
                        }
                        async_nats::Event::Disconnected => {
                            // Not a shutdown we initiated; the supervisor
                            // decides whether to restart.
                            monitor.connected.store(false, Ordering::Release);
                            warn!(queue = %monitor.queue, "broker connection lost unexpectedly");
                        }
                        other => debug!(queue = %monitor.queue, event = %other, "broker event"),
                    }
                }
            })
            .connect(&self.broker_url)
            .await
            .map_err(ConsumerError::broker)?;

        let js = async_nats::jetstream::new(client.clone());
        let queue = &self.inner.queue;
        let stream = js
            .get_or_create_stream(StreamConfig {
                name: queue.clone(),
                subjects: vec![queue.clone()],
                retention: RetentionPolicy::WorkQueue,
                max_messages: -1,
                max_messages_per_subject: -1,
                max_bytes: -1,
                ..Default::default()
            })
            .await
            .map_err(ConsumerError::broker)?;

        let consumer_name = format!("{queue}-worker");
        let consumer = stream
            .get_or_create_consumer(
                &consumer_name,
                push::Config {
                    durable_name: Some(consumer_name.clone()),
                    deliver_subject: format!("deliver.{queue}"),
                    deliver_group: Some(queue.clone()),
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: self.prefetch as i64,
                    ..Default::default()
                },
            )
            .await
            .map_err(ConsumerError::broker)?;
        let messages = consumer.messages().await.map_err(ConsumerError::broker)?;

        *channel = Some(BrokerChannel {
            client,
            messages: Some(messages),
        });
        self.inner.connected.store(true, Ordering::Release);
        info!(queue = %queue, prefetch = self.prefetch, "consumer connected");
        Ok(())
    }

    /// Spawns the dispatch loop. Fails with `NotConnected` before `connect`.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut channel = self.channel.lock().await;
        let Some(chan) = channel.as_mut() else {
            return Err(ConsumerError::NotConnected);
        };
        if self.inner.consuming.load(Ordering::Acquire) {
            return Err(ConsumerError::AlreadyConsuming);
        }
        let Some(mut messages) = chan.messages.take() else {
            return Err(ConsumerError::broker(anyhow::anyhow!(
                "subscription already taken for {}",
                self.inner.queue
            )));
        };

        let cancel = {
            let mut guard = self.cancel.lock().await;
            *guard = CancellationToken::new();
            guard.clone()
        };
        let inner = Arc::clone(&self.inner);
        inner.consuming.store(true, Ordering::Release);

        let task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = messages.next() => next,
                    _ = cancel.cancelled() => break,
                };
                match next {
                    Some(Ok(msg)) => {
                        let decision = inner.handle_payload(&msg.payload).await;
                        let ack_result = match decision {
                            AckDecision::Ack => msg.ack().await,
                            AckDecision::Requeue => msg.ack_with(AckKind::Nak(None)).await,
                            AckDecision::Drop => msg.ack_with(AckKind::Term).await,
                        };
                        if let Err(err) = ack_result {
                            warn!(queue = %inner.queue, error = %err, "ack failed");
                        }
                    }
                    Some(Err(err)) => {
                        warn!(queue = %inner.queue, error = %err, "delivery stream error");
                    }
                    None => {
                        error!(queue = %inner.queue, "delivery stream closed unexpectedly");
                        inner.connected.store(false, Ordering::Release);
                        break;
                    }
                }
            }
            inner.consuming.store(false, Ordering::Release);
            debug!(queue = %inner.queue, "dispatch loop exited");
        });
        *self.task.lock().await = Some(task);
        info!(queue = %self.inner.queue, "consumer started");
        Ok(())
    }

    /// Cancels the subscription. No new deliveries are dispatched; the
    /// in-flight handler finishes and acks before this returns.
    pub async fn stop(&self) {
        self.cancel.lock().await.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(err) = task.await {
                warn!(queue = %self.inner.queue, error = %err, "dispatch task join failed");
            }
        }
        self.inner.consuming.store(false, Ordering::Release);
    }

    /// Terminal: drains via [`Self::stop`] and drops the connection.
    pub async fn close(&self) {
        self.stop().await;
        let mut channel = self.channel.lock().await;
        if let Some(chan) = channel.take() {
            drop(chan.client);
        }
        self.inner.connected.store(false, Ordering::Release);
        info!(queue = %self.inner.queue, "consumer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct AckEverything;

    #[async_trait]
    impl Dispatcher for AckEverything {
        async fn dispatch(&self, _event: EventEnvelope) -> AckDecision {
            AckDecision::Ack
        }
    }

    fn consumer() -> QueueConsumer {
        QueueConsumer::new(
            "nats://127.0.0.1:4222",
            "test-queue",
            DeadLetterStage::Event,
            10,
            Arc::new(AckEverything),
            None,
        )
    }

    #[tokio::test]
    async fn start_before_connect_is_refused() {
        let consumer = consumer();
        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, ConsumerError::NotConnected));
        assert!(!consumer.status().connected);
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_and_counted() {
        let consumer = consumer();
        let decision = consumer.dispatch_payload(b"invalid json").await;
        assert_eq!(decision, AckDecision::Drop);

        // Valid JSON failing schema validation takes the same path.
        let decision = consumer.dispatch_payload(br#"{"eventId":""}"#).await;
        assert_eq!(decision, AckDecision::Drop);

        let status = consumer.status();
        assert_eq!(status.messages_errored, 2);
        assert_eq!(status.messages_processed, 0);
    }

    #[tokio::test]
    async fn valid_payload_reaches_dispatcher() {
        let consumer = consumer();
        let decision = consumer
            .dispatch_payload(
                br#"{"eventId":"e1","eventType":"member.join","guildId":"g1","timestamp":1}"#,
            )
            .await;
        assert_eq!(decision, AckDecision::Ack);
        assert_eq!(consumer.status().messages_processed, 1);
    }
}
