use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use guildsmith_core::{EventEnvelope, keys};
use guildsmith_kv::StateStore;

use crate::{AckDecision, Dispatcher, HandlerError};

/// One guild-event handler, registered per `eventType`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Idempotent event dispatch (membership and guild lifecycle events).
///
/// Unknown event types ack immediately so one stray producer cannot block the
/// queue. The idempotency probe fails open: when the state store is down,
/// processing continues and a duplicate side effect is accepted over a stall.
pub struct EventDispatcher {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    state: StateStore,
}

impl EventDispatcher {
    pub fn new(state: StateStore) -> Self {
        Self {
            handlers: HashMap::new(),
            state,
        }
    }

    pub fn register(mut self, event_type: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type.to_string(), handler);
        self
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }
}

#[async_trait]
impl Dispatcher for EventDispatcher {
    async fn dispatch(&self, event: EventEnvelope) -> AckDecision {
        let Some(handler) = self.handlers.get(&event.event_type) else {
            debug!(event_type = %event.event_type, event_id = %event.event_id, "no handler, acking");
            return AckDecision::Ack;
        };

        let mark = keys::event_processed_key(&event.event_id);
        match self.state.is_processed(&mark).await {
            Ok(true) => {
                debug!(event_id = %event.event_id, "event already processed");
                return AckDecision::Ack;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(event_id = %event.event_id, error = %err, "idempotency probe failed, processing anyway");
            }
        }

        match handler.handle(&event).await {
            Ok(()) => {
                if let Err(err) = self.state.mark_processed(&mark).await {
                    warn!(event_id = %event.event_id, error = %err, "failed to record processed mark");
                }
                AckDecision::Ack
            }
            Err(HandlerError::Transient(err)) => {
                warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %err,
                    "transient handler failure, requeueing"
                );
                AckDecision::Requeue
            }
            Err(HandlerError::Permanent(err)) => {
                warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %err,
                    "permanent handler failure, dropping"
                );
                AckDecision::Drop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;
    use guildsmith_core::event_types;
    use guildsmith_kv::{KvError, KvStore, MemoryKvStore};

    struct CountingHandler {
        calls: AtomicUsize,
        result: Mutex<Option<HandlerError>>,
    }

    impl CountingHandler {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result: Mutex::new(None),
            })
        }

        fn failing(err: HandlerError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result: Mutex::new(Some(err)),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &EventEnvelope) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.result.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    /// Store whose reads fail, for outage behavior.
    struct BrokenKv;

    #[async_trait]
    impl KvStore for BrokenKv {
        async fn exists(&self, _key: &str) -> Result<bool, KvError> {
            Err(KvError::unavailable(anyhow!("kv down")))
        }
        async fn get(&self, _key: &str) -> Result<Option<String>, KvError> {
            Err(KvError::unavailable(anyhow!("kv down")))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), KvError> {
            Err(KvError::unavailable(anyhow!("kv down")))
        }
        async fn set_nx(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool, KvError> {
            Err(KvError::unavailable(anyhow!("kv down")))
        }
        async fn delete(&self, _key: &str) -> Result<(), KvError> {
            Err(KvError::unavailable(anyhow!("kv down")))
        }
        async fn incr_window(&self, _key: &str, _window: Duration) -> Result<u64, KvError> {
            Err(KvError::unavailable(anyhow!("kv down")))
        }
        async fn ping(&self) -> Result<Duration, KvError> {
            Err(KvError::unavailable(anyhow!("kv down")))
        }
    }

    fn state() -> StateStore {
        StateStore::new(Arc::new(MemoryKvStore::new()), Duration::from_secs(86_400))
    }

    fn join_event(event_id: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: event_id.into(),
            event_type: event_types::MEMBER_JOIN.into(),
            guild_id: "g1".into(),
            timestamp: 1_700_000_000_000,
            data: serde_json::json!({"userId": "u1"}),
            interaction_id: None,
            interaction_token: None,
        }
    }

    #[tokio::test]
    async fn duplicate_event_runs_side_effect_once() {
        let state = state();
        let handler = CountingHandler::succeeding();
        let dispatcher = EventDispatcher::new(state.clone())
            .register(event_types::MEMBER_JOIN, handler.clone());

        assert_eq!(dispatcher.dispatch(join_event("e1")).await, AckDecision::Ack);
        assert_eq!(dispatcher.dispatch(join_event("e1")).await, AckDecision::Ack);

        assert_eq!(handler.calls(), 1, "second delivery must not re-run the handler");
        assert!(state
            .is_processed(&keys::event_processed_key("e1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unknown_event_type_acks_without_marking() {
        let state = state();
        let dispatcher = EventDispatcher::new(state.clone());
        assert_eq!(dispatcher.dispatch(join_event("e2")).await, AckDecision::Ack);
        assert!(!state
            .is_processed(&keys::event_processed_key("e2"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn transient_failure_requeues_without_marking() {
        let state = state();
        let handler = CountingHandler::failing(HandlerError::transient(anyhow!("platform 503")));
        let dispatcher = EventDispatcher::new(state.clone())
            .register(event_types::MEMBER_JOIN, handler.clone());

        assert_eq!(
            dispatcher.dispatch(join_event("e3")).await,
            AckDecision::Requeue
        );
        assert!(!state
            .is_processed(&keys::event_processed_key("e3"))
            .await
            .unwrap());

        // Redelivery succeeds once the failure clears.
        assert_eq!(dispatcher.dispatch(join_event("e3")).await, AckDecision::Ack);
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_drops() {
        let handler = CountingHandler::failing(HandlerError::permanent(anyhow!("bad payload")));
        let dispatcher =
            EventDispatcher::new(state()).register(event_types::MEMBER_JOIN, handler);
        assert_eq!(dispatcher.dispatch(join_event("e4")).await, AckDecision::Drop);
    }

    #[tokio::test]
    async fn kv_outage_fails_open() {
        let state = StateStore::new(Arc::new(BrokenKv), Duration::from_secs(86_400));
        let handler = CountingHandler::succeeding();
        let dispatcher =
            EventDispatcher::new(state).register(event_types::MEMBER_JOIN, handler.clone());

        // exists() and set() both fail; the event still processes and acks.
        assert_eq!(dispatcher.dispatch(join_event("e5")).await, AckDecision::Ack);
        assert_eq!(handler.calls(), 1);
    }
}
