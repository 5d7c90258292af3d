//! Broker consumers.
//!
//! [`QueueConsumer`] owns the connection lifecycle for one queue: ensure the
//! stream and its explicit-ack consumer, dispatch deliveries, translate
//! handler outcomes into ack decisions, and drain cleanly on shutdown. The
//! event and interaction dispatchers layer the platform semantics on top.

mod base;
mod event;
mod interaction;

use async_trait::async_trait;
use thiserror::Error;

use guildsmith_core::EventEnvelope;

pub use base::{ConsumerStatus, QueueConsumer};
pub use event::{EventDispatcher, EventHandler};
pub use interaction::{CommandHandler, InteractionDispatcher};

/// What to do with a delivery once its handler finished.
///
/// `Drop` routes to the dead letter stream without redelivery; `Requeue` asks
/// the broker to redeliver later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Drop,
    Requeue,
}

impl AckDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckDecision::Ack => "ack",
            AckDecision::Drop => "drop",
            AckDecision::Requeue => "requeue",
        }
    }
}

/// Handler failure, classified by whoever can tell transient from permanent.
/// Transient failures requeue (broker redelivers); permanent ones drop.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("transient handler failure: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("permanent handler failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl HandlerError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Permanent(err.into())
    }
}

/// Maps a validated envelope to an ack decision. Implemented by the event and
/// interaction dispatchers; the queue consumer stays payload-agnostic.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, event: EventEnvelope) -> AckDecision;
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer is not connected")]
    NotConnected,
    #[error("consumer is already consuming")]
    AlreadyConsuming,
    #[error("broker error: {0}")]
    Broker(#[source] anyhow::Error),
}

impl ConsumerError {
    pub fn broker(err: impl Into<anyhow::Error>) -> Self {
        ConsumerError::Broker(err.into())
    }
}
