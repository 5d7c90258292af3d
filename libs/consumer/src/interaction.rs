use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use guildsmith_core::EventEnvelope;
use guildsmith_rest::ChatApi;

use crate::{AckDecision, Dispatcher, HandlerError};

/// One slash-command handler, registered by command name (the trailing
/// segment of `interaction.command.<name>`). Handlers may enqueue synthesis
/// jobs and send the follow-up message themselves.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Two-phase interaction dispatch: the platform expects an acknowledgement
/// within ~3 seconds, so `defer_reply` goes out before the command handler
/// runs. Failures after the deferral drop the message; the platform's own
/// timeout surfaces the failure to the user.
pub struct InteractionDispatcher {
    commands: HashMap<String, Arc<dyn CommandHandler>>,
    api: Arc<dyn ChatApi>,
}

impl InteractionDispatcher {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self {
            commands: HashMap::new(),
            api,
        }
    }

    pub fn register(mut self, command: &str, handler: Arc<dyn CommandHandler>) -> Self {
        self.commands.insert(command.to_string(), handler);
        self
    }
}

#[async_trait]
impl Dispatcher for InteractionDispatcher {
    async fn dispatch(&self, event: EventEnvelope) -> AckDecision {
        if !event.is_interaction() {
            debug!(event_type = %event.event_type, "non-interaction payload on interaction queue, acking");
            return AckDecision::Ack;
        }
        let Some((interaction_id, token)) = event.interaction_ref() else {
            warn!(event_id = %event.event_id, "interaction without id/token, dropping");
            return AckDecision::Drop;
        };

        match self.api.defer_reply(interaction_id, token).await {
            Ok(outcome) if outcome.ok => {}
            Ok(outcome) => {
                // Expired or already-acknowledged token; nothing to retry.
                warn!(
                    event_id = %event.event_id,
                    error = outcome.error.as_deref().unwrap_or("rejected"),
                    "defer refused, dropping interaction"
                );
                return AckDecision::Drop;
            }
            Err(err) => {
                warn!(event_id = %event.event_id, error = %err, "defer failed, dropping interaction");
                return AckDecision::Drop;
            }
        }

        let Some(handler) = event.command_name().and_then(|name| self.commands.get(name)) else {
            debug!(event_type = %event.event_type, "no command handler, acking");
            return AckDecision::Ack;
        };

        match handler.handle(&event).await {
            Ok(()) => AckDecision::Ack,
            Err(err) => {
                // The deferred placeholder times out on the platform side.
                warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %err,
                    "command handler failed after defer, dropping"
                );
                AckDecision::Drop
            }
        }
    }
}
