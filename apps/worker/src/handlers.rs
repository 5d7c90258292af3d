//! Concrete event and command handlers wired into the consumers.
//!
//! These stay deliberately thin: they translate event payloads into synthesis
//! jobs and short platform replies. Richer community logic (conviction tiers,
//! badges) lives upstream and arrives pre-resolved in the event `data`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use guildsmith_consumer::{
    CommandHandler, EventDispatcher, EventHandler, HandlerError, InteractionDispatcher,
};
use guildsmith_core::{EventEnvelope, JobSpec, SynthesisJob, SynthesisManifest, event_types};
use guildsmith_engine::SynthesisEngine;
use guildsmith_kv::StateStore;
use guildsmith_rest::ChatApi;

const WELCOME_DM_COOLDOWN: Duration = Duration::from_secs(86_400);
const MEMBER_SESSION_SCOPE: &str = "member";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberEventData {
    user_id: String,
    #[serde(default)]
    community_id: Option<String>,
    #[serde(default)]
    entry_role_id: Option<String>,
    #[serde(default)]
    welcome_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuildCreateData {
    #[serde(default)]
    community_id: Option<String>,
    #[serde(default)]
    manifest: Option<SynthesisManifest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleCommandData {
    user_id: String,
    role_id: String,
    #[serde(default)]
    community_id: Option<String>,
}

fn community_of(explicit: Option<String>, event: &EventEnvelope) -> String {
    explicit.unwrap_or_else(|| event.guild_id.clone())
}

/// `member.join`: assign the community's entry role through the engine and
/// send a welcome DM at most once per cooldown window.
struct MemberJoin {
    engine: Arc<SynthesisEngine>,
    state: StateStore,
    api: Arc<dyn ChatApi>,
}

#[async_trait]
impl EventHandler for MemberJoin {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let data: MemberEventData =
            serde_json::from_value(event.data.clone()).map_err(HandlerError::permanent)?;

        if let Some(role_id) = &data.entry_role_id {
            let community_id = community_of(data.community_id.clone(), event);
            let job = SynthesisJob {
                spec: JobSpec::AssignRole {
                    user_id: data.user_id.clone(),
                    role_id: role_id.clone(),
                },
                guild_id: event.guild_id.clone(),
                community_id,
                idempotency_key: format!(
                    "assign:{}:{}:{}",
                    event.guild_id, data.user_id, role_id
                ),
                priority: None,
                delay_ms: None,
            };
            self.engine.enqueue(job).await.map_err(HandlerError::transient)?;
        }

        if let Some(welcome) = &data.welcome_message {
            // Cooldown read failures count as "not on cooldown": a duplicate
            // DM beats losing the join processing.
            let on_cooldown = self
                .state
                .cooldown_active("welcome-dm", &data.user_id)
                .await
                .unwrap_or(false);
            if !on_cooldown {
                match self.api.send_dm(&data.user_id, welcome).await {
                    Ok(outcome) if outcome.ok => {
                        if let Err(err) = self
                            .state
                            .set_cooldown("welcome-dm", &data.user_id, WELCOME_DM_COOLDOWN)
                            .await
                        {
                            warn!(user = %data.user_id, error = %err, "failed to set welcome cooldown");
                        }
                    }
                    Ok(outcome) => {
                        debug!(user = %data.user_id, error = ?outcome.error, "welcome DM refused");
                    }
                    Err(err) => {
                        // The join itself succeeded; a missed DM is not worth
                        // a redelivery.
                        warn!(user = %data.user_id, error = %err, "welcome DM failed");
                    }
                }
            }
        }
        Ok(())
    }
}

/// `member.leave`: clear per-member state.
struct MemberLeave {
    state: StateStore,
}

#[async_trait]
impl EventHandler for MemberLeave {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let data: MemberEventData =
            serde_json::from_value(event.data.clone()).map_err(HandlerError::permanent)?;
        self.state
            .delete_session(MEMBER_SESSION_SCOPE, &data.user_id)
            .await
            .map_err(HandlerError::transient)?;
        self.state
            .clear_cooldown("welcome-dm", &data.user_id)
            .await
            .map_err(HandlerError::transient)?;
        Ok(())
    }
}

/// `guild.create`: bootstrap the community's roles and channels.
struct GuildCreate {
    engine: Arc<SynthesisEngine>,
}

#[async_trait]
impl EventHandler for GuildCreate {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let data: GuildCreateData =
            serde_json::from_value(event.data.clone()).map_err(HandlerError::permanent)?;
        let Some(manifest) = data.manifest else {
            debug!(guild = %event.guild_id, "guild.create without manifest, nothing to synthesize");
            return Ok(());
        };
        let community_id = community_of(data.community_id, event);
        let receipt = self
            .engine
            .enqueue_batch(&community_id, &event.guild_id, &manifest)
            .await
            .map_err(HandlerError::transient)?;
        debug!(
            guild = %event.guild_id,
            community = %community_id,
            jobs = receipt.count,
            "bootstrap manifest enqueued"
        );
        Ok(())
    }
}

/// `/verify`: assign the verified role and confirm via follow-up.
struct VerifyCommand {
    engine: Arc<SynthesisEngine>,
    api: Arc<dyn ChatApi>,
}

#[async_trait]
impl CommandHandler for VerifyCommand {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let data: RoleCommandData =
            serde_json::from_value(event.data.clone()).map_err(HandlerError::permanent)?;
        let community_id = community_of(data.community_id, event);
        let job = SynthesisJob {
            spec: JobSpec::AssignRole {
                user_id: data.user_id.clone(),
                role_id: data.role_id.clone(),
            },
            guild_id: event.guild_id.clone(),
            community_id,
            idempotency_key: format!(
                "assign:{}:{}:{}",
                event.guild_id, data.user_id, data.role_id
            ),
            priority: Some(1),
            delay_ms: None,
        };
        self.engine.enqueue(job).await.map_err(HandlerError::transient)?;

        if let Some((_, token)) = event.interaction_ref() {
            match self.api.send_followup(token, "Verification queued. Your role lands shortly.").await {
                Ok(outcome) if !outcome.ok => {
                    debug!(error = ?outcome.error, "verify follow-up refused");
                }
                Err(err) => warn!(error = %err, "verify follow-up failed"),
                _ => {}
            }
        }
        Ok(())
    }
}

/// `/setup`: expand the supplied manifest and report the queue depth.
struct SetupCommand {
    engine: Arc<SynthesisEngine>,
    api: Arc<dyn ChatApi>,
}

#[async_trait]
impl CommandHandler for SetupCommand {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let data: GuildCreateData =
            serde_json::from_value(event.data.clone()).map_err(HandlerError::permanent)?;
        let manifest = data.manifest.unwrap_or_default();
        let community_id = community_of(data.community_id, event);
        let receipt = self
            .engine
            .enqueue_batch(&community_id, &event.guild_id, &manifest)
            .await
            .map_err(HandlerError::transient)?;

        if let Some((_, token)) = event.interaction_ref() {
            let summary = format!("Queued {} synthesis jobs for this guild.", receipt.count);
            if let Err(err) = self.api.send_followup(token, &summary).await {
                warn!(error = %err, "setup follow-up failed");
            }
        }
        Ok(())
    }
}

/// Builds the event dispatcher with the standard handler set.
pub fn event_dispatcher(
    state: StateStore,
    engine: Arc<SynthesisEngine>,
    api: Arc<dyn ChatApi>,
) -> EventDispatcher {
    EventDispatcher::new(state.clone())
        .register(
            event_types::MEMBER_JOIN,
            Arc::new(MemberJoin {
                engine: engine.clone(),
                state: state.clone(),
                api,
            }),
        )
        .register(event_types::MEMBER_LEAVE, Arc::new(MemberLeave { state }))
        .register(event_types::GUILD_CREATE, Arc::new(GuildCreate { engine }))
}

/// Builds the interaction dispatcher with the standard command set.
pub fn interaction_dispatcher(
    engine: Arc<SynthesisEngine>,
    api: Arc<dyn ChatApi>,
) -> InteractionDispatcher {
    InteractionDispatcher::new(api.clone())
        .register(
            "verify",
            Arc::new(VerifyCommand {
                engine: engine.clone(),
                api: api.clone(),
            }),
        )
        .register("setup", Arc::new(SetupCommand { engine, api }))
}
