//! Typed wrapper over the chat platform's HTTP API.
//!
//! Rate limiting is first-class: a 429 is returned as data
//! ([`CallOutcome::retry_after_ms`]) instead of an error, so the synthesis
//! engine can schedule around it. Network failures and 5xx responses surface
//! as [`RestError::Unavailable`].

mod http;
mod recording;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use guildsmith_core::{ChannelKind, PermissionOverwrite};

pub use http::HttpChatApi;
pub use recording::{CallRecord, RecordingChatApi, ScriptedResult};

#[derive(Debug, Error)]
pub enum RestError {
    #[error("chat platform unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl RestError {
    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        RestError::Unavailable(err.into())
    }
}

/// Structured result of one platform call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOutcome {
    pub ok: bool,
    /// Id of the created or affected resource (message, role, channel).
    pub message_id: Option<String>,
    /// Short error code (`"403"`, `"404"`, `"ratelimited"`) when `ok` is false.
    pub error: Option<String>,
    /// Present on 429 responses.
    pub retry_after_ms: Option<u64>,
    /// The platform signalled a global (not per-route) limit.
    pub global: bool,
    /// Raw response body for callers that need more than the id.
    pub raw: Option<Value>,
}

impl CallOutcome {
    pub fn success(message_id: Option<String>) -> Self {
        Self {
            ok: true,
            message_id,
            ..Self::default()
        }
    }

    pub fn rate_limited(retry_after_ms: u64, global: bool) -> Self {
        Self {
            ok: false,
            error: Some("ratelimited".into()),
            retry_after_ms: Some(retry_after_ms),
            global,
            ..Self::default()
        }
    }

    pub fn denied(code: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.retry_after_ms.is_some()
    }
}

pub type ApiResult = Result<CallOutcome, RestError>;

/// Role creation parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRole {
    pub name: String,
    pub color: Option<u32>,
    pub hoist: bool,
    pub mentionable: bool,
    pub permissions: Option<String>,
}

/// Channel creation parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub parent_id: Option<String>,
    pub topic: Option<String>,
    pub overwrites: Vec<PermissionOverwrite>,
}

/// The platform operations the core performs. Implementations must be cheap
/// to clone behind an `Arc`; consumers and the engine take the trait so tests
/// can substitute [`RecordingChatApi`].
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Interaction acknowledgement; unlocks the follow-up window.
    async fn defer_reply(&self, interaction_id: &str, token: &str) -> ApiResult;
    async fn send_followup(&self, token: &str, content: &str) -> ApiResult;
    async fn edit_original(&self, token: &str, content: &str) -> ApiResult;
    async fn assign_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> ApiResult;
    async fn remove_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> ApiResult;
    async fn send_dm(&self, user_id: &str, content: &str) -> ApiResult;
    async fn get_guild_member(&self, guild_id: &str, user_id: &str) -> ApiResult;
    async fn create_role(&self, guild_id: &str, role: &NewRole) -> ApiResult;
    async fn delete_role(&self, guild_id: &str, role_id: &str) -> ApiResult;
    async fn create_channel(&self, guild_id: &str, channel: &NewChannel) -> ApiResult;
    async fn delete_channel(&self, channel_id: &str) -> ApiResult;
    async fn update_channel_permissions(
        &self,
        channel_id: &str,
        overwrites: &[PermissionOverwrite],
    ) -> ApiResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_outcome_shape() {
        let outcome = CallOutcome::rate_limited(500, false);
        assert!(!outcome.ok);
        assert!(outcome.is_rate_limited());
        assert_eq!(outcome.retry_after_ms, Some(500));
        assert_eq!(outcome.error.as_deref(), Some("ratelimited"));
    }

    #[test]
    fn success_outcome_carries_id() {
        let outcome = CallOutcome::success(Some("123".into()));
        assert!(outcome.ok);
        assert!(!outcome.is_rate_limited());
        assert_eq!(outcome.message_id.as_deref(), Some("123"));
    }
}
