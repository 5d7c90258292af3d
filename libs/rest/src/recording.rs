use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;

use guildsmith_core::PermissionOverwrite;

use crate::{ApiResult, CallOutcome, ChatApi, NewChannel, NewRole, RestError};

/// One observed call: operation name plus a compact argument summary.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub operation: String,
    pub detail: String,
}

/// Scripted response for one operation invocation.
#[derive(Debug, Clone)]
pub enum ScriptedResult {
    Outcome(CallOutcome),
    Unavailable(String),
}

/// In-memory [`ChatApi`] for tests: records every call and replays scripted
/// outcomes per operation, defaulting to success.
#[derive(Default)]
pub struct RecordingChatApi {
    calls: Mutex<Vec<CallRecord>>,
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResult>>>,
}

impl RecordingChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `result` for the next invocation of `operation`. Outcomes are
    /// consumed in FIFO order; once drained the operation succeeds again.
    pub fn script(&self, operation: &str, result: ScriptedResult) {
        self.scripts
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn record(&self, operation: &str, detail: String) -> ApiResult {
        self.calls.lock().unwrap().push(CallRecord {
            operation: operation.to_string(),
            detail,
        });
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(ScriptedResult::Outcome(outcome)) => Ok(outcome),
            Some(ScriptedResult::Unavailable(reason)) => Err(RestError::Unavailable(anyhow!(reason))),
            None => Ok(CallOutcome::success(Some(format!(
                "fake-{}",
                self.calls.lock().unwrap().len()
            )))),
        }
    }
}

#[async_trait]
impl ChatApi for RecordingChatApi {
    async fn defer_reply(&self, interaction_id: &str, token: &str) -> ApiResult {
        self.record("defer_reply", format!("{interaction_id}/{token}"))
    }

    async fn send_followup(&self, token: &str, content: &str) -> ApiResult {
        self.record("send_followup", format!("{token}:{content}"))
    }

    async fn edit_original(&self, token: &str, content: &str) -> ApiResult {
        self.record("edit_original", format!("{token}:{content}"))
    }

    async fn assign_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> ApiResult {
        self.record("assign_role", format!("{guild_id}/{user_id}/{role_id}"))
    }

    async fn remove_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> ApiResult {
        self.record("remove_role", format!("{guild_id}/{user_id}/{role_id}"))
    }

    async fn send_dm(&self, user_id: &str, content: &str) -> ApiResult {
        self.record("send_dm", format!("{user_id}:{content}"))
    }

    async fn get_guild_member(&self, guild_id: &str, user_id: &str) -> ApiResult {
        self.record("get_guild_member", format!("{guild_id}/{user_id}"))
    }

    async fn create_role(&self, guild_id: &str, role: &NewRole) -> ApiResult {
        self.record("create_role", format!("{guild_id}/{}", role.name))
    }

    async fn delete_role(&self, guild_id: &str, role_id: &str) -> ApiResult {
        self.record("delete_role", format!("{guild_id}/{role_id}"))
    }

    async fn create_channel(&self, guild_id: &str, channel: &NewChannel) -> ApiResult {
        self.record("create_channel", format!("{guild_id}/{}", channel.name))
    }

    async fn delete_channel(&self, channel_id: &str) -> ApiResult {
        self.record("delete_channel", channel_id.to_string())
    }

    async fn update_channel_permissions(
        &self,
        channel_id: &str,
        overwrites: &[PermissionOverwrite],
    ) -> ApiResult {
        self.record(
            "update_permissions",
            format!("{channel_id}:{}", overwrites.len()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_outcome_is_success() {
        let api = RecordingChatApi::new();
        let outcome = api.assign_role("g1", "u1", "r1").await.unwrap();
        assert!(outcome.ok);
        assert_eq!(api.call_count("assign_role"), 1);
    }

    #[tokio::test]
    async fn scripts_replay_in_order_then_default() {
        let api = RecordingChatApi::new();
        api.script(
            "create_role",
            ScriptedResult::Outcome(CallOutcome::rate_limited(500, false)),
        );
        api.script(
            "create_role",
            ScriptedResult::Unavailable("connection reset".into()),
        );

        let first = api.create_role("g1", &NewRole::default()).await.unwrap();
        assert!(first.is_rate_limited());

        let second = api.create_role("g1", &NewRole::default()).await;
        assert!(matches!(second, Err(RestError::Unavailable(_))));

        let third = api.create_role("g1", &NewRole::default()).await.unwrap();
        assert!(third.ok);
        assert_eq!(api.call_count("create_role"), 3);
    }
}
