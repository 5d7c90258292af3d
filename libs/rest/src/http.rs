use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::{RequestBuilder, StatusCode, header::HeaderMap};
use serde_json::{Value, json};
use tracing::warn;

use guildsmith_core::{DiscordConfig, PermissionOverwrite};
use guildsmith_telemetry::names;

use crate::{ApiResult, CallOutcome, ChatApi, NewChannel, NewRole, RestError};

/// Reqwest-backed [`ChatApi`] against the Discord v10 REST surface.
pub struct HttpChatApi {
    http: reqwest::Client,
    config: DiscordConfig,
}

impl HttpChatApi {
    pub fn new(http: reqwest::Client, config: DiscordConfig) -> Self {
        Self { http, config }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("Authorization", format!("Bot {}", self.config.bot_token))
    }

    async fn execute(&self, operation: &'static str, req: RequestBuilder) -> ApiResult {
        let started = Instant::now();
        let response = req.send().await.map_err(|err| {
            counter!(names::OPERATIONS_TOTAL, "operation" => operation, "status" => "unavailable")
                .increment(1);
            RestError::unavailable(err)
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body_text = response.text().await.unwrap_or_default();
        let raw: Option<Value> = serde_json::from_str(&body_text).ok();
        histogram!(names::OPERATION_LATENCY_SECONDS, "operation" => operation)
            .record(started.elapsed().as_secs_f64());

        if status.is_success() {
            counter!(names::OPERATIONS_TOTAL, "operation" => operation, "status" => "ok")
                .increment(1);
            let message_id = raw
                .as_ref()
                .and_then(|v| v.get("id"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            return Ok(CallOutcome {
                ok: true,
                message_id,
                raw,
                ..CallOutcome::default()
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            counter!(names::OPERATIONS_TOTAL, "operation" => operation, "status" => "rate_limited")
                .increment(1);
            let retry_after = retry_after_ms(&headers, raw.as_ref()).unwrap_or(1_000);
            let global = global_limit(&headers, raw.as_ref());
            return Ok(CallOutcome {
                raw,
                ..CallOutcome::rate_limited(retry_after, global)
            });
        }

        if status.is_server_error() {
            counter!(names::OPERATIONS_TOTAL, "operation" => operation, "status" => "unavailable")
                .increment(1);
            return Err(RestError::Unavailable(anyhow!(
                "{operation} returned {}: {body_text}",
                status.as_u16()
            )));
        }

        counter!(names::OPERATIONS_TOTAL, "operation" => operation, "status" => "error")
            .increment(1);
        warn!(
            operation,
            status = status.as_u16(),
            body = %body_text,
            "platform rejected request"
        );
        Ok(CallOutcome {
            raw,
            ..CallOutcome::denied(status.as_u16().to_string())
        })
    }
}

/// Milliseconds to back off, from the `Retry-After` header (seconds) or the
/// response body's `retry_after` field (fractional seconds).
fn retry_after_ms(headers: &HeaderMap, body: Option<&Value>) -> Option<u64> {
    let from_header = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|secs| secs * 1000);
    from_header.or_else(|| {
        body.and_then(|v| v.get("retry_after"))
            .and_then(|v| v.as_f64())
            .map(|secs| (secs * 1000.0).ceil() as u64)
    })
}

fn global_limit(headers: &HeaderMap, body: Option<&Value>) -> bool {
    let from_header = headers
        .get("x-ratelimit-global")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    from_header
        || body
            .and_then(|v| v.get("global"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
}

fn overwrite_json(overwrite: &PermissionOverwrite) -> Value {
    json!({
        "id": overwrite.target_id,
        "type": match overwrite.kind {
            guildsmith_core::OverwriteKind::Role => 0,
            guildsmith_core::OverwriteKind::Member => 1,
        },
        "allow": overwrite.allow,
        "deny": overwrite.deny,
    })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn defer_reply(&self, interaction_id: &str, token: &str) -> ApiResult {
        // Callback type 5: deferred channel message with source.
        let url = self.url(&format!("interactions/{interaction_id}/{token}/callback"));
        self.execute("defer_reply", self.http.post(url).json(&json!({ "type": 5 })))
            .await
    }

    async fn send_followup(&self, token: &str, content: &str) -> ApiResult {
        let url = self.url(&format!("webhooks/{}/{token}", self.config.application_id));
        self.execute(
            "send_followup",
            self.http.post(url).json(&json!({ "content": content })),
        )
        .await
    }

    async fn edit_original(&self, token: &str, content: &str) -> ApiResult {
        let url = self.url(&format!(
            "webhooks/{}/{token}/messages/@original",
            self.config.application_id
        ));
        self.execute(
            "edit_original",
            self.http.patch(url).json(&json!({ "content": content })),
        )
        .await
    }

    async fn assign_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> ApiResult {
        let url = self.url(&format!("guilds/{guild_id}/members/{user_id}/roles/{role_id}"));
        self.execute("assign_role", self.authed(self.http.put(url)))
            .await
    }

    async fn remove_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> ApiResult {
        let url = self.url(&format!("guilds/{guild_id}/members/{user_id}/roles/{role_id}"));
        self.execute("remove_role", self.authed(self.http.delete(url)))
            .await
    }

    async fn send_dm(&self, user_id: &str, content: &str) -> ApiResult {
        let open = self
            .execute(
                "send_dm",
                self.authed(self.http.post(self.url("users/@me/channels")))
                    .json(&json!({ "recipient_id": user_id })),
            )
            .await?;
        if !open.ok {
            return Ok(open);
        }
        let Some(channel_id) = open.message_id else {
            return Ok(CallOutcome::denied("dm_channel_missing_id"));
        };
        let url = self.url(&format!("channels/{channel_id}/messages"));
        self.execute(
            "send_dm",
            self.authed(self.http.post(url)).json(&json!({ "content": content })),
        )
        .await
    }

    async fn get_guild_member(&self, guild_id: &str, user_id: &str) -> ApiResult {
        let url = self.url(&format!("guilds/{guild_id}/members/{user_id}"));
        self.execute("get_guild_member", self.authed(self.http.get(url)))
            .await
    }

    async fn create_role(&self, guild_id: &str, role: &NewRole) -> ApiResult {
        let mut body = json!({
            "name": role.name,
            "hoist": role.hoist,
            "mentionable": role.mentionable,
        });
        if let Some(color) = role.color {
            body["color"] = json!(color);
        }
        if let Some(permissions) = &role.permissions {
            body["permissions"] = json!(permissions);
        }
        let url = self.url(&format!("guilds/{guild_id}/roles"));
        self.execute("create_role", self.authed(self.http.post(url)).json(&body))
            .await
    }

    async fn delete_role(&self, guild_id: &str, role_id: &str) -> ApiResult {
        let url = self.url(&format!("guilds/{guild_id}/roles/{role_id}"));
        self.execute("delete_role", self.authed(self.http.delete(url)))
            .await
    }

    async fn create_channel(&self, guild_id: &str, channel: &NewChannel) -> ApiResult {
        let mut body = json!({
            "name": channel.name,
            "type": channel.kind.discord_type(),
        });
        if let Some(parent) = &channel.parent_id {
            body["parent_id"] = json!(parent);
        }
        if let Some(topic) = &channel.topic {
            body["topic"] = json!(topic);
        }
        if !channel.overwrites.is_empty() {
            body["permission_overwrites"] =
                Value::Array(channel.overwrites.iter().map(overwrite_json).collect());
        }
        let url = self.url(&format!("guilds/{guild_id}/channels"));
        self.execute(
            "create_channel",
            self.authed(self.http.post(url)).json(&body),
        )
        .await
    }

    async fn delete_channel(&self, channel_id: &str) -> ApiResult {
        let url = self.url(&format!("channels/{channel_id}"));
        self.execute("delete_channel", self.authed(self.http.delete(url)))
            .await
    }

    async fn update_channel_permissions(
        &self,
        channel_id: &str,
        overwrites: &[PermissionOverwrite],
    ) -> ApiResult {
        let body = json!({
            "permission_overwrites":
                Value::Array(overwrites.iter().map(overwrite_json).collect()),
        });
        let url = self.url(&format!("channels/{channel_id}"));
        self.execute(
            "update_permissions",
            self.authed(self.http.patch(url)).json(&body),
        )
        .await
    }
}
