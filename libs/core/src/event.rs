use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Dotted event tags delivered by the upstream gateway producer.
pub mod event_types {
    pub const MEMBER_JOIN: &str = "member.join";
    pub const MEMBER_LEAVE: &str = "member.leave";
    pub const MEMBER_UPDATE: &str = "member.update";
    pub const GUILD_CREATE: &str = "guild.create";
    pub const GUILD_DELETE: &str = "guild.delete";
    pub const MESSAGE_CREATE: &str = "message.create";
    pub const INTERACTION_PREFIX: &str = "interaction.";
    pub const INTERACTION_COMMAND_PREFIX: &str = "interaction.command.";
}

/// Normalized inbound event from the broker queue.
///
/// The wire format is UTF-8 JSON with camelCase keys; `data` stays opaque and
/// is deserialized lazily by whichever handler knows its shape.
///
/// ```
/// use guildsmith_core::EventEnvelope;
///
/// let body = br#"{
///   "eventId": "e-1",
///   "eventType": "member.join",
///   "guildId": "g-1",
///   "timestamp": 1700000000000,
///   "data": {"userId": "u-1"}
/// }"#;
/// let event = EventEnvelope::from_bytes(body).unwrap();
/// assert_eq!(event.event_type, "member.join");
/// assert!(!event.is_interaction());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String, // global idempotency key
    pub event_type: String,
    pub guild_id: String,
    /// Producer-side epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_token: Option<String>,
}

/// Why a broker payload could not be turned into an [`EventEnvelope`].
///
/// Both variants route the delivery to the dead-letter queue without
/// redelivery; they are kept distinct for logging and counters only.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("payload failed schema validation: {0}")]
    Invalid(&'static str),
}

impl EventEnvelope {
    /// Parses and validates a raw broker payload.
    pub fn from_bytes(body: &[u8]) -> Result<Self, EnvelopeError> {
        let event: EventEnvelope =
            serde_json::from_slice(body).map_err(EnvelopeError::Malformed)?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if self.event_id.is_empty() {
            return Err(EnvelopeError::Invalid("eventId must not be empty"));
        }
        if self.event_type.is_empty() {
            return Err(EnvelopeError::Invalid("eventType must not be empty"));
        }
        if self.guild_id.is_empty() {
            return Err(EnvelopeError::Invalid("guildId must not be empty"));
        }
        Ok(())
    }

    pub fn is_interaction(&self) -> bool {
        self.event_type.starts_with(event_types::INTERACTION_PREFIX)
    }

    /// Interaction id + token pair, present only on `interaction.*` events.
    pub fn interaction_ref(&self) -> Option<(&str, &str)> {
        match (&self.interaction_id, &self.interaction_token) {
            (Some(id), Some(token)) if !id.is_empty() && !token.is_empty() => {
                Some((id.as_str(), token.as_str()))
            }
            _ => None,
        }
    }

    /// Trailing command segment of an `interaction.command.*` tag.
    pub fn command_name(&self) -> Option<&str> {
        self.event_type
            .strip_prefix(event_types::INTERACTION_COMMAND_PREFIX)
            .filter(|rest| !rest.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: &str) -> Vec<u8> {
        json.as_bytes().to_vec()
    }

    #[test]
    fn parses_minimal_event() {
        let event = EventEnvelope::from_bytes(&body(
            r#"{"eventId":"e1","eventType":"member.join","guildId":"g1","timestamp":1}"#,
        ))
        .unwrap();
        assert_eq!(event.event_id, "e1");
        assert_eq!(event.data, Value::Null);
        assert!(event.interaction_ref().is_none());
    }

    #[test]
    fn rejects_invalid_json() {
        let err = EventEnvelope::from_bytes(b"invalid json").unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn rejects_empty_event_id() {
        let err = EventEnvelope::from_bytes(&body(
            r#"{"eventId":"","eventType":"member.join","guildId":"g1","timestamp":1}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, EnvelopeError::Invalid(_)));
    }

    #[test]
    fn rejects_missing_fields_as_malformed() {
        // serde surfaces a missing required key as a deserialization error.
        let err = EventEnvelope::from_bytes(&body(r#"{"eventId":"e1"}"#)).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn extracts_command_name() {
        let event = EventEnvelope::from_bytes(&body(
            r#"{"eventId":"e1","eventType":"interaction.command.verify","guildId":"g1",
               "timestamp":1,"interactionId":"i1","interactionToken":"t1"}"#,
        ))
        .unwrap();
        assert!(event.is_interaction());
        assert_eq!(event.command_name(), Some("verify"));
        assert_eq!(event.interaction_ref(), Some(("i1", "t1")));
    }

    #[test]
    fn empty_interaction_token_is_treated_as_absent() {
        let event = EventEnvelope::from_bytes(&body(
            r#"{"eventId":"e1","eventType":"interaction.command.verify","guildId":"g1",
               "timestamp":1,"interactionId":"i1","interactionToken":""}"#,
        ))
        .unwrap();
        assert!(event.interaction_ref().is_none());
    }
}
