//! Logical key layout for the shared state store.
//!
//! Keys use colon-delimited prefixes; the JetStream-backed store maps them to
//! bucket-legal names at the adapter boundary.

pub const EVENT_PROCESSED_PREFIX: &str = "event:processed:";
pub const SYNTHESIS_PROCESSED_PREFIX: &str = "synthesis:processed:";
pub const COOLDOWN_PREFIX: &str = "cooldown:";
pub const SESSION_PREFIX: &str = "session:";

/// Idempotency key recording that an inbound event's side effects ran.
pub fn event_processed_key(event_id: &str) -> String {
    format!("{EVENT_PROCESSED_PREFIX}{event_id}")
}

/// Idempotency key recording that an outbound mutation executed.
pub fn synthesis_processed_key(idempotency_key: &str) -> String {
    format!("{SYNTHESIS_PROCESSED_PREFIX}{idempotency_key}")
}

pub fn cooldown_key(scope: &str, subject: &str) -> String {
    format!("{COOLDOWN_PREFIX}{scope}:{subject}")
}

pub fn session_key(scope: &str, subject: &str) -> String {
    format!("{SESSION_PREFIX}{scope}:{subject}")
}
