//! Event envelope serialization
//!
//! Wraps a raw dispatch in a self-describing JSON envelope for downstream
//! consumers (the binary logs them; a broker could publish them).

use serde::Serialize;
use serde_json::value::RawValue;
use uuid::Uuid;

use super::DispatchEvent;

/// Dispatch payload plus routing metadata
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub event_id: String,
    /// Dotted lowercase name, e.g. `guild.create`
    pub event_type: String,
    pub shard_id: u64,
    pub sequence: u64,
    /// Unix milliseconds at serialization time
    pub timestamp: u64,
    pub guild_id: Option<String>,
    pub data: Box<RawValue>,
}

/// Only the routing key is pulled out of the payload.
#[derive(serde::Deserialize)]
struct GuildScope<'a> {
    #[serde(borrow, default)]
    guild_id: Option<&'a str>,
}

/// Build the envelope for `event`.
///
/// Returns None for lifecycle events that only matter to the connection
/// itself (READY, RESUMED).
pub fn serialize_event(event: &DispatchEvent) -> Option<EventEnvelope> {
    if matches!(event.event_type.as_str(), "READY" | "RESUMED") {
        return None;
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    // Payloads are not always objects (e.g. some dispatches carry arrays)
    let guild_id = serde_json::from_str::<GuildScope<'_>>(event.payload.get())
        .ok()
        .and_then(|scope| scope.guild_id.map(str::to_owned));

    Some(EventEnvelope {
        event_id: Uuid::new_v4().to_string(),
        event_type: event.event_type.to_ascii_lowercase().replacen('_', ".", 1),
        shard_id: event.shard_id,
        sequence: event.sequence,
        timestamp,
        guild_id,
        data: event.payload.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, payload: &str) -> DispatchEvent {
        DispatchEvent {
            event_type: event_type.to_string(),
            sequence: 9,
            shard_id: 2,
            payload: RawValue::from_string(payload.to_string()).unwrap(),
        }
    }

    #[test]
    fn test_serialize_returns_none_for_lifecycle_events() {
        assert!(serialize_event(&event("READY", r#"{"session_id":"abc"}"#)).is_none());
        assert!(serialize_event(&event("RESUMED", "null")).is_none());
    }

    #[test]
    fn test_envelope_extracts_guild_and_keeps_payload() {
        let envelope = serialize_event(&event(
            "GUILD_MEMBER_ADD",
            r#"{"guild_id":"81384788765712384","user":{"id":"1"}}"#,
        ))
        .unwrap();

        assert_eq!(envelope.event_type, "guild.member_add");
        assert_eq!(envelope.guild_id.as_deref(), Some("81384788765712384"));
        assert_eq!(envelope.shard_id, 2);
        assert_eq!(envelope.sequence, 9);
        assert!(Uuid::parse_str(&envelope.event_id).is_ok());

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""data":{"guild_id":"81384788765712384","user":{"id":"1"}}"#));
    }

    #[test]
    fn test_envelope_without_guild_scope() {
        let envelope = serialize_event(&event("USER_UPDATE", r#"{"id":"1"}"#)).unwrap();
        assert_eq!(envelope.guild_id, None);
    }
}
