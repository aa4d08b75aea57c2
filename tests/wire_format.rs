//! Wire format conformance tests
//!
//! Outbound commands and the event envelope are compared against the
//! committed JSON fixtures in tests/fixtures/.
//!
//! ## Fixture regeneration
//!
//! To regenerate fixtures after an intentional wire format change:
//! ```bash
//! REGENERATE_FIXTURES=1 cargo test --test wire_format
//! ```

use serde_json::value::RawValue;
use serde_json::Value;
use shardwire::events::{serialize_event, DispatchEvent};
use shardwire::protocol::command::{
    Command, Heartbeat, Identify, IdentifyProperties, RequestGuildMembers, Resume, UpdatePresence,
    UpdateVoiceState,
};
use shardwire::Intents;
use std::path::PathBuf;

/// Fixture directory resolved via CARGO_MANIFEST_DIR.
fn fixtures_dir() -> PathBuf {
    let fixtures = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    assert!(
        fixtures.exists(),
        "Fixture directory does not exist at {}",
        fixtures.display()
    );
    fixtures
}

/// Load a committed fixture by name (without .json extension).
fn load_fixture(name: &str) -> Value {
    let path = fixtures_dir().join(format!("{name}.json"));
    let content = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read fixture {}: {e}", path.display()));
    serde_json::from_str(&content)
        .unwrap_or_else(|e| panic!("Failed to parse fixture {}: {e}", path.display()))
}

/// Write a fixture to disk (for regeneration mode).
fn write_fixture(name: &str, value: &Value) {
    let path = fixtures_dir().join(format!("{name}.json"));
    let content = serde_json::to_string_pretty(value).unwrap();
    let content = format!("{content}\n");
    std::fs::write(&path, content)
        .unwrap_or_else(|e| panic!("Failed to write fixture {}: {e}", path.display()));
    eprintln!("Regenerated fixture: {}", path.display());
}

fn to_value<C: Command>(command: &C) -> Value {
    serde_json::from_str(&command.payload().to_json().unwrap()).unwrap()
}

/// Serialize the command matching each fixture from deterministic inputs.
fn build_command(fixture_name: &str) -> Value {
    match fixture_name {
        "identify" => to_value(&Identify {
            token: "test-token".to_string(),
            properties: IdentifyProperties {
                os: "linux".to_string(),
                browser: "shardwire".to_string(),
                device: "shardwire".to_string(),
            },
            compress: false,
            large_threshold: 50,
            shard: [3, 16],
            presence: Some(UpdatePresence::online()),
            intents: Intents::GUILDS | Intents::GUILD_MEMBERS | Intents::GUILD_MESSAGES,
        }),
        "resume" => to_value(&Resume {
            token: "test-token".to_string(),
            session_id: "abc".to_string(),
            seq: Some(2),
        }),
        "heartbeat" => to_value(&Heartbeat(Some(1337))),
        "request-guild-members" => {
            let mut request = RequestGuildMembers::by_query("41771983444115456", "", 0).with_nonce("chunk-1");
            request.presences = Some(true);
            to_value(&request)
        }
        "update-voice-state" => to_value(&UpdateVoiceState {
            guild_id: "41771983444115456".to_string(),
            channel_id: None,
            self_mute: false,
            self_deaf: true,
        }),
        "update-presence" => to_value(&UpdatePresence {
            since: Some(91879201),
            activities: vec![serde_json::json!({"name": "shards", "type": 3})],
            status: "idle".to_string(),
            afk: true,
        }),
        other => panic!("Unknown fixture: {other}"),
    }
}

/// Fixtures produced byte-for-byte by the command types.
const COMMAND_FIXTURES: &[&str] = &[
    "identify",
    "resume",
    "heartbeat",
    "request-guild-members",
    "update-voice-state",
    "update-presence",
];

/// Required envelope fields for every EventEnvelope.
const REQUIRED_ENVELOPE_FIELDS: &[&str] = &[
    "event_id",
    "event_type",
    "shard_id",
    "sequence",
    "timestamp",
    "guild_id",
    "data",
];

#[test]
fn commands_match_committed_fixtures() {
    let regenerate = std::env::var("REGENERATE_FIXTURES").is_ok();

    for name in COMMAND_FIXTURES {
        let actual = build_command(name);

        if regenerate {
            write_fixture(name, &actual);
        } else {
            let expected = load_fixture(name);
            assert_eq!(
                actual, expected,
                "Wire format mismatch for fixture '{name}'. \
                 If intentional, run: REGENERATE_FIXTURES=1 cargo test --test wire_format"
            );
        }
    }
}

#[test]
fn every_command_carries_op_and_d() {
    for name in COMMAND_FIXTURES {
        let fixture = load_fixture(name);
        let obj = fixture
            .as_object()
            .unwrap_or_else(|| panic!("Fixture '{name}' is not a JSON object"));
        assert_eq!(obj.len(), 2, "Fixture '{name}' must only have op and d");
        assert!(obj["op"].is_u64(), "Fixture '{name}' has non-integer op");
        assert!(obj.contains_key("d"), "Fixture '{name}' missing d");
    }
}

#[test]
fn envelope_matches_committed_shape() {
    let fixture = load_fixture("event-envelope");
    let event = DispatchEvent {
        event_type: "GUILD_CREATE".to_string(),
        sequence: 42,
        shard_id: 3,
        payload: RawValue::from_string(fixture["data"].to_string()).unwrap(),
    };

    let envelope = serialize_event(&event).expect("GUILD_CREATE is forwarded");
    let actual = serde_json::to_value(&envelope).unwrap();
    let obj = actual.as_object().unwrap();

    for field in REQUIRED_ENVELOPE_FIELDS {
        assert!(obj.contains_key(*field), "Envelope missing required field '{field}'");
    }
    assert_eq!(obj.len(), REQUIRED_ENVELOPE_FIELDS.len());

    // event_id and timestamp are generated; everything else is deterministic
    for field in ["event_type", "shard_id", "sequence", "guild_id", "data"] {
        assert_eq!(actual[field], fixture[field], "Envelope field '{field}' differs");
    }
    uuid::Uuid::parse_str(actual["event_id"].as_str().unwrap()).unwrap();
}
