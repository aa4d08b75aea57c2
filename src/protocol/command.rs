//! Typed outbound commands
//!
//! Each command knows its opcode; [`Command::payload`] wraps it in the
//! outbound envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Intents, OpCode, OutgoingPayload};

/// A payload the client can send.
pub trait Command: Serialize {
    const OPCODE: OpCode;

    fn payload(&self) -> OutgoingPayload<'_, Self> {
        OutgoingPayload::new(Self::OPCODE, self)
    }
}

/// Connection properties reported in IDENTIFY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Fresh-login handshake
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    /// Per-payload compression; never set together with zlib-stream
    pub compress: bool,
    pub large_threshold: u64,
    pub shard: [u64; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<UpdatePresence>,
    pub intents: Intents,
}

impl Command for Identify {
    const OPCODE: OpCode = OpCode::Identify;
}

/// Continue a previous session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

impl Command for Resume {
    const OPCODE: OpCode = OpCode::Resume;
}

/// Keep-alive carrying the last sequence number seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Heartbeat(pub Option<u64>);

impl Command for Heartbeat {
    const OPCODE: OpCode = OpCode::Heartbeat;
}

/// Ask for GUILD_MEMBERS_CHUNK dispatches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestGuildMembers {
    pub guild_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl RequestGuildMembers {
    /// Every member whose username starts with `query` (empty for all).
    pub fn by_query(guild_id: impl Into<String>, query: impl Into<String>, limit: u64) -> Self {
        Self {
            guild_id: guild_id.into(),
            query: Some(query.into()),
            limit,
            presences: None,
            user_ids: None,
            nonce: None,
        }
    }

    pub fn by_user_ids(guild_id: impl Into<String>, user_ids: Vec<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            query: None,
            limit: 0,
            presences: None,
            user_ids: Some(user_ids),
            nonce: None,
        }
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
}

impl Command for RequestGuildMembers {
    const OPCODE: OpCode = OpCode::RequestGuildMembers;
}

/// Join, move between or leave voice channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateVoiceState {
    pub guild_id: String,
    /// `None` disconnects
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl Command for UpdateVoiceState {
    const OPCODE: OpCode = OpCode::VoiceStateUpdate;
}

/// Presence shown for the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdatePresence {
    pub since: Option<u64>,
    pub activities: Vec<Value>,
    pub status: String,
    pub afk: bool,
}

impl UpdatePresence {
    pub fn online() -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: "online".to_string(),
            afk: false,
        }
    }
}

impl Command for UpdatePresence {
    const OPCODE: OpCode = OpCode::PresenceUpdate;
}
