//! Domain error types for the gateway client
//!
//! Structured thiserror types so callers can pattern-match on the failure
//! mode instead of parsing message strings.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, GatewayError>.

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Gateway domain errors
///
/// Variants fall into four families:
/// - transport: socket and decode failures, always answered with a reconnect
/// - protocol: the remote broke the handshake contract
/// - deadline: a blocking wait ran out of time or was cancelled
/// - lifecycle: caller misuse or a shard that gave up
///
/// Example log output:
/// ```text
/// GatewayError::FatalClose { shard_id: 3, code: 4004, reason: "Authentication failed." }
/// → "shard 3 closed with fatal code 4004: Authentication failed."
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Websocket read, write or dial failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Frame was not valid JSON for the gateway envelope
    #[error("failed to decode gateway payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// Zlib inflate failed on a compressed frame
    #[error("failed to inflate compressed frame: {0}")]
    Decompress(String),

    /// Frame arrived in an encoding the negotiated compression does not allow
    #[error("unexpected frame encoding: {0}")]
    UnexpectedFrame(&'static str),

    /// The socket closed underneath us
    #[error("connection closed (code {code:?})")]
    ConnectionClosed { code: Option<u16>, reason: String },

    /// Remote violated the handshake contract (e.g. first frame was not HELLO)
    #[error("protocol error on shard {shard_id}: {message}")]
    Protocol { shard_id: u64, message: String },

    /// Remote closed with a code that forbids reconnecting
    #[error("shard {shard_id} closed with fatal code {code}: {reason}")]
    FatalClose {
        shard_id: u64,
        code: u16,
        reason: String,
    },

    /// A wait would have outlived the caller's deadline
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Send attempted while no socket is open
    #[error("shard {shard_id} is not connected")]
    NotConnected { shard_id: u64 },

    /// Open attempted while a socket is already open
    #[error("shard {shard_id} is already connected")]
    AlreadyConnected { shard_id: u64 },

    /// Reconnect supervisor gave up
    #[error("shard {shard_id} gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { shard_id: u64, attempts: u32 },

    /// Shard ID is not part of the configured set
    #[error("shard {shard_id} is not managed by this process")]
    ShardNotFound { shard_id: u64 },

    /// One or more shards failed during a bulk operation
    #[error("{} shard(s) failed: {}", .0.len(), summarize(.0))]
    Shards(Vec<(u64, GatewayError)>),

    /// REST gateway discovery failed at the transport level
    #[error("gateway discovery request failed")]
    Rest(#[source] reqwest::Error),

    /// REST gateway discovery returned a non-success status
    #[error("gateway discovery returned HTTP {status}: {body}")]
    RestStatus { status: u16, body: String },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

fn summarize(errors: &[(u64, GatewayError)]) -> String {
    errors
        .iter()
        .map(|(shard_id, error)| format!("[shard {shard_id}: {error}]"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on the `gateway_errors_total` counter.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::WebSocket(_) => "websocket",
            Self::Decode(_) => "decode",
            Self::Decompress(_) => "decompress",
            Self::UnexpectedFrame(_) => "unexpected_frame",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::Protocol { .. } => "protocol",
            Self::FatalClose { .. } => "fatal_close",
            Self::DeadlineExceeded => "deadline",
            Self::Cancelled => "cancelled",
            Self::NotConnected { .. } => "not_connected",
            Self::AlreadyConnected { .. } => "already_connected",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::ShardNotFound { .. } => "shard_not_found",
            Self::Shards(_) => "shards",
            Self::Rest(_) => "rest",
            Self::RestStatus { .. } => "rest_status",
            Self::Config(_) => "config",
        }
    }

    /// True for socket and decode failures, which always warrant a reconnect
    /// unless the caller closed the socket on purpose.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_)
                | Self::Decode(_)
                | Self::Decompress(_)
                | Self::UnexpectedFrame(_)
                | Self::ConnectionClosed { .. }
        )
    }

    /// True when retrying the connection cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalClose { .. } | Self::ReconnectExhausted { .. } | Self::Config(_)
        )
    }

    /// True for deadline and cancellation outcomes.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_error() -> serde_json::Error {
        serde_json::from_str::<()>("invalid").unwrap_err()
    }

    #[test]
    fn every_variant_has_distinct_error_type_label() {
        let labels = [
            GatewayError::WebSocket(WsError::ConnectionClosed).error_type_label(),
            GatewayError::Decode(decode_error()).error_type_label(),
            GatewayError::Decompress("bad header".into()).error_type_label(),
            GatewayError::UnexpectedFrame("binary").error_type_label(),
            GatewayError::ConnectionClosed { code: None, reason: String::new() }.error_type_label(),
            GatewayError::Protocol { shard_id: 0, message: "x".into() }.error_type_label(),
            GatewayError::FatalClose { shard_id: 0, code: 4004, reason: String::new() }
                .error_type_label(),
            GatewayError::DeadlineExceeded.error_type_label(),
            GatewayError::Cancelled.error_type_label(),
            GatewayError::NotConnected { shard_id: 0 }.error_type_label(),
            GatewayError::AlreadyConnected { shard_id: 0 }.error_type_label(),
            GatewayError::ReconnectExhausted { shard_id: 0, attempts: 3 }.error_type_label(),
            GatewayError::ShardNotFound { shard_id: 0 }.error_type_label(),
            GatewayError::Shards(Vec::new()).error_type_label(),
            GatewayError::RestStatus { status: 500, body: String::new() }.error_type_label(),
            GatewayError::Config("test".to_string()).error_type_label(),
        ];

        let mut unique = labels.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(labels.len(), unique.len(), "Duplicate error_type_label found");
    }

    #[test]
    fn error_messages_contain_context() {
        let err = GatewayError::FatalClose {
            shard_id: 3,
            code: 4004,
            reason: "Authentication failed.".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("shard 3"), "message should contain shard_id");
        assert!(msg.contains("4004"), "message should contain close code");

        let err = GatewayError::ReconnectExhausted { shard_id: 7, attempts: 10 };
        assert!(err.to_string().contains("10 attempts"));
    }

    #[test]
    fn aggregate_error_lists_every_shard() {
        let err = GatewayError::Shards(vec![
            (1, GatewayError::DeadlineExceeded),
            (4, GatewayError::NotConnected { shard_id: 4 }),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 shard(s) failed"));
        assert!(msg.contains("shard 1: deadline exceeded"));
        assert!(msg.contains("shard 4"));
    }

    #[test]
    fn classification_follows_taxonomy() {
        assert!(GatewayError::Decode(decode_error()).is_transport());
        assert!(GatewayError::ConnectionClosed { code: Some(1006), reason: String::new() }
            .is_transport());
        assert!(!GatewayError::Protocol { shard_id: 0, message: String::new() }.is_transport());
        assert!(GatewayError::FatalClose { shard_id: 0, code: 4014, reason: String::new() }
            .is_fatal());
        assert!(!GatewayError::DeadlineExceeded.is_fatal());
        assert!(GatewayError::Cancelled.is_deadline());
    }

    #[test]
    fn config_error_preserves_message() {
        let err = GatewayError::Config("DISCORD_TOKEN must be set".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: DISCORD_TOKEN must be set"
        );
    }
}
