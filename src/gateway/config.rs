use std::time::Duration;

use crate::protocol::command::{IdentifyProperties, UpdatePresence};
use crate::protocol::Intents;
use crate::ratelimit::{DEFAULT_COMMAND_LIMIT, DEFAULT_COMMAND_WINDOW};
use crate::transport::Compression;

/// Backoff between reconnect attempts.
///
/// Attempt `n` (1-based) waits `base_delay * 2^(n-1)`, capped at `max_delay`.
/// After `max_attempts` consecutive failures the connection gives up and
/// goes `Dead`; `None` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: Some(10),
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub shard_id: u64,
    pub shard_count: u64,
    pub intents: Intents,
    pub compression: Compression,
    /// Member count above which a guild is sent without offline members
    pub large_threshold: u64,
    /// Skips URL discovery when set
    pub gateway_url: Option<String>,
    pub properties: IdentifyProperties,
    /// Initial presence sent with IDENTIFY
    pub presence: Option<UpdatePresence>,
    pub auto_reconnect: bool,
    pub reconnect: ReconnectPolicy,
    /// Pause before reconnecting after an INVALID_SESSION
    pub invalid_session_delay: Duration,
    pub command_limit: u32,
    pub command_window: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            shard_id: 0,
            shard_count: 1,
            intents: Intents::GUILDS | Intents::GUILD_MEMBERS,
            compression: Compression::default(),
            large_threshold: 50,
            gateway_url: None,
            properties: IdentifyProperties::default(),
            presence: None,
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
            invalid_session_delay: Duration::from_secs(2),
            command_limit: DEFAULT_COMMAND_LIMIT,
            command_window: DEFAULT_COMMAND_WINDOW,
        }
    }
}

impl ConnectionConfig {
    pub fn with_shard(mut self, shard_id: u64, shard_count: u64) -> Self {
        self.shard_id = shard_id;
        self.shard_count = shard_count.max(1);
        self
    }

    pub fn with_intents(mut self, intents: Intents) -> Self {
        self.intents = intents;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_large_threshold(mut self, large_threshold: u64) -> Self {
        self.large_threshold = large_threshold;
        self
    }

    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = Some(url.into());
        self
    }

    pub fn with_properties(mut self, properties: IdentifyProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_presence(mut self, presence: UpdatePresence) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_invalid_session_delay(mut self, delay: Duration) -> Self {
        self.invalid_session_delay = delay;
        self
    }

    pub fn with_command_limit(mut self, limit: u32, window: Duration) -> Self {
        self.command_limit = limit;
        self.command_window = window;
        self
    }
}
