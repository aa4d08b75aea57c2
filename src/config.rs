//! Process configuration
//!
//! Handles loading configuration from environment variables (and `.env`)
//! for the binary. Library users build [`ConnectionConfig`] and
//! [`ShardManagerConfig`] directly.

use crate::error::GatewayError;
use crate::gateway::{ConnectionConfig, ReconnectPolicy};
use crate::protocol::Intents;
use crate::ratelimit::DEFAULT_IDENTIFY_WINDOW;
use crate::shard::ShardManagerConfig;
use crate::transport::Compression;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Total number of shards across all processes; fetched when unset
    pub total_shards: Option<u64>,

    /// Shards this process runs; all of `0..total_shards` when unset
    pub shard_ids: Option<Vec<u64>>,

    /// Identify buckets; fetched when unset
    pub max_concurrency: Option<u64>,

    /// Skips URL resolution when set
    pub gateway_url: Option<String>,

    pub intents: Intents,

    pub compression: Compression,

    pub auto_reconnect: bool,

    /// `None` retries forever
    pub reconnect_max_attempts: Option<u32>,

    pub identify_window: Duration,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GatewayError> {
        let discord_token = lookup("DISCORD_TOKEN")
            .or_else(|| lookup("DISCORD_BOT_TOKEN"))
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let total_shards = parse_opt::<u64>(&lookup, "TOTAL_SHARDS")?;
        if total_shards == Some(0) {
            return Err(GatewayError::Config("TOTAL_SHARDS must be at least 1".to_string()));
        }

        let shard_ids = lookup("SHARD_IDS")
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| parse_shard_ids(&raw))
            .transpose()?;

        let max_concurrency = parse_opt::<u64>(&lookup, "MAX_CONCURRENCY")?;

        let gateway_url = lookup("GATEWAY_URL").filter(|url| !url.trim().is_empty());

        let intents = parse_opt::<u64>(&lookup, "GATEWAY_INTENTS")?
            .map_or(Intents::GUILDS | Intents::GUILD_MEMBERS, Intents::from_bits);

        let compression = parse_opt::<Compression>(&lookup, "GATEWAY_COMPRESSION")?.unwrap_or_default();

        let auto_reconnect = parse_opt::<bool>(&lookup, "AUTO_RECONNECT")?.unwrap_or(true);

        let reconnect_max_attempts = match parse_opt::<u32>(&lookup, "RECONNECT_MAX_ATTEMPTS")? {
            Some(0) => None,
            Some(n) => Some(n),
            None => ReconnectPolicy::default().max_attempts,
        };

        let identify_window = parse_opt::<u64>(&lookup, "IDENTIFY_WAIT_MS")?
            .map_or(DEFAULT_IDENTIFY_WINDOW, Duration::from_millis);

        let http_port = parse_opt::<u16>(&lookup, "HTTP_PORT")?.unwrap_or(9090);

        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            discord_token,
            total_shards,
            shard_ids,
            max_concurrency,
            gateway_url,
            intents,
            compression,
            auto_reconnect,
            reconnect_max_attempts,
            identify_window,
            http_port,
            log_level,
        })
    }

    /// Per-connection template shared by every shard.
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut connection = ConnectionConfig::default()
            .with_intents(self.intents)
            .with_compression(self.compression)
            .with_auto_reconnect(self.auto_reconnect)
            .with_reconnect_policy(ReconnectPolicy {
                max_attempts: self.reconnect_max_attempts,
                ..ReconnectPolicy::default()
            });
        if let Some(url) = &self.gateway_url {
            connection = connection.with_gateway_url(url.clone());
        }
        connection
    }

    /// Manager settings once the shard count and concurrency are known.
    pub fn manager_config(&self, total_shards: u64, max_concurrency: u64) -> ShardManagerConfig {
        let mut config = ShardManagerConfig::new(total_shards)
            .with_max_concurrency(max_concurrency)
            .with_identify_window(self.identify_window)
            .with_connection(self.connection_config());
        if let Some(ids) = &self.shard_ids {
            config = config.with_shard_ids(ids.iter().copied());
        }
        config
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, GatewayError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| GatewayError::Config(format!("{key} is invalid: {e}"))),
        _ => Ok(None),
    }
}

fn parse_shard_ids(raw: &str) -> Result<Vec<u64>, GatewayError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse()
                .map_err(|e| GatewayError::Config(format!("SHARD_IDS entry '{part}' is invalid: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<GatewayConfig, GatewayError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_token_is_required() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        assert!(load(&[("DISCORD_BOT_TOKEN", "abc")]).is_ok());
    }

    #[test]
    fn test_default_values() {
        let config = load(&[("DISCORD_TOKEN", "abc")]).unwrap();
        assert_eq!(config.total_shards, None);
        assert_eq!(config.shard_ids, None);
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.compression, Compression::Stream);
        assert_eq!(config.reconnect_max_attempts, Some(10));
        assert_eq!(config.identify_window, Duration::from_secs(5));
        assert!(config.auto_reconnect);

        // privileged message content is off unless asked for
        assert!(config.intents.contains(Intents::GUILDS));
        assert!(config.intents.contains(Intents::GUILD_MEMBERS));
        assert!(!config.intents.contains(Intents::MESSAGE_CONTENT));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DISCORD_TOKEN", "abc"),
            ("TOTAL_SHARDS", "16"),
            ("SHARD_IDS", "3, 1,3"),
            ("GATEWAY_COMPRESSION", "none"),
            ("GATEWAY_INTENTS", "513"),
            ("RECONNECT_MAX_ATTEMPTS", "0"),
            ("IDENTIFY_WAIT_MS", "250"),
            ("AUTO_RECONNECT", "false"),
        ])
        .unwrap();
        assert_eq!(config.total_shards, Some(16));
        assert_eq!(config.reconnect_max_attempts, None);
        assert!(!config.auto_reconnect);

        let manager = config.manager_config(16, 2);
        assert_eq!(manager.shard_ids, vec![1, 3]);
        assert_eq!(manager.max_concurrency, 2);
        assert_eq!(manager.identify_window, Duration::from_millis(250));
        assert_eq!(manager.connection.compression, Compression::None);
        assert_eq!(manager.connection.intents.bits(), 513);
        assert_eq!(manager.connection.reconnect.max_attempts, None);
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        assert!(load(&[("DISCORD_TOKEN", "abc"), ("TOTAL_SHARDS", "many")]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "abc"), ("TOTAL_SHARDS", "0")]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "abc"), ("SHARD_IDS", "1,x")]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "abc"), ("GATEWAY_COMPRESSION", "brotli")]).is_err());
    }
}
