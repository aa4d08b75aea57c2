//! Gateway discovery over REST
//!
//! The connection only needs two answers from the HTTP API: where to dial,
//! and (for the binary) how many shards and identify buckets to use.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::GatewayError;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Identify quota reported by `GET /gateway/bot`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    pub total: u64,
    pub remaining: u64,
    /// Milliseconds until `remaining` resets
    pub reset_after: u64,
    pub max_concurrency: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayBotInfo {
    pub url: String,
    /// Recommended shard count
    pub shards: u64,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Deserialize)]
struct GatewayInfo {
    url: String,
}

/// Source of the gateway URL and sharding recommendations.
#[async_trait]
pub trait GatewayUrlResolver: Send + Sync {
    async fn gateway_url(&self) -> Result<String, GatewayError>;

    async fn gateway_bot_info(&self) -> Result<GatewayBotInfo, GatewayError>;
}

/// [`GatewayUrlResolver`] backed by the HTTP API.
#[derive(Debug, Clone)]
pub struct RestGatewayResolver {
    http: Client,
    token: String,
    base_url: String,
}

impl RestGatewayResolver {
    pub fn new(token: impl Into<String>) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!(
                "DiscordBot (",
                env!("CARGO_PKG_NAME"),
                ", ",
                env!("CARGO_PKG_VERSION"),
                ")"
            ))
            .build()
            .map_err(GatewayError::Rest)?;

        Ok(Self {
            http,
            token: token.into(),
            base_url: DEFAULT_API_BASE.to_string(),
        })
    }

    /// Point at a different API root (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str, authorized: bool) -> Result<T, GatewayError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "Requesting gateway info");

        let mut request = self.http.get(&url);
        if authorized {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token));
        }

        let response = request.send().await.map_err(GatewayError::Rest)?;
        let status = response.status();
        let body = response.text().await.map_err(GatewayError::Rest)?;

        if !status.is_success() {
            return Err(GatewayError::RestStatus {
                status: status.as_u16(),
                body: summarize_body(&body),
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl GatewayUrlResolver for RestGatewayResolver {
    async fn gateway_url(&self) -> Result<String, GatewayError> {
        let info: GatewayInfo = self.get("/gateway", false).await?;
        Ok(info.url)
    }

    async fn gateway_bot_info(&self) -> Result<GatewayBotInfo, GatewayError> {
        self.get("/gateway/bot", true).await
    }
}

fn summarize_body(body: &str) -> String {
    const MAX: usize = 256;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
