//! Shard manager
//!
//! Owns the live set of gateway connections for one process. Every shard
//! shares the same identify limiter, so handshakes across the fleet respect
//! the vendor's concurrency quota.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::GatewayError;
use crate::events::{EventHandler, NoopHandler, VoiceStateSink};
use crate::gateway::{ConnectionConfig, Gateway};
use crate::metrics::GatewayMetrics;
use crate::protocol::CloseCode;
use crate::ratelimit::{IdentifyRateLimiter, DEFAULT_IDENTIFY_WINDOW};
use crate::rest::GatewayUrlResolver;
use crate::shard::state::ShardState;

/// Guild to shard routing: `(guild_id >> 22) % shard_count`.
///
/// The top bits of a snowflake are its timestamp, so every client sharding
/// the same application agrees on placement.
pub fn shard_id_for_guild(guild_id: u64, shard_count: u64) -> u64 {
    (guild_id >> 22) % shard_count.max(1)
}

#[derive(Debug, Clone)]
pub struct ShardManagerConfig {
    /// Shards this process runs
    pub shard_ids: Vec<u64>,
    /// Shards across every process
    pub shard_count: u64,
    pub max_concurrency: u64,
    /// Spacing between identifies in one bucket
    pub identify_window: Duration,
    /// Template for every shard; `shard_id`/`shard_count` are overwritten
    pub connection: ConnectionConfig,
}

impl ShardManagerConfig {
    /// Run every shard of `shard_count` in this process.
    pub fn new(shard_count: u64) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shard_ids: (0..shard_count).collect(),
            shard_count,
            max_concurrency: 1,
            identify_window: DEFAULT_IDENTIFY_WINDOW,
            connection: ConnectionConfig::default(),
        }
    }

    pub fn with_shard_ids(mut self, shard_ids: impl IntoIterator<Item = u64>) -> Self {
        let unique: BTreeSet<u64> = shard_ids.into_iter().collect();
        self.shard_ids = unique.into_iter().collect();
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u64) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_identify_window(mut self, window: Duration) -> Self {
        self.identify_window = window;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

/// Owns every [`Gateway`] of this process. Cheap to clone.
#[derive(Clone)]
pub struct ShardManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    token: String,
    config: ShardManagerConfig,
    handler: Arc<dyn EventHandler>,
    voice: Option<Arc<dyn VoiceStateSink>>,
    resolver: Option<Arc<dyn GatewayUrlResolver>>,
    identify: Arc<IdentifyRateLimiter>,
    state: ShardState,
    metrics: GatewayMetrics,
    live: DashMap<u64, Gateway>,
    /// Shards that failed to open; kept for their session, not running
    parked: DashMap<u64, Gateway>,
    /// Serializes open/close per shard id
    locks: DashMap<u64, Arc<AsyncMutex<()>>>,
}

impl ShardManager {
    pub fn builder(token: impl Into<String>, config: ShardManagerConfig) -> ShardManagerBuilder {
        ShardManagerBuilder {
            token: token.into(),
            config,
            handler: Arc::new(NoopHandler),
            voice: None,
            resolver: None,
            metrics: GatewayMetrics::disabled(),
        }
    }

    pub fn shard_count(&self) -> u64 {
        self.inner.config.shard_count
    }

    pub fn shard_ids(&self) -> &[u64] {
        &self.inner.config.shard_ids
    }

    /// Per-shard health registry (shared with every gateway)
    pub fn state(&self) -> ShardState {
        self.inner.state.clone()
    }

    pub fn identify_limiter(&self) -> Arc<IdentifyRateLimiter> {
        Arc::clone(&self.inner.identify)
    }

    /// Open every configured shard that is not already running.
    ///
    /// Shards start concurrently; identifies are spaced by the shared
    /// limiter. Failures are collected into [`GatewayError::Shards`] and do
    /// not roll back the shards that came up.
    pub async fn open(&self, ctx: &Context) -> Result<(), GatewayError> {
        info!(
            shard_count = self.inner.config.shard_count,
            shards = self.inner.config.shard_ids.len(),
            max_concurrency = self.inner.identify.max_concurrency(),
            "Opening shards"
        );

        let mut tasks = JoinSet::new();
        for &shard_id in &self.inner.config.shard_ids {
            let manager = self.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move { (shard_id, manager.open_shard(&ctx, shard_id).await) });
        }

        let errors = join_all(tasks).await;
        if errors.is_empty() {
            info!("All shards opened");
            Ok(())
        } else {
            warn!(failed = errors.len(), "Some shards failed to open");
            Err(GatewayError::Shards(errors))
        }
    }

    /// Like [`open`](Self::open), but succeeds as long as one shard runs.
    ///
    /// Returns the failures of the shards that did not come up; they stay
    /// out of the live set until reopened with [`open_shard`](Self::open_shard).
    pub async fn open_available(&self, ctx: &Context) -> Result<Vec<(u64, GatewayError)>, GatewayError> {
        match self.open(ctx).await {
            Ok(()) => Ok(Vec::new()),
            Err(GatewayError::Shards(errors)) if !self.inner.live.is_empty() => Ok(errors),
            Err(err) => Err(err),
        }
    }

    /// Open one shard, reusing its gateway (and session) if it already exists.
    pub async fn open_shard(&self, ctx: &Context, shard_id: u64) -> Result<(), GatewayError> {
        self.ensure_managed(shard_id)?;
        let lock = self.shard_lock(shard_id);
        let _guard = ctx.run(async { Ok(lock.lock().await) }).await?;

        let inner = &self.inner;
        let gateway = match inner.live.get(&shard_id).map(|g| g.value().clone()) {
            Some(gateway) => gateway,
            None => inner
                .parked
                .remove(&shard_id)
                .map(|(_, gateway)| gateway)
                .unwrap_or_else(|| self.build_gateway(shard_id)),
        };
        inner.live.insert(shard_id, gateway.clone());

        match gateway.open(ctx).await {
            Ok(()) => {
                debug!(shard_id, "Shard opened");
                Ok(())
            }
            Err(GatewayError::AlreadyConnected { .. }) => {
                debug!(shard_id, "Shard already running");
                Ok(())
            }
            Err(err) => {
                // not running, so not routable; the session survives for a retry
                inner.live.remove(&shard_id);
                inner.parked.insert(shard_id, gateway);
                Err(err)
            }
        }
    }

    /// Close one shard and drop it from the live set.
    pub async fn close_shard(&self, ctx: &Context, shard_id: u64) -> Result<(), GatewayError> {
        self.ensure_managed(shard_id)?;
        let lock = self.shard_lock(shard_id);
        let _guard = ctx.run(async { Ok(lock.lock().await) }).await?;

        self.inner.parked.remove(&shard_id);
        match self.inner.live.remove(&shard_id) {
            Some((_, gateway)) => gateway.close(ctx).await,
            None => Ok(()),
        }
    }

    /// Drop the socket and open again, resuming the session.
    pub async fn reopen_shard(&self, ctx: &Context, shard_id: u64) -> Result<(), GatewayError> {
        self.ensure_managed(shard_id)?;
        {
            let lock = self.shard_lock(shard_id);
            let _guard = ctx.run(async { Ok(lock.lock().await) }).await?;
            let gateway = self.inner.live.get(&shard_id).map(|g| g.value().clone());
            if let Some(gateway) = gateway {
                gateway
                    .close_with_code(ctx, CloseCode::ServiceRestart.as_u16())
                    .await?;
            }
        }
        self.open_shard(ctx, shard_id).await
    }

    /// Close every live shard concurrently, then wait for in-flight
    /// identifies to finish.
    pub async fn close(&self, ctx: &Context) -> Result<(), GatewayError> {
        let shard_ids: Vec<u64> = self.inner.live.iter().map(|e| *e.key()).collect();
        info!(shards = shard_ids.len(), "Closing shards");

        let mut tasks = JoinSet::new();
        for shard_id in shard_ids {
            let manager = self.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move { (shard_id, manager.close_shard(&ctx, shard_id).await) });
        }

        let errors = join_all(tasks).await;
        self.inner.identify.close(ctx).await?;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Shards(errors))
        }
    }

    /// Live gateway for `shard_id`.
    pub fn shard(&self, shard_id: u64) -> Option<Gateway> {
        self.inner.live.get(&shard_id).map(|g| g.value().clone())
    }

    /// Shard responsible for `guild_id`.
    pub fn shard_id_for(&self, guild_id: u64) -> u64 {
        shard_id_for_guild(guild_id, self.inner.config.shard_count)
    }

    /// Live gateway responsible for `guild_id`, if this process runs it.
    pub fn guild_shard(&self, guild_id: u64) -> Option<Gateway> {
        self.shard(self.shard_id_for(guild_id))
    }

    /// Ids of shards currently in the live set, sorted.
    pub fn live_shards(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.live.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    fn ensure_managed(&self, shard_id: u64) -> Result<(), GatewayError> {
        if self.inner.config.shard_ids.contains(&shard_id) {
            Ok(())
        } else {
            Err(GatewayError::ShardNotFound { shard_id })
        }
    }

    fn shard_lock(&self, shard_id: u64) -> Arc<AsyncMutex<()>> {
        self.inner.locks.entry(shard_id).or_default().value().clone()
    }

    fn build_gateway(&self, shard_id: u64) -> Gateway {
        let inner = &self.inner;
        let config = inner
            .config
            .connection
            .clone()
            .with_shard(shard_id, inner.config.shard_count);

        let mut builder = Gateway::builder(inner.token.clone(), config)
            .handler(Arc::clone(&inner.handler))
            .identify_limiter(Arc::clone(&inner.identify))
            .shard_state(inner.state.clone())
            .metrics(inner.metrics.clone());
        if let Some(voice) = &inner.voice {
            builder = builder.voice_sink(Arc::clone(voice));
        }
        if let Some(resolver) = &inner.resolver {
            builder = builder.resolver(Arc::clone(resolver));
        }
        builder.build()
    }
}

/// Collect per-shard failures, sorted by shard id. Panics propagate.
async fn join_all(mut tasks: JoinSet<(u64, Result<(), GatewayError>)>) -> Vec<(u64, GatewayError)> {
    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((shard_id, Err(err))) => {
                warn!(shard_id, error = %err, "Shard operation failed");
                errors.push((shard_id, err));
            }
            Err(join_error) if join_error.is_panic() => std::panic::resume_unwind(join_error.into_panic()),
            Err(join_error) => warn!(error = %join_error, "Shard task cancelled"),
        }
    }
    errors.sort_by_key(|(shard_id, _)| *shard_id);
    errors
}

/// Builder for [`ShardManager`].
pub struct ShardManagerBuilder {
    token: String,
    config: ShardManagerConfig,
    handler: Arc<dyn EventHandler>,
    voice: Option<Arc<dyn VoiceStateSink>>,
    resolver: Option<Arc<dyn GatewayUrlResolver>>,
    metrics: GatewayMetrics,
}

impl ShardManagerBuilder {
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn voice_sink(mut self, sink: Arc<dyn VoiceStateSink>) -> Self {
        self.voice = Some(sink);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn GatewayUrlResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> ShardManager {
        let identify = Arc::new(IdentifyRateLimiter::with_window(
            self.config.max_concurrency,
            self.config.identify_window,
        ));
        let state = ShardState::new(self.config.shard_ids.iter().copied(), self.config.shard_count);

        ShardManager {
            inner: Arc::new(ManagerInner {
                token: self.token,
                config: self.config,
                handler: self.handler,
                voice: self.voice,
                resolver: self.resolver,
                identify,
                state,
                metrics: self.metrics,
                live: DashMap::new(),
                parked: DashMap::new(),
                locks: DashMap::new(),
            }),
        }
    }
}
