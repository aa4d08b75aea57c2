//! shardwire - sharded gateway process
//!
//! Runs the shards of one process:
//! - Resolves the gateway URL, shard count and identify concurrency
//! - Opens every configured shard under one identify quota
//! - Logs dispatches as JSON envelopes
//! - Exposes health/ready endpoints and Prometheus metrics

use anyhow::{Context as _, Result};
use shardwire::config::GatewayConfig;
use shardwire::events::serialize_event;
use shardwire::health::{self, AppState};
use shardwire::metrics::GatewayMetrics;
use shardwire::rest::GatewayUrlResolver;
use shardwire::{Context, DispatchEvent, RestGatewayResolver, ShardManager};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Deadline for closing every shard on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("shardwire={}", gateway_config.log_level).parse()?)
                .add_directive("tokio_tungstenite=warn".parse()?)
                .add_directive("reqwest=warn".parse()?),
        )
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting shardwire");

    let metrics = GatewayMetrics::install()?;
    info!("Prometheus metrics initialized");

    let resolver = Arc::new(RestGatewayResolver::new(gateway_config.discord_token.clone())?);

    // Ask the REST API only for what the environment left out
    let needs_bot_info = gateway_config.total_shards.is_none()
        || gateway_config.max_concurrency.is_none()
        || gateway_config.gateway_url.is_none();
    let bot_info = if needs_bot_info {
        let info = resolver
            .gateway_bot_info()
            .await
            .context("failed to fetch gateway bot info")?;
        info!(
            url = %info.url,
            recommended_shards = info.shards,
            max_concurrency = info.session_start_limit.max_concurrency,
            remaining_sessions = info.session_start_limit.remaining,
            "Fetched gateway bot info"
        );
        Some(info)
    } else {
        None
    };

    let total_shards = gateway_config
        .total_shards
        .or_else(|| bot_info.as_ref().map(|info| info.shards))
        .unwrap_or(1);
    let max_concurrency = gateway_config
        .max_concurrency
        .or_else(|| bot_info.as_ref().map(|info| info.session_start_limit.max_concurrency))
        .unwrap_or(1);

    let mut manager_config = gateway_config.manager_config(total_shards, max_concurrency);
    if manager_config.connection.gateway_url.is_none() {
        if let Some(info) = &bot_info {
            manager_config.connection = manager_config.connection.with_gateway_url(info.url.clone());
        }
    }
    info!(
        total_shards,
        max_concurrency,
        shard_ids = ?manager_config.shard_ids,
        intents = manager_config.connection.intents.bits(),
        compression = %manager_config.connection.compression,
        "Shard manager configured"
    );

    let manager = ShardManager::builder(gateway_config.discord_token.clone(), manager_config)
        .handler(Arc::new(log_envelope))
        .resolver(resolver)
        .metrics(metrics.clone())
        .build();

    // Start health server
    let app_state = AppState {
        shard_state: manager.state(),
        metrics,
    };
    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();

    info!(port = gateway_config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    let open_ctx = Context::background();
    let opening = async {
        let failed = manager.open_available(&open_ctx).await?;
        for (shard_id, e) in &failed {
            error!(shard_id, error = %e, "Shard failed to open");
        }
        if failed.is_empty() {
            info!("All shards opened");
        } else {
            warn!(
                failed = failed.len(),
                running = manager.live_shards().len(),
                "Continuing with the shards that opened"
            );
        }
        // keep serving until something else ends the select
        std::future::pending::<Result<(), shardwire::GatewayError>>().await
    };

    // Run everything concurrently
    tokio::select! {
        result = opening => {
            if let Err(e) = result {
                error!(error = %e, "No shard could be opened");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down gateway...");
    open_ctx.cancel();

    if let Err(e) = manager.close(&Context::with_timeout(SHUTDOWN_TIMEOUT)).await {
        error!(error = %e, "Failed to close shards cleanly");
    }

    info!("Gateway shutdown complete");
    Ok(())
}

fn log_envelope(event: DispatchEvent) {
    let Some(envelope) = serialize_event(&event) else {
        return;
    };
    match serde_json::to_string(&envelope) {
        Ok(json) => info!(
            event_type = %envelope.event_type,
            shard_id = envelope.shard_id,
            envelope = %json,
            "Gateway event"
        ),
        Err(e) => debug!(error = %e, event_type = %event.event_type, "Failed to serialize event"),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
