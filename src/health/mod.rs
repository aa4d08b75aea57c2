//! Health check endpoints
//!
//! `/health` answers while the process runs, `/ready` once a shard is
//! Ready, `/metrics` renders the Prometheus exposition.

use crate::metrics::GatewayMetrics;
use crate::shard::{ShardSnapshot, ShardState};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub shards_total: u64,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shards_managed: usize,
    pub shards_ready: usize,
    pub events_total: u64,
    pub shards: Vec<ShardSnapshot>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub shard_state: ShardState,
    pub metrics: GatewayMetrics,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        shards_total: state.shard_state.total_shards(),
    })
}

/// Readiness endpoint - returns 200 if at least one shard is ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = ReadyResponse {
        ready: state.shard_state.is_ready(),
        shards_managed: state.shard_state.shard_count(),
        shards_ready: state.shard_state.ready_shards(),
        events_total: state.shard_state.total_events_received(),
        shards: state.shard_state.snapshot(),
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.set_shards_ready(state.shard_state.ready_shards());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ConnectionState;

    async fn get_status(router: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let response = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        let body = response.json().await.unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn app(state: &ShardState) -> Router {
        router(AppState {
            shard_state: state.clone(),
            metrics: GatewayMetrics::disabled(),
        })
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.3.0",
            shards_total: 16,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("\"shards_total\":16"));
    }

    #[tokio::test]
    async fn ready_is_unavailable_until_a_shard_is_ready() {
        let state = ShardState::new([0, 1], 2);

        let (status, body) = get_status(app(&state), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
        assert_eq!(body["shards_managed"], 2);

        state.set_state(1, ConnectionState::Ready);
        let (status, body) = get_status(app(&state), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["shards_ready"], 1);
        assert_eq!(body["shards"][1]["state"], "ready");
    }

    #[tokio::test]
    async fn health_always_answers() {
        let state = ShardState::new([0], 4);
        let (status, body) = get_status(app(&state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["shards_total"], 4);
    }
}
