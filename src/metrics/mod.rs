//! Prometheus metrics module
//!
//! Recording goes through the `metrics` facade, so it is a no-op until a
//! recorder is installed. Only the binary installs one.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

use crate::error::GatewayError;

/// Gateway metrics collector
#[derive(Clone, Default)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl GatewayMetrics {
    /// Install the Prometheus recorder for this process
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::Config(format!("failed to install Prometheus recorder: {e}")))?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Collector without an exporter; recording still goes to the facade
    pub fn disabled() -> Self {
        Self::default()
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Dispatch events received from the gateway"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Reconnect attempts started by the supervisor"
        );
        describe_counter!("gateway_errors_total", Unit::Count, "Total gateway errors");

        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Delay between a heartbeat and its acknowledgement"
        );
        describe_histogram!(
            "gateway_identify_wait_seconds",
            Unit::Seconds,
            "Time spent waiting for an identify slot"
        );

        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );
    }

    /// Record a dispatch event
    pub fn record_event(&self, shard_id: u64, event_type: &str) {
        counter!(
            "gateway_events_received_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => event_type.to_ascii_lowercase()
        )
        .increment(1);
    }

    pub fn record_heartbeat_ack(&self, shard_id: u64, latency: Duration) {
        histogram!(
            "gateway_heartbeat_latency_seconds",
            "shard_id" => shard_id.to_string()
        )
        .record(latency.as_secs_f64());
    }

    pub fn record_reconnect(&self, shard_id: u64) {
        counter!(
            "gateway_reconnects_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    pub fn record_identify_wait(&self, shard_id: u64, waited: Duration) {
        histogram!(
            "gateway_identify_wait_seconds",
            "shard_id" => shard_id.to_string()
        )
        .record(waited.as_secs_f64());
    }

    /// Record gateway error
    pub fn record_error(&self, shard_id: u64, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    /// Set shards ready count
    pub fn set_shards_ready(&self, count: usize) {
        gauge!("gateway_shards_ready").set(count as f64);
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_collector_records_and_renders_nothing() {
        let metrics = GatewayMetrics::disabled();
        metrics.record_event(0, "MESSAGE_CREATE");
        metrics.record_error(0, "decode");
        metrics.record_heartbeat_ack(0, Duration::from_millis(20));
        assert_eq!(metrics.render(), "");
    }
}
