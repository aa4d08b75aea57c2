//! Shard state tracking
//!
//! Per-shard health registry shared by every connection in the process and
//! read by the health endpoints.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::gateway::ConnectionState;

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub state: ConnectionState,
    pub events_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_heartbeat_ack: Option<Instant>,
    pub latency: Option<Duration>,
    pub connected_at: Option<Instant>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            state: ConnectionState::Unconnected,
            events_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_heartbeat_ack: None,
            latency: None,
            connected_at: None,
        }
    }
}

/// Point-in-time view of one shard, for `/ready`
#[derive(Debug, Clone, Serialize)]
pub struct ShardSnapshot {
    pub shard_id: u64,
    pub state: &'static str,
    pub events_received: u64,
    pub reconnects: u64,
    pub latency_ms: Option<u64>,
    pub uptime_secs: Option<u64>,
}

/// Shared state across all shards in the process
#[derive(Debug, Clone)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug)]
struct ShardStateInner {
    shards: DashMap<u64, ShardStateEntry>,
    total_shards: u64,
}

impl ShardState {
    /// Create a new shard state tracker
    pub fn new(shard_ids: impl IntoIterator<Item = u64>, total_shards: u64) -> Self {
        let shards = DashMap::new();
        for shard_id in shard_ids {
            shards.insert(shard_id, ShardStateEntry::default());
        }

        Self {
            inner: Arc::new(ShardStateInner {
                shards,
                total_shards,
            }),
        }
    }

    /// Get total shards across the cluster
    pub fn total_shards(&self) -> u64 {
        self.inner.total_shards
    }

    /// Update shard connection state
    pub fn set_state(&self, shard_id: u64, state: ConnectionState) {
        let mut entry = self.inner.shards.entry(shard_id).or_default();
        entry.state = state;
        match state {
            ConnectionState::Ready if entry.connected_at.is_none() => {
                entry.connected_at = Some(Instant::now());
            }
            ConnectionState::Disconnected | ConnectionState::Dead | ConnectionState::Unconnected => {
                entry.connected_at = None;
            }
            _ => {}
        }
    }

    /// Increment event received counter
    pub fn record_event(&self, shard_id: u64) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment reconnect counter
    pub fn record_reconnect(&self, shard_id: u64) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record heartbeat ack and the latency it implies
    pub fn record_heartbeat_ack(&self, shard_id: u64, latency: Option<Duration>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.last_heartbeat_ack = Some(Instant::now());
            entry.latency = latency;
        }
    }

    /// Get state for a specific shard
    pub fn get_state(&self, shard_id: u64) -> Option<ConnectionState> {
        self.inner.shards.get(&shard_id).map(|e| e.state)
    }

    /// Get total events received across all shards
    pub fn total_events_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Get count of ready shards
    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.state.is_ready())
            .count()
    }

    /// Get count of healthy shards (ready or resuming)
    pub fn healthy_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.state.is_healthy())
            .count()
    }

    /// Get shard count tracked by this process
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// At least one shard is ready
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    /// Every shard is ready or resuming
    pub fn is_healthy(&self) -> bool {
        self.healthy_shards() == self.shard_count()
    }

    /// Snapshot of every shard, ordered by shard id
    pub fn snapshot(&self) -> Vec<ShardSnapshot> {
        let now = Instant::now();
        let mut shards: Vec<_> = self
            .inner
            .shards
            .iter()
            .map(|e| ShardSnapshot {
                shard_id: *e.key(),
                state: e.state.as_str(),
                events_received: e.events_received.load(Ordering::Relaxed),
                reconnects: e.reconnects.load(Ordering::Relaxed),
                latency_ms: e.latency.map(|d| d.as_millis() as u64),
                uptime_secs: e.connected_at.map(|at| now.saturating_duration_since(at).as_secs()),
            })
            .collect();
        shards.sort_by_key(|s| s.shard_id);
        shards
    }
}
