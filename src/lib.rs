//! shardwire: a resumable, sharded gateway client
//!
//! - [`transport`]: websocket framing with zlib payload/stream inflation
//! - [`ratelimit`]: per-connection command limiter and fleet-wide identify limiter
//! - [`gateway`]: one connection's handshake, heartbeat and reconnect state machine
//! - [`shard`]: many connections under one identify quota, with guild routing
//!
//! Library code returns [`GatewayError`]; only the binary uses anyhow.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod protocol;
pub mod ratelimit;
pub mod rest;
pub mod shard;
pub mod transport;

pub use context::Context;
pub use error::GatewayError;
pub use events::{DispatchEvent, EventHandler, VoiceStateSink};
pub use gateway::{ConnectionConfig, ConnectionState, Gateway, ReconnectPolicy, Session};
pub use protocol::{CloseCode, Intents, OpCode};
pub use ratelimit::{CommandRateLimiter, IdentifyRateLimiter};
pub use rest::{GatewayUrlResolver, RestGatewayResolver};
pub use shard::{ShardManager, ShardManagerConfig, ShardState};
pub use transport::Compression;
