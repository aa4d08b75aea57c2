//! Shard management module
//!
//! The [`ShardManager`] fans lifecycle operations out over one gateway per
//! shard; [`ShardState`] tracks their health for the HTTP endpoints.

mod manager;
mod state;

pub use manager::{shard_id_for_guild, ShardManager, ShardManagerBuilder, ShardManagerConfig};
pub use state::{ShardSnapshot, ShardState, ShardStateEntry};
