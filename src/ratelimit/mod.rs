//! Rate limiting for outbound gateway traffic
//!
//! Two independent limiters share the [`RateBucket`] bookkeeping:
//! - [`CommandRateLimiter`]: commands per rolling window on one connection
//! - [`IdentifyRateLimiter`]: handshake spacing per `shard_id % max_concurrency`
//!   bucket, shared by every shard in the process

mod bucket;
mod command;
mod identify;

pub use bucket::RateBucket;
pub use command::{CommandPermit, CommandRateLimiter, DEFAULT_COMMAND_LIMIT, DEFAULT_COMMAND_WINDOW};
pub use identify::{IdentifyPermit, IdentifyRateLimiter, DEFAULT_IDENTIFY_WINDOW};
