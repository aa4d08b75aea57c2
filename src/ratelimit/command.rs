use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

use super::RateBucket;
use crate::context::Context;
use crate::error::GatewayError;

/// Vendor limit: 120 commands per 60 seconds per connection.
pub const DEFAULT_COMMAND_LIMIT: u32 = 120;
pub const DEFAULT_COMMAND_WINDOW: Duration = Duration::from_secs(60);

/// Rolling-window limiter for one connection's outbound commands.
///
/// [`wait`](Self::wait) queues callers in FIFO order and hands out a
/// [`CommandPermit`] once quota is available; dropping the permit is the
/// unlock, which consumes quota whether or not the write succeeded. The
/// bucket lock is only held for bookkeeping, never across the timer.
#[derive(Debug)]
pub struct CommandRateLimiter {
    queue: Arc<AsyncMutex<()>>,
    bucket: Mutex<RateBucket>,
}

impl CommandRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            queue: Arc::new(AsyncMutex::new(())),
            bucket: Mutex::new(RateBucket::new(limit, window)),
        }
    }

    /// Block until a command may be sent.
    ///
    /// Fails with the context's error, without consuming quota, if the
    /// context is cancelled or its deadline falls before the window resets.
    pub async fn wait(&self, ctx: &Context) -> Result<CommandPermit<'_>, GatewayError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let turn = tokio::select! {
            turn = Arc::clone(&self.queue).lock_owned() => turn,
            err = ctx.done() => return Err(err),
        };

        loop {
            let available_at = self.bucket.lock().available_at(Instant::now());
            match available_at {
                None => {
                    return Ok(CommandPermit {
                        limiter: self,
                        _turn: turn,
                    })
                }
                Some(reset) => {
                    debug!(
                        wait_ms = reset.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "Command quota exhausted, waiting for window reset"
                    );
                    ctx.sleep_until(reset).await?;
                }
            }
        }
    }

    /// Quota left in the current window.
    pub fn remaining(&self) -> u32 {
        let mut bucket = self.bucket.lock();
        bucket.refresh(Instant::now());
        bucket.remaining()
    }

    fn unlock(&self) {
        self.bucket.lock().consume(Instant::now());
    }
}

impl Default for CommandRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_LIMIT, DEFAULT_COMMAND_WINDOW)
    }
}

/// Scoped right to send one command. Dropping it releases the queue and
/// consumes one unit of quota.
#[derive(Debug)]
#[must_use = "dropping the permit immediately consumes quota without sending"]
pub struct CommandPermit<'a> {
    limiter: &'a CommandRateLimiter,
    _turn: OwnedMutexGuard<()>,
}

impl Drop for CommandPermit<'_> {
    fn drop(&mut self) {
        self.limiter.unlock();
    }
}
