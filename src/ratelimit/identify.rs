use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::context::Context;
use crate::error::GatewayError;

/// Spacing between two identifies in the same bucket.
pub const DEFAULT_IDENTIFY_WINDOW: Duration = Duration::from_secs(5);

/// One bucket: `turn` admits a single identify at a time, `schedule` is
/// readable without queuing on it.
#[derive(Debug, Default)]
struct IdentifyBucket {
    turn: Arc<AsyncMutex<()>>,
    schedule: Mutex<Schedule>,
}

#[derive(Debug, Default)]
struct Schedule {
    /// Earliest instant the next identify may be sent
    reset: Option<Instant>,
    /// Waiters and holders that have not released yet
    pending: u32,
}

impl IdentifyBucket {
    /// Register a waiter and return the earliest instant it could be
    /// granted: after the current reset, plus one window per waiter ahead.
    fn enqueue(self: &Arc<Self>, window: Duration) -> (Ticket, Instant) {
        let mut schedule = self.schedule.lock();
        let now = Instant::now();
        let base = schedule.reset.map_or(now, |reset| reset.max(now));
        let earliest = base + window * schedule.pending;
        schedule.pending += 1;
        drop(schedule);
        (
            Ticket {
                bucket: Arc::clone(self),
            },
            earliest,
        )
    }
}

/// A place in a bucket's queue; leaving it (on drop) frees the place.
#[derive(Debug)]
struct Ticket {
    bucket: Arc<IdentifyBucket>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut schedule = self.bucket.schedule.lock();
        schedule.pending = schedule.pending.saturating_sub(1);
    }
}

/// Process-wide identify spacing.
///
/// Shard `n` maps to bucket `n % max_concurrency`. A bucket admits one
/// identify at a time, and the next holder must wait until `window` has
/// passed since the previous permit was released.
#[derive(Debug)]
pub struct IdentifyRateLimiter {
    max_concurrency: u64,
    window: Duration,
    buckets: Mutex<HashMap<u64, Arc<IdentifyBucket>>>,
}

impl IdentifyRateLimiter {
    pub fn new(max_concurrency: u64) -> Self {
        Self::with_window(max_concurrency, DEFAULT_IDENTIFY_WINDOW)
    }

    pub fn with_window(max_concurrency: u64, window: Duration) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_concurrency(&self) -> u64 {
        self.max_concurrency
    }

    pub fn bucket_key(&self, shard_id: u64) -> u64 {
        shard_id % self.max_concurrency
    }

    fn bucket(&self, key: u64) -> Arc<IdentifyBucket> {
        Arc::clone(self.buckets.lock().entry(key).or_default())
    }

    /// Block until `shard_id` may identify.
    ///
    /// Fails with `DeadlineExceeded` right away when the earliest possible
    /// grant (the bucket's reset plus one window per waiter ahead) falls
    /// after the deadline. On error the bucket is left untouched, so a
    /// failed waiter does not push back the next identify.
    pub async fn wait(&self, ctx: &Context, shard_id: u64) -> Result<IdentifyPermit, GatewayError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let key = self.bucket_key(shard_id);
        let bucket = self.bucket(key);

        let (ticket, earliest) = bucket.enqueue(self.window);
        if ctx.deadline().is_some_and(|deadline| deadline < earliest) {
            debug!(shard_id, bucket = key, "Identify slot not reachable before deadline");
            return Err(GatewayError::DeadlineExceeded);
        }

        let guard = tokio::select! {
            guard = Arc::clone(&bucket.turn).lock_owned() => guard,
            err = ctx.done() => return Err(err),
        };

        let reset = bucket.schedule.lock().reset;
        if let Some(reset) = reset {
            let now = Instant::now();
            if reset > now {
                debug!(
                    shard_id,
                    bucket = key,
                    wait_ms = (reset - now).as_millis() as u64,
                    "Waiting for identify window"
                );
                ctx.sleep_until(reset).await?;
            }
        }

        Ok(IdentifyPermit {
            turn: Some((guard, ticket)),
            window: self.window,
        })
    }

    /// Wait for every outstanding permit to be released.
    pub async fn close(&self, ctx: &Context) -> Result<(), GatewayError> {
        let buckets: Vec<_> = self.buckets.lock().values().cloned().collect();
        for bucket in buckets {
            tokio::select! {
                _guard = Arc::clone(&bucket.turn).lock_owned() => {}
                err = ctx.done() => return Err(err),
            }
        }
        Ok(())
    }
}

/// Exclusive hold on one identify bucket.
///
/// Releasing (explicitly or on drop) starts the bucket's window.
#[derive(Debug)]
#[must_use = "dropping the permit releases the bucket immediately"]
pub struct IdentifyPermit {
    turn: Option<(OwnedMutexGuard<()>, Ticket)>,
    window: Duration,
}

impl IdentifyPermit {
    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some((guard, ticket)) = self.turn.take() {
            ticket.bucket.schedule.lock().reset = Some(Instant::now() + self.window);
            // the reset is visible before the next holder can take the turn
            drop(ticket);
            drop(guard);
        }
    }
}

impl Drop for IdentifyPermit {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[tokio::test(start_paused = true)]
    async fn buckets_space_identifies_by_window() {
        let limiter = Arc::new(IdentifyRateLimiter::with_window(2, Duration::from_millis(100)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for shard_id in 0..4u64 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let permit = limiter.wait(&Context::background(), shard_id).await.unwrap();
                let granted = start.elapsed();
                permit.release();
                granted
            }));
        }

        let mut granted = Vec::new();
        for handle in handles {
            granted.push(handle.await.unwrap());
        }
        granted.sort();

        assert_eq!(
            granted,
            vec![
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(100),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_before_reset_leaves_bucket_free() {
        let limiter = IdentifyRateLimiter::with_window(1, Duration::from_secs(5));
        limiter.wait(&Context::background(), 0).await.unwrap().release();

        let ctx = Context::with_timeout(Duration::from_secs(1));
        let start = Instant::now();
        let err = limiter.wait(&ctx, 0).await.err().unwrap();
        assert!(matches!(err, GatewayError::DeadlineExceeded));
        assert_eq!(start.elapsed(), Duration::ZERO);

        // the reset did not move: a patient waiter still gets in at 5s
        let permit = limiter.wait(&Context::background(), 0).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        drop(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_waiter_past_deadline_fails_without_waiting() {
        let limiter = IdentifyRateLimiter::with_window(1, Duration::from_secs(5));
        let start = Instant::now();
        limiter.wait(&Context::background(), 0).await.unwrap().release();

        // shard 1 takes the turn and sleeps toward the 5s reset
        let background = Context::background();
        let mut queued = task::spawn(limiter.wait(&background, 1));
        assert_pending!(queued.poll());

        // shard 2 could get in at 10s at the earliest
        let ctx = Context::with_timeout(Duration::from_secs(1));
        let err = limiter.wait(&ctx, 2).await.err().unwrap();
        assert!(matches!(err, GatewayError::DeadlineExceeded));
        assert_eq!(start.elapsed(), Duration::ZERO);

        // a deadline past the earliest grant is allowed to queue
        let ctx = Context::with_timeout(Duration::from_secs(11));
        let mut patient = task::spawn(limiter.wait(&ctx, 3));
        assert_pending!(patient.poll());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let permit = assert_ready_ok!(queued.poll());
        permit.release();
        assert!(patient.is_woken());
        assert_pending!(patient.poll());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let permit = assert_ready_ok!(patient.poll());
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        drop(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_behind_held_permit_fails_fast() {
        let limiter = IdentifyRateLimiter::with_window(1, Duration::from_secs(5));
        let start = Instant::now();
        let held = limiter.wait(&Context::background(), 0).await.unwrap();

        let ctx = Context::with_timeout(Duration::from_secs(1));
        let err = limiter.wait(&ctx, 0).await.err().unwrap();
        assert!(matches!(err, GatewayError::DeadlineExceeded));
        assert_eq!(start.elapsed(), Duration::ZERO);

        held.release();
        let permit = limiter.wait(&Context::background(), 0).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        drop(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn shards_in_different_buckets_do_not_wait() {
        let limiter = IdentifyRateLimiter::with_window(16, Duration::from_secs(5));
        assert_eq!(limiter.bucket_key(17), 1);

        let start = Instant::now();
        for shard_id in 0..16 {
            limiter.wait(&Context::background(), shard_id).await.unwrap().release();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_held_permits() {
        let limiter = IdentifyRateLimiter::new(1);
        let ctx = Context::background();
        let permit = limiter.wait(&ctx, 0).await.unwrap();

        let mut close = task::spawn(limiter.close(&ctx));
        assert_pending!(close.poll());

        permit.release();
        assert!(close.is_woken());
        assert_ready_ok!(close.poll());
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let limiter = IdentifyRateLimiter::new(0);
        assert_eq!(limiter.max_concurrency(), 1);
        assert_eq!(limiter.bucket_key(9), 0);
    }
}
