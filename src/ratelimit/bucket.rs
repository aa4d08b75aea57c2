use std::time::Duration;

use tokio::time::Instant;

/// Quota record for one limiter key.
///
/// Quota returns to `limit` only once `reset` has passed. The window opens
/// on the first consumption after a refill.
#[derive(Debug, Clone, Copy)]
pub struct RateBucket {
    limit: u32,
    remaining: u32,
    reset: Option<Instant>,
    window: Duration,
}

impl RateBucket {
    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            remaining: limit,
            reset: None,
            window,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn reset(&self) -> Option<Instant> {
        self.reset
    }

    /// Refill if the window has elapsed.
    pub fn refresh(&mut self, now: Instant) {
        if self.reset.is_some_and(|reset| now >= reset) {
            self.remaining = self.limit;
            self.reset = None;
        }
    }

    /// When quota next becomes available; `None` means now.
    pub fn available_at(&mut self, now: Instant) -> Option<Instant> {
        self.refresh(now);
        if self.remaining > 0 {
            None
        } else {
            self.reset
        }
    }

    /// Take one unit of quota, opening a window if none is running.
    pub fn consume(&mut self, now: Instant) {
        self.refresh(now);
        if self.reset.is_none() {
            self.reset = Some(now + self.window);
        }
        self.remaining = self.remaining.saturating_sub(1);
    }
}
