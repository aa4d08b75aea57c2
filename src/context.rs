//! Cooperative cancellation for blocking gateway operations
//!
//! A [`Context`] pairs a cancellation token with an optional deadline. Every
//! wait in the crate (open, send, rate limiter acquisition, bulk shard
//! operations) selects between "resource available" and "context done".

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;

/// Cancellation token plus optional deadline.
///
/// Cloning shares the token; [`Context::child`] derives a context that is
/// cancelled with its parent but can also be cancelled on its own.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never expires on its own.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Derive a context bounded by `timeout`, keeping the earlier deadline.
    pub fn timeout(&self, timeout: Duration) -> Self {
        self.deadline_at(Instant::now() + timeout)
    }

    /// Derive a context bounded by `deadline`, keeping the earlier deadline.
    pub fn deadline_at(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derive a context cancelled together with this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Wrap an existing token (used by the reconnect supervisor).
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Error to report if the context is already done, `None` otherwise.
    pub fn err(&self) -> Option<GatewayError> {
        if self.token.is_cancelled() {
            return Some(GatewayError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(GatewayError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> GatewayError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => GatewayError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => GatewayError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                GatewayError::Cancelled
            }
        }
    }

    /// Sleep until `at`, failing fast when the deadline falls before it.
    ///
    /// Returns `DeadlineExceeded` immediately, without sleeping, when the
    /// deadline would be hit first.
    pub async fn sleep_until(&self, at: Instant) -> Result<(), GatewayError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        if let Some(deadline) = self.deadline {
            if deadline < at {
                return Err(GatewayError::DeadlineExceeded);
            }
        }
        tokio::select! {
            _ = self.token.cancelled() => Err(GatewayError::Cancelled),
            _ = tokio::time::sleep_until(at) => Ok(()),
        }
    }

    /// Run `future` until it completes or the context is done.
    pub async fn run<F, T>(&self, future: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            result = future => result,
            err = self.done() => Err(err),
        }
    }
}
