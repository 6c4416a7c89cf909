//! Token-bucket rate limiter pacing outbound WebSocket connect attempts.
//!
//! Built on `governor` rather than a hand-rolled token bucket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::{Clock, DefaultClock};
use governor::{Quota, RateLimiter as GovernorLimiter};
use tracing::trace;

use crate::config::LimiterConfig;
use crate::error::LimiterError;

/// Gates outbound connect attempts, FIFO at equal priority.
///
/// Overridable: callers can plug in their own implementation (e.g. a
/// no-op limiter in tests) via
/// [`crate::manager::SubscriptionManager::with_collaborators`].
#[async_trait]
pub trait ConnectLimiter: Send + Sync {
    /// Acquire a single permit, waiting as long as necessary.
    async fn acquire(&self) -> Result<(), LimiterError>;
}

/// Acquire a permit from `limiter`, then run `task`, returning its result.
///
/// A free function rather than a trait method: a generic method would make
/// [`ConnectLimiter`] object-unsafe, and every socket holds its limiter as
/// `Arc<dyn ConnectLimiter>`.
pub async fn schedule<L, F, Fut, T>(limiter: &L, task: F) -> Result<T, LimiterError>
where
    L: ConnectLimiter + ?Sized,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    limiter.acquire().await?;
    Ok(task().await)
}

/// Default token-bucket limiter: `tokens_per_period` tokens replenish every
/// `period`, up to `burst` tokens in flight.
pub struct TokenBucketLimiter {
    inner: GovernorLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>,
    clock: DefaultClock,
}

impl TokenBucketLimiter {
    /// Build a limiter from configuration (defaults: 5 tokens/sec,
    /// replenished every 1000ms, burst 5).
    pub fn new(config: &LimiterConfig) -> Self {
        let per_cell_interval = config.period / config.tokens_per_period.get();
        let quota = Quota::with_period(per_cell_interval)
            .expect("configured period must be nonzero")
            .allow_burst(config.burst);

        Self {
            inner: GovernorLimiter::direct(quota),
            clock: DefaultClock::default(),
        }
    }

    /// Wrap in an `Arc` for sharing across sockets.
    pub fn shared(config: &LimiterConfig) -> Arc<dyn ConnectLimiter> {
        Arc::new(Self::new(config))
    }
}

impl Default for TokenBucketLimiter {
    fn default() -> Self {
        Self::new(&LimiterConfig::default())
    }
}

#[async_trait]
impl ConnectLimiter for TokenBucketLimiter {
    async fn acquire(&self) -> Result<(), LimiterError> {
        loop {
            match self.inner.check() {
                Ok(_) => return Ok(()),
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    trace!(wait_ms = wait.as_millis() as u64, "rate limited, waiting for a connect permit");
                    if wait > Duration::ZERO {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
    }
}

/// A limiter that never waits — useful for tests that don't care about
/// connect pacing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLimiter;

#[async_trait]
impl ConnectLimiter for NoopLimiter {
    async fn acquire(&self) -> Result<(), LimiterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn acquires_up_to_burst_immediately() {
        let config = LimiterConfig {
            tokens_per_period: std::num::NonZeroU32::new(5).unwrap(),
            period: Duration::from_millis(1000),
            burst: std::num::NonZeroU32::new(5).unwrap(),
        };
        let limiter = TokenBucketLimiter::new(&config);

        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await.unwrap();
        }
        // Five tokens are available immediately (the configured burst).
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn schedule_runs_task_and_returns_result() {
        let limiter = NoopLimiter;
        let counter = AtomicUsize::new(0);
        let result = schedule(&limiter, || async {
            counter.fetch_add(1, Ordering::SeqCst);
            42
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
