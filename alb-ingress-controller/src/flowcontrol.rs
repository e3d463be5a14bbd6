use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio_util::sync::CancellationToken;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Rate limiter for full synchronizations with a burst of one.
pub struct SyncRateLimiter {
    limiter: Option<DirectRateLimiter>,
    period: Duration,
}

impl SyncRateLimiter {
    /// Admit at most `qps` calls per second, a non-positive or non-finite rate
    /// disables limiting.
    pub fn new(qps: f64) -> Self {
        let quota = if qps > 0.0 && qps.is_finite() {
            Quota::with_period(Duration::from_secs_f64(1.0 / qps))
        } else {
            None
        };
        match quota {
            Some(quota) => Self {
                period: quota.replenish_interval(),
                limiter: Some(RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN))),
            },
            None => Self {
                limiter: None,
                period: Duration::ZERO,
            },
        }
    }

    /// Wait for a permit. Returns `false` if `stop` fired first.
    pub async fn until_ready(&self, stop: &CancellationToken) -> bool {
        let Some(limiter) = &self.limiter else {
            return !stop.is_cancelled();
        };
        tokio::select! {
            _ = stop.cancelled() => false,
            _ = limiter.until_ready() => true,
        }
    }

    /// Time between two permits, zero when unlimited.
    pub fn period(&self) -> Duration {
        self.period
    }
}
