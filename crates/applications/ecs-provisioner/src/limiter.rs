//! Launch rate limiter
//!
//! Token bucket shared by every `create` call of one provider: one token per
//! second steady refill, burst set by the operator's provisioning QPS.
//! Waiters queue on a FIFO mutex so acquisition is served in arrival order.
//!
//! The bucket refills on the wall clock while deadlines run on tokio time. On
//! a paused-clock runtime a wait that needs a refill cannot complete: tokio
//! jumps straight to the deadline and the wait fails with
//! [`ProvisionError::RateLimitExceeded`]. Tokens already in the bucket are
//! still served.

use ecs_provisioner_core::{ProvisionError, Result};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Token bucket limiting provisioning-group submissions
pub struct LaunchRateLimiter {
    bucket: DefaultDirectRateLimiter,
    queue: Mutex<()>,
    burst: NonZeroU32,
}

impl LaunchRateLimiter {
    /// One token per second, `burst` tokens of headroom (at least one)
    pub fn new(burst: u32) -> Self {
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(NonZeroU32::MIN).allow_burst(burst);

        debug!(burst = burst.get(), "launch rate limiter created");

        Self {
            bucket: RateLimiter::direct(quota),
            queue: Mutex::new(()),
            burst,
        }
    }

    /// Burst capacity
    pub fn burst(&self) -> u32 {
        self.burst.get()
    }

    /// Wait for a token until `deadline`.
    ///
    /// Fails with [`ProvisionError::RateLimitExceeded`] if the deadline passes
    /// first. Dropping the returned future gives up the caller's place in line.
    pub async fn wait(&self, deadline: Instant) -> Result<()> {
        let acquire = async {
            let _turn = self.queue.lock().await;
            self.bucket.until_ready().await;
        };

        match tokio::time::timeout_at(deadline, acquire).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("rate limit exceeded while waiting to launch");
                Err(ProvisionError::RateLimitExceeded(
                    "deadline passed before a launch token was available".to_string(),
                ))
            }
        }
    }

    /// Take a token only if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.bucket.check().is_ok()
    }
}

impl std::fmt::Debug for LaunchRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchRateLimiter")
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_burst_then_deadline() {
        let limiter = LaunchRateLimiter::new(2);
        let soon = Instant::now() + Duration::from_millis(50);

        assert!(limiter.wait(soon).await.is_ok());
        assert!(limiter.wait(soon).await.is_ok());

        let err = limiter.wait(Instant::now() + Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::RateLimitExceeded(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_refill_one_per_second() {
        let limiter = LaunchRateLimiter::new(1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        let started = std::time::Instant::now();
        limiter
            .wait(Instant::now() + Duration::from_secs(3))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_clock_serves_burst_then_hits_deadline() {
        let limiter = LaunchRateLimiter::new(2);
        let deadline = Instant::now() + Duration::from_secs(10);

        assert!(limiter.wait(deadline).await.is_ok());
        assert!(limiter.wait(deadline).await.is_ok());

        // Refill is wall-clock; the paused runtime advances to the deadline instead
        let err = limiter.wait(deadline).await.unwrap_err();
        assert!(matches!(err, ProvisionError::RateLimitExceeded(_)));
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test]
    async fn test_zero_burst_clamped_to_one() {
        let limiter = LaunchRateLimiter::new(0);
        assert_eq!(limiter.burst(), 1);
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_concurrent_waiters_all_served() {
        let limiter = Arc::new(LaunchRateLimiter::new(4));
        let deadline = Instant::now() + Duration::from_secs(1);

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.wait(deadline).await })
            })
            .collect();

        for waiter in futures::future::join_all(waiters).await {
            assert!(waiter.unwrap().is_ok());
        }
        assert!(!limiter.try_acquire());
    }
}
