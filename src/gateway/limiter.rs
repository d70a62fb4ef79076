//! Token bucket for outbound call rate.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Client-side rate limiter; burst equals one second worth of tokens
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_second: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `None` unless the rate is finite and positive
    pub fn new(rate_per_second: f64) -> Option<Self> {
        if !is_valid_rate(rate_per_second) {
            return None;
        }
        let burst = rate_per_second.max(1.0);
        Some(Self {
            rate_per_second,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        })
    }

    /// Reserve a token, waiting for it if needed.
    ///
    /// Returns the required wait as `Err` without reserving when it would
    /// exceed `max_wait`.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), Duration> {
        let wait = {
            let mut bucket = self.bucket.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.burst);
            bucket.refilled_at = now;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return Ok(());
            }

            let wait = Duration::try_from_secs_f64((1.0 - bucket.tokens) / self.rate_per_second)
                .unwrap_or(Duration::MAX);
            if wait > max_wait {
                return Err(wait);
            }
            bucket.tokens -= 1.0;
            wait
        };

        tokio::time::sleep(wait).await;
        Ok(())
    }
}

pub fn is_valid_rate(rate_per_second: f64) -> bool {
    rate_per_second.is_finite() && rate_per_second > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_wait() {
        let limiter = RateLimiter::new(2.0).unwrap();

        assert!(limiter.acquire(Duration::ZERO).await.is_ok());
        assert!(limiter.acquire(Duration::ZERO).await.is_ok());

        // Bucket is empty: a third call needs ~500ms
        let denied = limiter.acquire(Duration::from_millis(100)).await;
        assert!(matches!(denied, Err(wait) if wait >= Duration::from_millis(400)));

        let start = Instant::now();
        assert!(limiter.acquire(Duration::from_secs(1)).await.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn test_rejects_unusable_rates() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(RateLimiter::new(rate).is_none(), "rate {} accepted", rate);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_rate_reports_wait_instead_of_panicking() {
        let limiter = RateLimiter::new(1e-300).unwrap();

        assert!(limiter.acquire(Duration::ZERO).await.is_ok());
        let denied = limiter.acquire(Duration::from_secs(5)).await;
        assert_eq!(denied, Err(Duration::MAX));
    }
}
