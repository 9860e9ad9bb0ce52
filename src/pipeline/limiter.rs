//! Token-bucket limiter for remote requests.
//!
//! Every remote attempt, retries included, takes one token. The bucket
//! refills at `requests_per_minute / 60` tokens per second and holds up to
//! `burst` tokens, so a freshly started run can fire one request per worker
//! immediately and then settles to the sustained rate.

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

/// Largest burst allowed regardless of worker count.
pub const MAX_BURST: u32 = 10;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `requests_per_minute` and `burst` are raised to at least 1.
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.clamp(1, MAX_BURST));
        Self {
            rate_per_sec: f64::from(requests_per_minute.max(1)) / 60.0,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and take it. Returns the time waited.
    ///
    /// Waiters are served in arrival order: the lock is held across the
    /// sleep.
    pub async fn acquire(&self) -> Duration {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Duration::ZERO;
        }

        let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate_per_sec);
        debug!("Rate limiter: waiting {:?}", wait);
        sleep(wait).await;
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now();
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_free_then_rate_applies() {
        // 600 rpm = one token every 100 ms.
        let limiter = RateLimiter::new(600, 2);
        let start = Instant::now();
        assert_eq!(limiter.acquire().await, Duration::ZERO);
        assert_eq!(limiter.acquire().await, Duration::ZERO);
        assert!(start.elapsed() < Duration::from_millis(50));

        let waited = limiter.acquire().await;
        assert!(waited > Duration::from_millis(50), "{waited:?}");
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn degenerate_arguments_are_clamped() {
        let limiter = RateLimiter::new(0, 0);
        assert_eq!(limiter.capacity, 1.0);
        assert!((limiter.rate_per_sec - 1.0 / 60.0).abs() < 1e-9);
        assert_eq!(RateLimiter::new(60, 50).capacity, f64::from(MAX_BURST));
    }
}
