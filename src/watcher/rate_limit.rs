//! Token-bucket rate limiter for one remote chain endpoint.
//!
//! The bucket holds up to `rate` tokens and refills continuously at `rate`
//! tokens per second. Callers queue on an async mutex, so tokens are handed
//! out in FIFO order.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter bounding requests per second.
///
/// # Example
/// ```ignore
/// let limiter = RateLimiter::new(10.0);
/// limiter.take().await;
/// client.post(url).send().await?;
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    /// Requests per second; `None` disables limiting.
    rate: Option<f64>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter allowing `requests_per_second` sustained requests, with
    /// a burst of the same size.
    pub fn new(requests_per_second: f64) -> Self {
        let rate = (requests_per_second > 0.0).then_some(requests_per_second);
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate.unwrap_or(0.0).max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(0.0)
    }

    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    /// Wait until a token is available and consume it.
    pub async fn take(&self) {
        let Some(rate) = self.rate else {
            return;
        };
        let capacity = rate.max(1.0);

        // The guard is held across the sleep so queued callers are served in order.
        let mut bucket = self.bucket.lock().await;
        refill(&mut bucket, rate, capacity);

        if bucket.tokens < 1.0 {
            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / rate);
            tracing::trace!(target: "watcher::rate_limit", ?wait, "Rate limit: waiting for token");
            tokio::time::sleep(wait).await;
            refill(&mut bucket, rate, capacity);
        }

        bucket.tokens = (bucket.tokens - 1.0).max(0.0);
    }

    /// Consume a token if one is available right now.
    pub async fn try_take(&self) -> bool {
        let Some(rate) = self.rate else {
            return true;
        };
        let mut bucket = self.bucket.lock().await;
        refill(&mut bucket, rate, rate.max(1.0));
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

fn refill(bucket: &mut Bucket, rate: f64, capacity: f64) {
    let now = Instant::now();
    let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
    bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
    bucket.last_refill = now;
}
