//! Per-tenant token bucket. Configurable requests-per-minute with a burst
//! ceiling; exhaustion answers 429 with Retry-After.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    rpm: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(rpm: u32, burst: u32) -> Self {
        RateLimiter {
            rpm: rpm as f64,
            burst: burst as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Ok(()) if a token was available, Err(seconds until the next one).
    pub async fn check(&self, tenant_id: &str) -> Result<(), u64> {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(tenant_id.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rpm / 60.0).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let secs = (deficit * 60.0 / self.rpm).ceil() as u64;
            Err(secs.max(1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_throttle() {
        let limiter = RateLimiter::new(60, 3);
        assert!(limiter.check("t1").await.is_ok());
        assert!(limiter.check("t1").await.is_ok());
        assert!(limiter.check("t1").await.is_ok());
        let retry = limiter.check("t1").await.unwrap_err();
        assert!(retry >= 1);
        // Another tenant has its own bucket.
        assert!(limiter.check("t2").await.is_ok());
    }
}
