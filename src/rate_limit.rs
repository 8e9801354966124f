//! Per-session token-bucket rate limiting.
//!
//! Each session owns a bucket refilled lazily at consumption time; there is
//! no background refill timer. Capacity defaults to twice the sustained rate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucketRateLimiter {
    rate: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucketRateLimiter {
    /// `rate` tokens per second with the default burst of `2 * rate`.
    pub fn new(rate: f64) -> Self {
        Self::with_burst(rate, rate * 2.0)
    }

    pub fn with_burst(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Consume one token for this session. Exactly one token per
    /// client-to-server request; server-to-client responses never consume.
    pub fn allow(&self, session_id: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(session_id.to_owned()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until the next token becomes available, for `Retry-After`
    /// semantics. Informational: the bucket refills continuously.
    pub fn retry_after(&self, session_id: &str) -> f64 {
        let buckets = self.buckets.lock().unwrap();
        match buckets.get(session_id) {
            Some(bucket) if bucket.tokens < 1.0 => (1.0 - bucket.tokens) / self.rate,
            _ => 0.0,
        }
    }

    /// Drop a session's bucket on eviction.
    pub fn remove(&self, session_id: &str) {
        self.buckets.lock().unwrap().remove(session_id);
    }

    pub fn clear(&self) {
        self.buckets.lock().unwrap().clear();
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_exhaustion() {
        let limiter = TokenBucketRateLimiter::new(5.0);
        // Full burst of 10 goes through, the 11th immediate request does not.
        for _ in 0..10 {
            assert!(limiter.allow("s"));
        }
        assert!(!limiter.allow("s"));
        assert!(limiter.retry_after("s") > 0.0);
    }

    #[test]
    fn test_lazy_refill() {
        let limiter = TokenBucketRateLimiter::with_burst(1000.0, 1.0);
        assert!(limiter.allow("s"));
        assert!(!limiter.allow("s"));
        // At 1000 tokens/s one millisecond is plenty.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(limiter.allow("s"));
    }

    #[test]
    fn test_buckets_are_per_session() {
        let limiter = TokenBucketRateLimiter::with_burst(1.0, 1.0);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_remove_resets_session() {
        let limiter = TokenBucketRateLimiter::with_burst(1.0, 1.0);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        limiter.remove("a");
        // A fresh bucket starts at full burst again.
        assert!(limiter.allow("a"));
    }

    #[test]
    fn test_sustained_rate_bounds() {
        let limiter = TokenBucketRateLimiter::new(50.0);
        // Drain the burst.
        while limiter.allow("s") {}
        // Over 200 ms at 50 tokens/s roughly 10 tokens accrue; accept a
        // generous window around that.
        std::thread::sleep(std::time::Duration::from_millis(200));
        let mut granted = 0;
        while limiter.allow("s") {
            granted += 1;
        }
        assert!((5..=15).contains(&granted), "granted {granted}");
    }
}
