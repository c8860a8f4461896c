//! Requeue delays: per-item exponential backoff combined with a shared token bucket.

use std::hash::Hash;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub qps: f64,
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(5), max_delay: Duration::from_secs(1000), qps: 10.0, burst: 100 }
    }
}

/// Token bucket where a request always gets a reservation; when the bucket
/// is empty the reservation lies in the future and the wait is returned.
#[derive(Debug)]
struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, tokens: burst, last: Instant::now() }
    }

    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

/// Computes how long a failed key waits before redelivery.
#[derive(Debug)]
pub struct RateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
    bucket: TokenBucket,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self {
            base: cfg.base_delay,
            max: cfg.max_delay,
            failures: FxHashMap::default(),
            bucket: TokenBucket::new(cfg.qps, cfg.burst),
        }
    }

    /// Record a failure of `key` and return its delay: `base * 2^failures`
    /// capped at `max`, or the token bucket wait if that is longer.
    pub fn when(&mut self, key: &K) -> Duration {
        let n = self.failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        let item = self
            .base
            .checked_mul(2u32.saturating_pow(exp.min(31)))
            .map(|d| d.min(self.max))
            .unwrap_or(self.max);
        item.max(self.bucket.reserve(Instant::now()))
    }

    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_per_item_then_capped() {
        let mut rl = RateLimiter::new(RateLimiterConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(30),
            qps: 1000.0,
            burst: 1000,
        });
        assert_eq!(rl.when(&"a"), Duration::from_millis(5));
        assert_eq!(rl.when(&"a"), Duration::from_millis(10));
        assert_eq!(rl.when(&"a"), Duration::from_millis(20));
        assert_eq!(rl.when(&"a"), Duration::from_millis(30));
        assert_eq!(rl.when(&"b"), Duration::from_millis(5));
        assert_eq!(rl.num_requeues(&"a"), 4);
        rl.forget(&"a");
        assert_eq!(rl.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn huge_failure_counts_saturate_to_max() {
        let mut rl = RateLimiter::new(RateLimiterConfig::default());
        for _ in 0..200 {
            rl.when(&1u32);
        }
        assert_eq!(rl.when(&1u32), Duration::from_secs(1000));
    }

    #[test]
    fn bucket_delays_after_burst() {
        let mut bucket = TokenBucket::new(10.0, 2);
        let now = bucket.last;
        assert_eq!(bucket.reserve(now), Duration::ZERO);
        assert_eq!(bucket.reserve(now), Duration::ZERO);
        let wait = bucket.reserve(now);
        assert!(wait >= Duration::from_millis(99) && wait <= Duration::from_millis(101), "{:?}", wait);
    }
}
