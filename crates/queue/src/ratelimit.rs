//! Rate limiters deciding how long a failed key waits before it is handed out again.

use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Per-key retry delay policy.
pub trait RateLimiter<K>: Send {
    /// Delay before `key` may be retried; records one more failure for it.
    fn when(&mut self, key: &K) -> Duration;
    /// Drop all retry state for `key`.
    fn forget(&mut self, key: &K);
    /// Failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;
}

/// `base * 2^failures`, capped at `max`, tracked per key.
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: FxHashMap::default() }
    }

    /// Delay for the `n`-th retry (0-based). Monotonically non-decreasing in `n`.
    pub fn backoff_for(&self, n: u32) -> Duration {
        2u32.checked_pow(n)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&mut self, key: &K) -> Duration {
        let n = self.failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        self.backoff_for(exp)
    }

    fn forget(&mut self, key: &K) { self.failures.remove(key); }

    fn num_requeues(&self, key: &K) -> u32 { self.failures.get(key).copied().unwrap_or(0) }
}

/// Overall token bucket shared by every key: `qps` refill with a `burst` ceiling.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Option<Instant>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, tokens: burst, last: None }
    }

    fn reserve(&mut self, now: Instant) -> Duration {
        if let Some(last) = self.last {
            let refill = now.saturating_duration_since(last).as_secs_f64() * self.qps;
            self.tokens = (self.tokens + refill).min(self.burst);
        }
        self.last = Some(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&mut self, _key: &K) -> Duration { self.reserve(Instant::now()) }
    fn forget(&mut self, _key: &K) {}
    fn num_requeues(&self, _key: &K) -> u32 { 0 }
}

/// Combines limiters by taking the longest delay and the highest retry count.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&mut self, key: &K) -> Duration {
        self.limiters.iter_mut().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, key: &K) {
        for l in self.limiters.iter_mut() {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-key exponential backoff (5ms .. 1000s) combined with an overall 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::<K>::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let mut rl = ItemExponentialFailureRateLimiter::<&str>::new(Duration::from_millis(5), Duration::from_secs(1));
        assert_eq!(rl.when(&"a"), Duration::from_millis(5));
        assert_eq!(rl.when(&"a"), Duration::from_millis(10));
        assert_eq!(rl.when(&"a"), Duration::from_millis(20));
        assert_eq!(rl.num_requeues(&"a"), 3);
        assert_eq!(rl.num_requeues(&"b"), 0);
        assert_eq!(rl.backoff_for(40), Duration::from_secs(1));
        rl.forget(&"a");
        assert_eq!(rl.num_requeues(&"a"), 0);
        assert_eq!(rl.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn backoff_is_monotonic() {
        let rl = ItemExponentialFailureRateLimiter::<u8>::new(Duration::from_millis(5), Duration::from_secs(1000));
        let delays: Vec<_> = (0..64).map(|n| rl.backoff_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn bucket_allows_burst_then_spaces_out() {
        let mut b = BucketRateLimiter::new(10.0, 2);
        let t0 = Instant::now();
        assert_eq!(b.reserve(t0), Duration::ZERO);
        assert_eq!(b.reserve(t0), Duration::ZERO);
        let third = b.reserve(t0);
        assert!(third > Duration::from_millis(90) && third <= Duration::from_millis(100), "{:?}", third);
        // a full second refills the bucket
        assert_eq!(b.reserve(t0 + Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn max_of_takes_longest_delay_and_highest_count() {
        let mut rl: MaxOfRateLimiter<u8> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(10))),
            Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(50), Duration::from_secs(10))),
        ]);
        assert_eq!(rl.when(&1), Duration::from_millis(50));
        assert_eq!(rl.num_requeues(&1), 1);
        rl.forget(&1);
        assert_eq!(rl.num_requeues(&1), 0);
    }
}
