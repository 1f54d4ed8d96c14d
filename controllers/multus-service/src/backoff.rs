//! # Requeue rate limiting
//!
//! Decides how long a failed work item waits before it is handed to a worker
//! again. Two limiters are combined:
//!
//! - a per-item exponential backoff (5ms, 10ms, 20ms, ... capped at 1000s)
//!   that slows down one repeatedly failing key without affecting the others;
//! - an overall token bucket (10 per second, burst 100) that caps the total
//!   requeue rate when many keys fail at once.
//!
//! The per-item limiter also owns the failure count the worker consults to
//! enforce the retry bound.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Per-item exponential base delay of the default limiter
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Per-item delay cap of the default limiter
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
/// Overall refill rate of the default limiter, in items per second
pub const DEFAULT_QPS: f64 = 10.0;
/// Overall burst size of the default limiter
pub const DEFAULT_BURST: u32 = 100;

/// Rate limiter for requeued work items
pub trait RateLimiter<K>: Send + Sync {
    /// How long `item` should wait before being processed again; records a failure.
    fn when(&self, item: &K) -> Duration;

    /// Clears the failure history of `item`.
    fn forget(&self, item: &K);

    /// Number of failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &K) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
#[derive(Debug)]
pub struct ItemExponentialRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ItemExponentialRateLimiter<K> {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay for the `failures`-th consecutive failure (0-indexed), stateless.
    #[must_use]
    pub fn delay_for(base: Duration, max: Duration, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        base.checked_mul(factor).map_or(max, |delay| delay.min(max))
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemExponentialRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(item.clone()).or_insert(0);
        let delay = Self::delay_for(self.base, self.max, *count);
        *count = count.saturating_add(1);
        delay
    }

    fn forget(&self, item: &K) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all items.
///
/// Each call reserves one token; once the bucket is empty the reservation
/// is paid for with a delay.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Combines limiters: the longest delay and the highest failure count win
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> std::fmt::Debug for MaxOfRateLimiter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaxOfRateLimiter")
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl<K> MaxOfRateLimiter<K> {
    #[must_use]
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> MaxOfRateLimiter<K> {
    /// Per-item exponential backoff combined with the overall token bucket
    #[must_use]
    pub fn default_controller() -> Self {
        Self::new(vec![
            Box::new(ItemExponentialRateLimiter::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)),
            Box::new(BucketRateLimiter::new(DEFAULT_QPS, DEFAULT_BURST)),
        ])
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}
