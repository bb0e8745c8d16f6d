//! Reconcile rate limiting
//!
//! Failed reconciles back off exponentially per Manifest while a token
//! bucket bounds the overall requeue rate across Manifests; the more
//! restrictive of the two delays wins. Requeue intervals for the regular
//! state machine are randomized by ±10% so fleets of Manifests do not
//! reconcile in lockstep.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use std::sync::Mutex;
use tokio::time::Instant;

/// Base requeue intervals, randomized per reconcile
#[derive(Clone, Copy, Debug)]
pub struct RequeueIntervals {
    /// Requeue delay after a successful round
    pub success: Duration,
    /// Requeue delay after a failed round
    pub failure: Duration,
    /// Requeue delay while waiting on readiness
    pub waiting: Duration,
}

impl Default for RequeueIntervals {
    fn default() -> Self {
        Self {
            success: Duration::from_secs(20),
            failure: Duration::from_secs(10),
            waiting: Duration::from_secs(2),
        }
    }
}

/// Randomize a duration by ±10%, independently per call
pub fn randomize_by_ten_percent(duration: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    duration.mul_f64(factor)
}

/// Combined per-item exponential backoff and global token bucket
pub struct RateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    failures: DashMap<String, u32>,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Limiter with the given per-item backoff range and bucket rate
    pub fn new(base_delay: Duration, max_delay: Duration, qps: f64, burst: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: DashMap::new(),
            bucket: Mutex::new(TokenBucket::new(qps, burst)),
        }
    }

    /// Delay before the next retry of `key`; records the failure
    pub fn when(&self, key: &str) -> Duration {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        let exponent = *entry;
        *entry = entry.saturating_add(1);
        drop(entry);

        let backoff = self.exponential_delay(exponent);
        let bucket = self
            .bucket
            .lock()
            .map(|mut b| b.reserve(Instant::now()))
            .unwrap_or(Duration::ZERO);
        backoff.max(bucket)
    }

    /// Clear the failure history of `key` after a successful reconcile
    pub fn forget(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Number of recorded consecutive failures for `key`
    pub fn retries(&self, key: &str) -> u32 {
        self.failures.get(key).map(|entry| *entry).unwrap_or(0)
    }

    fn exponential_delay(&self, exponent: u32) -> Duration {
        let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
        self.base_delay
            .checked_mul(factor.min(u32::MAX as u64) as u32)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(1000), 30.0, 200.0)
    }
}

struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last_refill: Option<Instant>,
}

impl TokenBucket {
    fn new(qps: f64, burst: f64) -> Self {
        Self {
            qps,
            burst,
            tokens: burst,
            last_refill: None,
        }
    }

    /// Reserve one token; returns how long the caller must wait for it.
    /// Reservations may drive the balance negative, queueing callers.
    fn reserve(&mut self, now: Instant) -> Duration {
        if let Some(last) = self.last_refill {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        }
        self.last_refill = Some(now);

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}
