//! Per-domain rate limiting using the token bucket algorithm
//!
//! Each recipient domain gets its own bucket holding up to `per_minute`
//! tokens, refilled continuously at `per_minute / 60` tokens per second.
//! Every delivery attempt consumes one token; an empty bucket means the
//! attempt is rejected as transient and retried later.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Default deliveries per minute per domain (default: 20)
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,

    /// Per-domain overrides of `per_minute`
    #[serde(default)]
    pub domain_limits: HashMap<String, u32>,
}

const fn default_per_minute() -> u32 {
    20
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            domain_limits: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed.mul_add(self.refill_rate, self.tokens).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else if self.refill_rate <= 0.0 {
            Duration::MAX
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn bucket(&self, domain: &str) -> Arc<Mutex<TokenBucket>> {
        let domain = domain.to_ascii_lowercase();
        self.buckets
            .entry(domain.clone())
            .or_insert_with(|| {
                let per_minute = self
                    .config
                    .domain_limits
                    .get(&domain)
                    .copied()
                    .unwrap_or(self.config.per_minute);
                Arc::new(Mutex::new(TokenBucket::new(per_minute)))
            })
            .clone()
    }

    /// Take a token for `domain`.
    ///
    /// Returns `Err` with the time until the next token if the bucket is empty.
    pub fn check(&self, domain: &str) -> Result<(), Duration> {
        let bucket = self.bucket(domain);
        let mut bucket = bucket.lock();

        if bucket.try_consume() {
            Ok(())
        } else {
            let wait = bucket.time_until_available();
            drop(bucket);
            tracing::debug!(
                domain,
                wait_seconds = wait.as_secs_f64(),
                "Rate limit exceeded"
            );
            Err(wait)
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
