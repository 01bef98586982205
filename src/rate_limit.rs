//! Global rate limits as a token bucket keyed by (wallet, action class).
//!
//! One dedicated component instead of counters scattered across engines.
//! Feature-flagged: disabled limiters approve everything.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::models::ActionClass;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub enabled: bool,
    /// Bucket capacity (burst size).
    pub capacity: u32,
    /// Tokens restored per minute.
    pub refill_per_minute: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 10,
            refill_per_minute: 2.0,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<(String, ActionClass), TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for (wallet, action). Returns false when the bucket is
    /// empty; the caller defers or fails the work as a recoverable error.
    pub fn try_acquire(&self, wallet: &str, action: ActionClass, now: DateTime<Utc>) -> bool {
        if !self.config.enabled {
            return true;
        }

        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets
            .entry((wallet.to_string(), action))
            .or_insert_with(|| TokenBucket {
                tokens: self.config.capacity as f64,
                last_refill: now,
            });

        let elapsed_secs = (now - bucket.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        let refill = elapsed_secs * self.config.refill_per_minute / 60.0;
        bucket.tokens = (bucket.tokens + refill).min(self.config.capacity as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn disabled_limiter_always_approves() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        let now = Utc::now();
        for _ in 0..1000 {
            assert!(limiter.try_acquire("0xwallet", ActionClass::Swap, now));
        }
    }

    #[test]
    fn bucket_drains_and_refills() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            enabled: true,
            capacity: 2,
            refill_per_minute: 60.0, // one token per second
        });
        let now = Utc::now();

        assert!(limiter.try_acquire("0xwallet", ActionClass::Swap, now));
        assert!(limiter.try_acquire("0xwallet", ActionClass::Swap, now));
        assert!(!limiter.try_acquire("0xwallet", ActionClass::Swap, now));

        // One second restores one token.
        let later = now + Duration::seconds(1);
        assert!(limiter.try_acquire("0xwallet", ActionClass::Swap, later));
        assert!(!limiter.try_acquire("0xwallet", ActionClass::Swap, later));
    }

    #[test]
    fn buckets_are_keyed_per_wallet_and_action() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            enabled: true,
            capacity: 1,
            refill_per_minute: 0.0,
        });
        let now = Utc::now();

        assert!(limiter.try_acquire("0xa", ActionClass::Swap, now));
        assert!(!limiter.try_acquire("0xa", ActionClass::Swap, now));
        // Different action class and different wallet each get their own bucket.
        assert!(limiter.try_acquire("0xa", ActionClass::Transfer, now));
        assert!(limiter.try_acquire("0xb", ActionClass::Swap, now));
    }
}
