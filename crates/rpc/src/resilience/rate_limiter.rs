//! Token bucket rate limiting, keyed by caller address on the server side.

use crate::address::Address;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::Instant;

/// Bucket dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum number of stored tokens.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_per_second: 20,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// A single token bucket. Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_per_second: u32,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    /// Create a full bucket.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_second: config.refill_per_second,
            bucket: Mutex::new(Bucket {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if any is available.
    pub fn allow(&self) -> bool {
        let mut bucket = self.bucket.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let earned = (elapsed.as_secs_f64() * f64::from(self.refill_per_second)).floor() as u64;

        // Fractional progress is kept by not moving the refill mark
        if earned > 0 {
            let topped = u64::from(bucket.tokens).saturating_add(earned);
            #[allow(clippy::cast_possible_truncation)]
            let topped = topped.min(u64::from(self.capacity)) as u32;
            bucket.tokens = topped;
            bucket.last_refill = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently stored, without refilling.
    #[must_use]
    pub fn available(&self) -> u32 {
        self.bucket.lock().tokens
    }
}

/// One bucket per caller address.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Arc<DashMap<Address, Arc<TokenBucket>>>,
}

impl RateLimiter {
    /// Create a limiter handing out buckets of the given size.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(DashMap::new()),
        }
    }

    /// Take one token from the bucket of `peer`.
    pub fn allow(&self, peer: &Address) -> bool {
        let bucket = self.bucket(peer);
        bucket.allow()
    }

    /// Bucket of `peer`, created full on first use.
    #[must_use]
    pub fn bucket(&self, peer: &Address) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(peer) {
            return Arc::clone(&bucket);
        }

        Arc::clone(
            &self
                .buckets
                .entry(peer.clone())
                .or_insert_with(|| Arc::new(TokenBucket::new(self.config))),
        )
    }

    /// Forget the bucket of `peer`, once its connection is gone.
    pub fn remove(&self, peer: &Address) {
        self.buckets.remove(peer);
    }

    /// Number of tracked peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no peer is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ten_per_second() -> TokenBucket {
        TokenBucket::new(RateLimitConfig {
            capacity: 10,
            refill_per_second: 10,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let bucket = ten_per_second();

        for _ in 0..10 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.allow());
        assert_eq!(bucket.available(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped() {
        let bucket = ten_per_second();
        assert!(bucket.allow());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.allow());
        assert_eq!(bucket.available(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_intervals_accumulate() {
        let bucket = ten_per_second();
        for _ in 0..10 {
            assert!(bucket.allow());
        }

        // 60ms earns nothing on its own, the second 60ms completes a token
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!bucket.allow());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn test_concurrent_access_never_overspends() {
        let bucket = Arc::new(TokenBucket::new(RateLimitConfig {
            capacity: 100,
            refill_per_second: 0,
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                std::thread::spawn(move || (0..50).filter(|_| bucket.allow()).count())
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 100);
    }

    #[test]
    fn test_buckets_are_per_peer() {
        let limiter = RateLimiter::new(RateLimitConfig {
            capacity: 1,
            refill_per_second: 0,
        });
        let a = Address::new("10.0.0.1", 5000);
        let b = Address::new("10.0.0.2", 5000);

        assert!(limiter.allow(&a));
        assert!(!limiter.allow(&a));
        assert!(limiter.allow(&b));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_reconnecting_callers_do_not_accumulate() {
        let limiter = RateLimiter::new(RateLimitConfig::default());

        for port in 40_000..41_000 {
            let peer = Address::new("10.0.0.1", port);
            assert!(limiter.allow(&peer));
            limiter.remove(&peer);
        }
        assert!(limiter.is_empty());

        // Removing an unknown peer is harmless
        limiter.remove(&Address::new("10.0.0.9", 1));
        assert!(limiter.is_empty());
    }
}
