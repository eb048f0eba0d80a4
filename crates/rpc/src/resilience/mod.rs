//! Request admission: circuit breaking on the caller side, rate limiting on the provider side.

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{Admission, BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use rate_limiter::{RateLimitConfig, RateLimiter, TokenBucket};

use crate::address::Address;

use std::sync::Arc;

use dashmap::DashMap;

/// Circuit breakers keyed by remote address, created on first use.
#[derive(Debug, Clone, Default)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<DashMap<Address, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create a registry handing out breakers with the given thresholds.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(DashMap::new()),
        }
    }

    /// Breaker of `address`.
    #[must_use]
    pub fn get(&self, address: &Address) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(address) {
            return Arc::clone(&breaker);
        }

        Arc::clone(
            &self
                .breakers
                .entry(address.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone()))),
        )
    }

    /// Forget the breaker of `address`.
    pub fn remove(&self, address: &Address) {
        self.breakers.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakers_are_shared_per_address() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig {
            max_errors: 1,
            ..CircuitBreakerConfig::default()
        });
        let a = Address::new("10.0.0.1", 8094);
        let b = Address::new("10.0.0.2", 8094);

        registry.get(&a).record_error();
        assert!(registry.get(&a).is_break());
        assert!(!registry.get(&b).is_break());
    }
}
