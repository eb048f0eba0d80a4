//! Client-side load balancing.
//!
//! A [`Selector`] is built per service from the registry's provider list and
//! cached until a membership change or a closing provider invalidates it.

pub mod consistent_hash;
pub mod latency;
pub mod min_response_time;
pub mod round_robin;

pub use consistent_hash::{ConsistentHash, DEFAULT_VIRTUAL_NODES};
pub use latency::{LatencySamples, LatencyTable};
pub use min_response_time::MinResponseTime;
pub use round_robin::RoundRobin;

use crate::address::{Address, ServiceKey};
use crate::error::Result;
use crate::registry::Registry;
use crate::transport::ConnectionManager;

use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, instrument};

/// Per-service selection state.
pub trait Selector: Debug + Send + Sync {
    /// Pick an address. `key` is the request's correlation id.
    ///
    /// # Errors
    ///
    /// Returns a discovery error if the selector has no addresses.
    fn select(&self, key: u64) -> Result<Address>;

    /// Addresses this selector chooses from.
    fn addresses(&self) -> &[Address];
}

/// Selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    /// Cycle through providers in registry order.
    #[default]
    RoundRobin,
    /// Hash the request id onto a ring of providers.
    ConsistentHash {
        /// Ring positions per provider.
        #[serde(default = "default_virtual_nodes")]
        virtual_nodes: u32,
    },
    /// Prefer the provider with the lowest heartbeat round-trip time.
    MinimumResponseTime,
}

const fn default_virtual_nodes() -> u32 {
    DEFAULT_VIRTUAL_NODES
}

/// Selector cache in front of the registry.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    strategy: Strategy,
    registry: Arc<dyn Registry>,
    latency: LatencyTable,
    connections: ConnectionManager,
    selectors: Arc<DashMap<ServiceKey, Arc<dyn Selector>>>,
}

impl LoadBalancer {
    /// Create a balancer using `strategy` for every service.
    #[must_use]
    pub fn new(
        strategy: Strategy,
        registry: Arc<dyn Registry>,
        latency: LatencyTable,
        connections: ConnectionManager,
    ) -> Self {
        Self {
            strategy,
            registry,
            latency,
            connections,
            selectors: Arc::new(DashMap::new()),
        }
    }

    /// Pick a provider of `service` for the request identified by `key`.
    ///
    /// # Errors
    ///
    /// Returns a discovery error if the registry knows no provider.
    #[instrument(skip(self, service), fields(service = %service))]
    pub async fn select(&self, service: &ServiceKey, key: u64) -> Result<Address> {
        let cached = self.selectors.get(service).map(|s| Arc::clone(&s));

        let selector = match cached {
            Some(selector) => selector,
            None => {
                let addresses = self.registry.lookup(service).await?;
                self.rebuild(service, addresses)
            }
        };

        selector.select(key)
    }

    /// Replace the selector of `service` with one over `addresses`.
    pub fn rebuild(&self, service: &ServiceKey, addresses: Vec<Address>) -> Arc<dyn Selector> {
        debug!("rebuilding {:?} selector for {} over {:?}", self.strategy, service, addresses);

        let selector = self.build(addresses);
        self.selectors.insert(service.clone(), Arc::clone(&selector));
        selector
    }

    /// Rebuild the selector of `service` without `address`.
    ///
    /// The selector is dropped when no address remains, so the next call
    /// consults the registry again.
    pub fn exclude(&self, service: &ServiceKey, address: &Address) {
        let Some(current) = self.selectors.get(service).map(|s| Arc::clone(&s)) else {
            return;
        };

        let remaining: Vec<Address> = current
            .addresses()
            .iter()
            .filter(|candidate| *candidate != address)
            .cloned()
            .collect();

        if remaining.is_empty() {
            self.invalidate(service);
        } else if remaining.len() != current.addresses().len() {
            self.rebuild(service, remaining);
        }
    }

    /// Forget the selector of `service`.
    pub fn invalidate(&self, service: &ServiceKey) {
        self.selectors.remove(service);
    }

    /// Forget every selector.
    pub fn invalidate_all(&self) {
        self.selectors.clear();
    }

    /// Whether a selector is cached for `service`.
    #[must_use]
    pub fn is_cached(&self, service: &ServiceKey) -> bool {
        self.selectors.contains_key(service)
    }

    /// Addresses the cached selector of `service` chooses from.
    #[must_use]
    pub fn candidates(&self, service: &ServiceKey) -> Option<Vec<Address>> {
        self.selectors
            .get(service)
            .map(|selector| selector.addresses().to_vec())
    }

    /// Whether any cached selector still chooses from `address`.
    #[must_use]
    pub fn is_candidate(&self, address: &Address) -> bool {
        self.selectors
            .iter()
            .any(|selector| selector.addresses().contains(address))
    }

    /// Latency samples consulted by minimum-response-time selection.
    #[must_use]
    pub const fn latency(&self) -> &LatencyTable {
        &self.latency
    }

    /// Configured strategy.
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }

    fn build(&self, addresses: Vec<Address>) -> Arc<dyn Selector> {
        match self.strategy {
            Strategy::RoundRobin => Arc::new(RoundRobin::new(addresses)),
            Strategy::ConsistentHash { virtual_nodes } => {
                Arc::new(ConsistentHash::new(addresses, virtual_nodes))
            }
            Strategy::MinimumResponseTime => Arc::new(MinResponseTime::new(
                addresses,
                self.latency.clone(),
                self.connections.clone(),
            )),
        }
    }
}
