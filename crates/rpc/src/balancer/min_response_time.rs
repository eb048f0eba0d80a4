//! Minimum-response-time selection from heartbeat samples.

use super::Selector;
use super::latency::LatencyTable;
use crate::address::Address;
use crate::error::{Error, Result};
use crate::transport::ConnectionManager;

use tracing::debug;

/// Picks the candidate with the lowest round-trip time in the last heartbeat cycle.
///
/// Before any candidate has been sampled it falls back to the first candidate
/// holding a live cached connection, then to the first candidate in registry
/// order.
#[derive(Debug)]
pub struct MinResponseTime {
    addresses: Vec<Address>,
    latency: LatencyTable,
    connections: ConnectionManager,
}

impl MinResponseTime {
    /// Create a selector over `addresses`.
    #[must_use]
    pub const fn new(
        addresses: Vec<Address>,
        latency: LatencyTable,
        connections: ConnectionManager,
    ) -> Self {
        Self {
            addresses,
            latency,
            connections,
        }
    }
}

impl Selector for MinResponseTime {
    fn select(&self, _key: u64) -> Result<Address> {
        if let Some(fastest) = self.latency.fastest_among(&self.addresses) {
            return Ok(fastest);
        }

        debug!("no latency sample yet, falling back to a cached connection");

        self.addresses
            .iter()
            .find(|address| self.connections.contains(address))
            .or_else(|| self.addresses.first())
            .cloned()
            .ok_or_else(|| {
                Error::Discovery("minimum-response-time selector has no addresses".to_string())
            })
    }

    fn addresses(&self) -> &[Address] {
        &self.addresses
    }
}
