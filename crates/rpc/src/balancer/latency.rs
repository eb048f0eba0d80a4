//! Round-trip times measured by the heartbeat detector.

use crate::address::Address;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Samples ordered by round-trip time, fastest first.
pub type LatencySamples = BTreeSet<(Duration, Address)>;

/// Latency table rebuilt every heartbeat cycle and swapped in whole.
///
/// Readers never block the detector and always see one complete cycle.
#[derive(Clone, Debug)]
pub struct LatencyTable {
    samples: Arc<ArcSwap<LatencySamples>>,
}

impl LatencyTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: Arc::new(ArcSwap::from_pointee(BTreeSet::new())),
        }
    }

    /// Replace the table with the samples of a finished cycle.
    pub fn publish(&self, samples: LatencySamples) {
        self.samples.store(Arc::new(samples));
    }

    /// Drop the sample of one address.
    pub fn remove(&self, address: &Address) {
        self.samples.rcu(|current| {
            current
                .iter()
                .filter(|(_, sampled)| sampled != address)
                .cloned()
                .collect::<LatencySamples>()
        });
    }

    /// Current samples.
    #[must_use]
    pub fn snapshot(&self) -> Arc<LatencySamples> {
        self.samples.load_full()
    }

    /// Fastest address overall.
    #[must_use]
    pub fn fastest(&self) -> Option<Address> {
        self.samples
            .load()
            .iter()
            .next()
            .map(|(_, address)| address.clone())
    }

    /// Fastest address among `candidates`.
    #[must_use]
    pub fn fastest_among(&self, candidates: &[Address]) -> Option<Address> {
        self.samples
            .load()
            .iter()
            .find(|(_, address)| candidates.contains(address))
            .map(|(_, address)| address.clone())
    }

    /// Round-trip time of `address` in the last cycle.
    #[must_use]
    pub fn rtt(&self, address: &Address) -> Option<Duration> {
        self.samples
            .load()
            .iter()
            .find(|(_, sampled)| sampled == address)
            .map(|(rtt, _)| *rtt)
    }

    /// Number of sampled addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.load().len()
    }

    /// Whether no address has been sampled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.load().is_empty()
    }
}

impl Default for LatencyTable {
    fn default() -> Self {
        Self::new()
    }
}
