//! Consistent-hash selection keyed by request id.

use super::Selector;
use crate::address::Address;
use crate::error::{Error, Result};

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Ring positions per address.
pub const DEFAULT_VIRTUAL_NODES: u32 = 128;

/// Hash ring with virtual nodes.
#[derive(Debug)]
pub struct ConsistentHash {
    addresses: Vec<Address>,
    ring: BTreeMap<u32, Address>,
}

impl ConsistentHash {
    /// Place every address at `virtual_nodes` ring positions.
    #[must_use]
    pub fn new(addresses: Vec<Address>, virtual_nodes: u32) -> Self {
        let mut ring = BTreeMap::new();
        for address in &addresses {
            for i in 0..virtual_nodes {
                ring.insert(hash(format!("{address}-{i}").as_bytes()), address.clone());
            }
        }

        Self { addresses, ring }
    }

    /// Owner of the first ring position at or after the hash of `key`.
    ///
    /// # Errors
    ///
    /// Returns a discovery error if the ring is empty.
    pub fn locate(&self, key: u64) -> Result<Address> {
        let point = hash(&key.to_be_bytes());

        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, address)| address.clone())
            .ok_or_else(|| Error::Discovery("consistent-hash ring is empty".to_string()))
    }

    /// Number of ring positions.
    #[must_use]
    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }
}

impl Selector for ConsistentHash {
    fn select(&self, key: u64) -> Result<Address> {
        self.locate(key)
    }

    fn addresses(&self) -> &[Address] {
        &self.addresses
    }
}

/// First four bytes of the SHA-256 digest, big-endian.
fn hash(bytes: &[u8]) -> u32 {
    let digest = Sha256::digest(bytes);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn addresses(n: u16) -> Vec<Address> {
        (0..n).map(|i| Address::new("10.0.0.1", 7000 + i)).collect()
    }

    #[test]
    fn test_same_key_same_address() {
        let ring = ConsistentHash::new(addresses(3), DEFAULT_VIRTUAL_NODES);
        assert_eq!(ring.ring_len(), 3 * DEFAULT_VIRTUAL_NODES as usize);

        for key in [0, 1, 42, u64::MAX] {
            assert_eq!(ring.locate(key).unwrap(), ring.locate(key).unwrap());
        }
    }

    #[test]
    fn test_keys_spread_over_every_address() {
        let ring = ConsistentHash::new(addresses(4), DEFAULT_VIRTUAL_NODES);
        let mut counts: HashMap<Address, usize> = HashMap::new();
        for key in 0..4_000u64 {
            *counts.entry(ring.locate(key).unwrap()).or_default() += 1;
        }

        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            // Perfect balance would be 1000 each
            assert!(*count > 500, "unbalanced ring: {counts:?}");
        }
    }

    #[test]
    fn test_removing_an_address_only_moves_its_keys() {
        let all = addresses(5);
        let removed = all[2].clone();
        let before = ConsistentHash::new(all.clone(), DEFAULT_VIRTUAL_NODES);
        let after = ConsistentHash::new(
            all.into_iter().filter(|a| *a != removed).collect(),
            DEFAULT_VIRTUAL_NODES,
        );

        let mut moved = 0;
        for key in 0..10_000u64 {
            let old_owner = before.locate(key).unwrap();
            let new_owner = after.locate(key).unwrap();
            if old_owner == removed {
                moved += 1;
                assert_ne!(new_owner, removed);
            } else {
                assert_eq!(old_owner, new_owner);
            }
        }

        // Roughly a fifth of the keys belonged to the removed address
        assert!(moved > 1_000 && moved < 3_500, "moved {moved}");
    }

    #[test]
    fn test_empty_ring_is_an_error() {
        let ring = ConsistentHash::new(Vec::new(), DEFAULT_VIRTUAL_NODES);
        assert!(matches!(ring.locate(7), Err(Error::Discovery(_))));
    }
}
