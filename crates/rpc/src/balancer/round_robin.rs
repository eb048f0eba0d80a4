//! Round-robin selection.

use super::Selector;
use crate::address::Address;
use crate::error::{Error, Result};

use std::sync::atomic::{AtomicUsize, Ordering};

/// Cycles through a fixed address list.
#[derive(Debug)]
pub struct RoundRobin {
    addresses: Vec<Address>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// Create a selector over `addresses`, in order.
    #[must_use]
    pub const fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Next address in the cycle.
    ///
    /// # Errors
    ///
    /// Returns a discovery error if the list is empty.
    pub fn next(&self) -> Result<Address> {
        if self.addresses.is_empty() {
            return Err(Error::Discovery(
                "round-robin selector has no addresses".to_string(),
            ));
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.addresses.len();
        Ok(self.addresses[index].clone())
    }
}

impl Selector for RoundRobin {
    fn select(&self, _key: u64) -> Result<Address> {
        self.next()
    }

    fn addresses(&self) -> &[Address] {
        &self.addresses
    }
}
