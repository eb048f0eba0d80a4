//! Abstract interface to the service registry.

use crate::address::{Address, ServiceKey};
use crate::error::Result;

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// The provider set of a service changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    /// Service whose providers changed.
    pub service: ServiceKey,
    /// Full provider list after the change. May be empty.
    pub addresses: Vec<Address>,
}

/// Where providers publish themselves and callers discover them.
#[async_trait]
pub trait Registry: Debug + Send + Sync + 'static {
    /// Publish `address` as a provider of `service`.
    async fn register(&self, service: &ServiceKey, address: Address) -> Result<()>;

    /// Withdraw `address` as a provider of `service`.
    async fn unregister(&self, service: &ServiceKey, address: &Address) -> Result<()>;

    /// Providers of `service`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`](crate::Error::Discovery) when no provider is
    /// known, never an empty list.
    async fn lookup(&self, service: &ServiceKey) -> Result<Vec<Address>>;

    /// Stream of membership changes for every service.
    fn subscribe(&self) -> broadcast::Receiver<MembershipChange>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::Error;

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    /// In-process registry for unit tests.
    #[derive(Debug)]
    pub struct StaticRegistry {
        services: Mutex<HashMap<ServiceKey, Vec<Address>>>,
        lookups: AtomicUsize,
        changes: broadcast::Sender<MembershipChange>,
    }

    impl Default for StaticRegistry {
        fn default() -> Self {
            Self {
                services: Mutex::new(HashMap::new()),
                lookups: AtomicUsize::new(0),
                changes: broadcast::channel(64).0,
            }
        }
    }

    impl StaticRegistry {
        pub fn set(&self, service: &ServiceKey, addresses: Vec<Address>) {
            self.services.lock().insert(service.clone(), addresses.clone());
            let _ = self.changes.send(MembershipChange {
                service: service.clone(),
                addresses,
            });
        }

        pub fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }

        fn update(&self, service: &ServiceKey, f: impl FnOnce(&mut Vec<Address>)) {
            let addresses = {
                let mut services = self.services.lock();
                let addresses = services.entry(service.clone()).or_default();
                f(addresses);
                addresses.clone()
            };
            let _ = self.changes.send(MembershipChange {
                service: service.clone(),
                addresses,
            });
        }
    }

    #[async_trait]
    impl Registry for StaticRegistry {
        async fn register(&self, service: &ServiceKey, address: Address) -> Result<()> {
            self.update(service, |addresses| {
                if !addresses.contains(&address) {
                    addresses.push(address);
                }
            });
            Ok(())
        }

        async fn unregister(&self, service: &ServiceKey, address: &Address) -> Result<()> {
            self.update(service, |addresses| addresses.retain(|a| a != address));
            Ok(())
        }

        async fn lookup(&self, service: &ServiceKey) -> Result<Vec<Address>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            match self.services.lock().get(service) {
                Some(addresses) if !addresses.is_empty() => Ok(addresses.clone()),
                _ => Err(Error::Discovery(format!("no provider for {service}"))),
            }
        }

        fn subscribe(&self) -> broadcast::Receiver<MembershipChange> {
            self.changes.subscribe()
        }
    }
}
