//! In-memory (single process) service registry for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use proven_rpc::{Address, MembershipChange, Registry, ServiceKey};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

/// Membership changes buffered per subscriber before it starts lagging.
const CHANGE_BUFFER: usize = 256;

/// In-memory registry.
///
/// Clones share the same provider table and change stream.
#[derive(Clone, Debug)]
pub struct MemoryRegistry {
    services: Arc<RwLock<HashMap<ServiceKey, Vec<Address>>>>,
    changes: broadcast::Sender<MembershipChange>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            changes: broadcast::channel(CHANGE_BUFFER).0,
        }
    }

    /// Services with at least one provider.
    pub async fn services(&self) -> Vec<ServiceKey> {
        let mut services: Vec<ServiceKey> = self.services.read().await.keys().cloned().collect();
        services.sort();
        services
    }

    fn notify(&self, service: &ServiceKey, addresses: Vec<Address>) {
        // Nobody listening is fine
        let _ = self.changes.send(MembershipChange {
            service: service.clone(),
            addresses,
        });
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, service: &ServiceKey, address: Address) -> proven_rpc::Result<()> {
        let addresses = {
            let mut services = self.services.write().await;
            let addresses = services.entry(service.clone()).or_default();

            if addresses.contains(&address) {
                debug!("{} already registered for {}", address, service);
                return Ok(());
            }

            addresses.push(address.clone());
            addresses.clone()
        };

        info!("Registered {} for {}", address, service);
        self.notify(service, addresses);
        Ok(())
    }

    async fn unregister(&self, service: &ServiceKey, address: &Address) -> proven_rpc::Result<()> {
        let addresses = {
            let mut services = self.services.write().await;
            let Some(addresses) = services.get_mut(service) else {
                return Ok(());
            };

            let before = addresses.len();
            addresses.retain(|a| a != address);
            if addresses.len() == before {
                return Ok(());
            }

            let remaining = addresses.clone();
            if remaining.is_empty() {
                services.remove(service);
            }
            remaining
        };

        info!("Unregistered {} from {}", address, service);
        self.notify(service, addresses);
        Ok(())
    }

    async fn lookup(&self, service: &ServiceKey) -> proven_rpc::Result<Vec<Address>> {
        match self.services.read().await.get(service) {
            Some(addresses) if !addresses.is_empty() => Ok(addresses.clone()),
            _ => Err(Error::NoProviders(service.clone()).into()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipChange> {
        self.changes.subscribe()
    }
}
