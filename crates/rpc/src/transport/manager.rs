//! Address to connection cache with single-flight connects.

use super::connection::{Connection, ConnectionConfig};
use crate::address::Address;
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::protocol::CodecRegistry;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

type ConnectAttempt = Shared<BoxFuture<'static, Result<Arc<Connection>>>>;

/// Process-wide cache of live connections keyed by provider address.
///
/// At most one connect attempt per address is in flight; concurrent callers,
/// including the heartbeat detector, await the same attempt.
#[derive(Clone)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    codecs: Arc<CodecRegistry>,
    correlator: Correlator,
    connections: Arc<DashMap<Address, Arc<Connection>>>,
    connecting: Arc<Mutex<HashMap<Address, ConnectAttempt>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(config: ConnectionConfig, codecs: Arc<CodecRegistry>, correlator: Correlator) -> Self {
        Self {
            config,
            codecs,
            correlator,
            connections: Arc::new(DashMap::new()),
            connecting: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Return the cached connection to `address`, connecting if there is none.
    ///
    /// # Errors
    ///
    /// Returns a network error if the connect fails or times out. Nothing is
    /// cached in that case, so a later call tries again.
    #[instrument(skip(self, address), fields(address = %address))]
    pub async fn acquire(&self, address: &Address) -> Result<Arc<Connection>> {
        if let Some(conn) = self.get(address) {
            return Ok(conn);
        }

        let attempt = {
            let mut connecting = self.connecting.lock();

            // The attempt may have finished while we waited for the lock
            if let Some(conn) = self.get(address) {
                return Ok(conn);
            }

            connecting
                .entry(address.clone())
                .or_insert_with(|| self.start_connect(address.clone()))
                .clone()
        };

        attempt.await
    }

    fn start_connect(&self, address: Address) -> ConnectAttempt {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let config = self.config.clone();
        let codecs = Arc::clone(&self.codecs);
        let correlator = self.correlator.clone();
        let connections = Arc::clone(&self.connections);
        let connecting = Arc::clone(&self.connecting);

        // Runs to completion even if every waiter gives up
        let task = tokio::spawn(async move {
            let result = Connection::connect(id, address.clone(), &config, codecs, correlator).await;

            if let Ok(conn) = &result {
                connections.insert(address.clone(), Arc::clone(conn));

                let conn = Arc::clone(conn);
                let connections = Arc::clone(&connections);
                tokio::spawn(async move {
                    conn.closed().await;
                    if connections
                        .remove_if(conn.address(), |_, cached| cached.id() == conn.id())
                        .is_some()
                    {
                        info!("Removed closed connection {} to {}", conn.id(), conn.address());
                    }
                });
            }

            connecting.lock().remove(&address);
            result
        });

        async move {
            task.await
                .map_err(|e| Error::Network(format!("connect task failed: {e}")))?
        }
        .boxed()
        .shared()
    }

    /// Live cached connection to `address`, if any.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<Arc<Connection>> {
        self.connections
            .get(address)
            .map(|conn| Arc::clone(&conn))
            .filter(|conn| !conn.is_closed())
    }

    /// Remove and close the connection to `address`.
    ///
    /// Returns whether a connection was cached.
    pub fn evict(&self, address: &Address) -> bool {
        match self.connections.remove(address) {
            Some((_, conn)) => {
                debug!("Evicting connection {} to {}", conn.id(), address);
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Snapshot of cached addresses, sorted.
    #[must_use]
    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        addresses.sort();
        addresses
    }

    /// Whether a live connection to `address` is cached.
    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.get(address).is_some()
    }

    /// Number of cached connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every cached connection.
    pub fn close_all(&self) {
        for address in self.addresses() {
            self.evict(&address);
        }
    }

    /// Shared correlator used by every connection.
    #[must_use]
    pub const fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Codec registry used to encode outbound messages.
    #[must_use]
    pub const fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("connections", &self.addresses())
            .field("connecting", &self.connecting.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn manager(connect_timeout_ms: u64) -> ConnectionManager {
        ConnectionManager::new(
            ConnectionConfig {
                connect_timeout_ms,
                ..ConnectionConfig::default()
            },
            Arc::new(CodecRegistry::new()),
            Correlator::new(),
        )
    }

    async fn counting_listener() -> (Address, Arc<AtomicU64>, Arc<Mutex<Vec<tokio::net::TcpStream>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = Address::from(listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicU64::new(0));
        let held = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&accepted);
        let sockets = Arc::clone(&held);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                sockets.lock().push(stream);
            }
        });

        (address, accepted, held)
    }

    #[tokio::test]
    async fn test_concurrent_acquire_connects_once() {
        let (address, accepted, _held) = counting_listener().await;
        let manager = manager(3_000);

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                let address = address.clone();
                tokio::spawn(async move { manager.acquire(&address).await })
            })
            .collect();

        let mut ids = Vec::new();
        for attempt in attempts {
            ids.push(attempt.await.unwrap().unwrap().id());
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(manager.addresses(), vec![address]);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_entry() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = Address::from(listener.local_addr().unwrap());
        drop(listener);

        let manager = manager(500);
        let err = manager.acquire(&address).await.unwrap_err();

        assert!(matches!(err, Error::Network(_)));
        assert!(manager.is_empty());
        assert!(manager.connecting.lock().is_empty());
    }

    #[tokio::test]
    async fn test_evict_closes_connection() {
        let (address, _accepted, _held) = counting_listener().await;
        let manager = manager(3_000);

        let conn = manager.acquire(&address).await.unwrap();
        assert!(manager.contains(&address));

        assert!(manager.evict(&address));
        assert!(conn.is_closed());
        assert!(!manager.contains(&address));
        assert!(!manager.evict(&address));
    }

    #[tokio::test]
    async fn test_peer_close_removes_cached_connection() {
        let (address, _accepted, held) = counting_listener().await;
        let manager = manager(3_000);

        let conn = manager.acquire(&address).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.lock().clear();

        tokio::time::timeout(Duration::from_secs(5), conn.closed())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_empty());

        // A fresh connection replaces the dead one
        let replacement = manager.acquire(&address).await.unwrap();
        assert_ne!(replacement.id(), conn.id());
    }
}
