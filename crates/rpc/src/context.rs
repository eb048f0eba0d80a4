//! Process-wide RPC state, built once and shared by clients and servers.

use crate::balancer::{LatencyTable, LoadBalancer};
use crate::client::RpcClient;
use crate::config::RpcConfig;
use crate::correlator::Correlator;
use crate::error::Result;
use crate::heartbeat::HeartbeatDetector;
use crate::id::IdGenerator;
use crate::protocol::CodecRegistry;
use crate::registry::Registry;
use crate::resilience::{BreakerRegistry, RateLimiter};
use crate::server::{Dispatcher, MethodRegistry, RpcServer};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::ConnectionManager;

use std::sync::Arc;

use tracing::info;

/// Owns the connection cache, correlator, latency table, breakers, id
/// generator and heartbeat of one process.
#[derive(Debug, Clone)]
pub struct RpcContext {
    config: RpcConfig,
    codecs: Arc<CodecRegistry>,
    registry: Arc<dyn Registry>,
    connections: ConnectionManager,
    heartbeat: HeartbeatDetector,
    client: RpcClient,
}

impl RpcContext {
    /// Build every shared component from `config`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(config: RpcConfig, registry: Arc<dyn Registry>) -> Result<Self> {
        config.validate()?;

        let codecs = Arc::new(
            CodecRegistry::with_defaults(&config.serializer, &config.compressor)?
                .with_max_body_size(
                    config
                        .server
                        .max_frame_size
                        .max(config.connection.max_frame_size),
                ),
        );
        let ids = Arc::new(IdGenerator::new(
            config.id.data_center_id,
            config.id.machine_id,
        )?);

        let connections = ConnectionManager::new(
            config.connection.clone(),
            Arc::clone(&codecs),
            Correlator::new(),
        );
        let latency = LatencyTable::new();
        let balancer = LoadBalancer::new(
            config.strategy,
            Arc::clone(&registry),
            latency.clone(),
            connections.clone(),
        );
        let heartbeat = HeartbeatDetector::new(
            config.heartbeat.clone(),
            connections.clone(),
            latency,
            Arc::clone(&ids),
        );
        let client = RpcClient::new(
            config.client.clone(),
            Arc::clone(&registry),
            balancer,
            connections.clone(),
            BreakerRegistry::new(config.circuit_breaker.clone()),
            ids,
        );

        Ok(Self {
            config,
            codecs,
            registry,
            connections,
            heartbeat,
            client,
        })
    }

    /// Start the heartbeat detector and the membership watcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the context was already started.
    pub fn start(&self) -> Result<()> {
        self.heartbeat.start()?;
        self.client.start_watcher()?;
        info!("{} started", self.config.app_name);
        Ok(())
    }

    /// Bind a provider with its own rate limiter and shutdown coordinator.
    ///
    /// # Errors
    ///
    /// Returns a network error if the listener cannot be bound.
    pub async fn server(&self) -> Result<RpcServer> {
        let dispatcher = Dispatcher::new(
            MethodRegistry::new(),
            RateLimiter::new(self.config.rate_limit),
            ShutdownCoordinator::new(self.config.shutdown.clone()),
        );

        RpcServer::bind(
            self.config.server.clone(),
            Arc::clone(&self.codecs),
            dispatcher,
            Arc::clone(&self.registry),
        )
        .await
    }

    /// Caller front end sharing this context's caches.
    #[must_use]
    pub const fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Heartbeat detector.
    #[must_use]
    pub const fn heartbeat(&self) -> &HeartbeatDetector {
        &self.heartbeat
    }

    /// Connection cache.
    #[must_use]
    pub const fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Configuration this context was built from.
    #[must_use]
    pub const fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Stop background tasks and close every connection.
    pub async fn shutdown(&self) {
        self.heartbeat.shutdown().await;
        self.client.shutdown().await;
        info!("{} stopped", self.config.app_name);
    }
}
