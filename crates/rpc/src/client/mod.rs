//! Caller side: request flow, retries and membership tracking.
//!
//! A call takes a fresh request id, asks the [`LoadBalancer`] for a provider
//! (keyed by that id), passes the provider's circuit breaker, then writes the
//! request on the shared connection and waits in the [`Correlator`].

pub mod proxy;

pub use proxy::ServiceProxy;

use crate::address::{Address, ServiceKey};
use crate::balancer::LoadBalancer;
use crate::correlator::Correlator;
use crate::error::{CodecError, Error, Result};
use crate::id::IdGenerator;
use crate::protocol::{Envelope, RequestPayload, ResponseBody, Status};
use crate::registry::{MembershipChange, Registry};
use crate::resilience::BreakerRegistry;
use crate::server::{MethodArgs, return_type};
use crate::transport::ConnectionManager;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// How often a call is attempted and how long to pause between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts in total, including the first.
    pub attempts: u32,
    /// Pause between attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A single attempt.
    #[must_use]
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            delay_ms: 0,
        }
    }

    /// Pause between attempts.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Caller settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a call waits for its reply, in milliseconds.
    pub call_timeout_ms: u64,
    /// Retry policy used when a call does not bring its own.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// One method invocation addressed to a service.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    /// Target service.
    pub service: ServiceKey,
    /// Invocation carried on the wire.
    pub payload: RequestPayload,
}

impl CallRequest {
    /// Build a request from already serialized arguments.
    #[must_use]
    pub fn new(
        service: ServiceKey,
        method: &str,
        parameter_types: Vec<String>,
        parameter_values: Vec<Value>,
        return_type: String,
    ) -> Self {
        let payload = RequestPayload {
            interface_name: service.name().to_string(),
            method_name: method.to_string(),
            parameter_types,
            parameter_values,
            return_type,
        };

        Self { service, payload }
    }

    /// Build a request from a typed argument tuple returning `R`.
    ///
    /// # Errors
    ///
    /// Returns a codec error if an argument cannot be serialized.
    pub fn typed<A: MethodArgs, R>(service: ServiceKey, method: &str, args: A) -> Result<Self> {
        let values = args
            .into_values()
            .map_err(|e| Error::Codec(CodecError::SerializationFailed(e)))?;

        Ok(Self::new(
            service,
            method,
            A::parameter_types(),
            values,
            return_type::<R>(),
        ))
    }
}

/// Invokes remote methods.
#[derive(Debug, Clone)]
pub struct RpcClient {
    config: ClientConfig,
    registry: Arc<dyn Registry>,
    balancer: LoadBalancer,
    connections: ConnectionManager,
    correlator: Correlator,
    breakers: BreakerRegistry,
    ids: Arc<IdGenerator>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl RpcClient {
    /// Create a client.
    #[must_use]
    pub fn new(
        config: ClientConfig,
        registry: Arc<dyn Registry>,
        balancer: LoadBalancer,
        connections: ConnectionManager,
        breakers: BreakerRegistry,
        ids: Arc<IdGenerator>,
    ) -> Self {
        let correlator = connections.correlator().clone();

        Self {
            config,
            registry,
            balancer,
            connections,
            correlator,
            breakers,
            ids,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Typed proxy for `service`. Nothing is connected until the first call.
    #[must_use]
    pub fn proxy(&self, service: ServiceKey) -> ServiceProxy {
        ServiceProxy::new(self.clone(), service)
    }

    /// Typed proxy for `service`, connected up front to every registered
    /// provider so the heartbeat can start sampling them.
    ///
    /// # Errors
    ///
    /// Returns a discovery error if no provider is registered. Providers that
    /// refuse the connection are only logged.
    #[instrument(skip(self, service), fields(service = %service))]
    pub async fn reference(&self, service: ServiceKey) -> Result<ServiceProxy> {
        let addresses = self.registry.lookup(&service).await?;
        self.balancer.rebuild(&service, addresses.clone());

        let connects = join_all(addresses.iter().map(|address| self.connections.acquire(address))).await;
        for (address, connect) in addresses.iter().zip(connects) {
            if let Err(e) = connect {
                warn!("Could not pre-connect to {} for {}: {}", address, service, e);
            }
        }

        Ok(self.proxy(service))
    }

    /// Call with the configured retry policy.
    ///
    /// # Errors
    ///
    /// See [`call_with`](Self::call_with).
    pub async fn call(&self, request: &CallRequest) -> Result<Value> {
        self.call_with(request, &self.config.retry).await
    }

    /// Call with an explicit retry policy.
    ///
    /// Retryable failures are attempted again after the policy's delay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Application`] or [`Error::NotFound`] straight away, and
    /// [`Error::RetriesExhausted`] once every attempt failed with a retryable
    /// error.
    #[instrument(
        skip(self, request, retry),
        fields(service = %request.service, method = %request.payload.method_name)
    )]
    pub async fn call_with(&self, request: &CallRequest, retry: &RetryPolicy) -> Result<Value> {
        let attempts = retry.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self.call_once(request).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= attempts {
                warn!("Call failed after {} attempts: {}", attempts, err);
                return Err(Error::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            debug!("Attempt {} of {} failed, retrying: {}", attempt, attempts, err);
            sleep(retry.delay()).await;
        }
    }

    /// Make one attempt without retrying.
    ///
    /// # Errors
    ///
    /// Returns the failure of this attempt.
    pub async fn call_once(&self, request: &CallRequest) -> Result<Value> {
        let id = self.ids.next_id();
        let address = self.balancer.select(&request.service, id).await?;

        let breaker = self.breakers.get(&address);
        let Some(admission) = breaker.try_admit() else {
            debug!("Circuit open for {}, rejecting request {}", address, id);
            return Err(Error::CircuitOpen(address));
        };

        let reply = match self.exchange(id, &address, &request.payload).await {
            Ok(reply) => {
                admission.success();
                reply
            }
            Err(e) => {
                admission.error();
                return Err(e);
            }
        };

        self.interpret(request, address, reply)
    }

    async fn exchange(
        &self,
        id: u64,
        address: &Address,
        payload: &RequestPayload,
    ) -> Result<ResponseBody> {
        let conn = self.connections.acquire(address).await?;
        let codecs = self.connections.codecs();

        let handle = self.correlator.register(id);
        conn.send(&Envelope::request(
            id,
            codecs.default_serializer(),
            codecs.default_compressor(),
            payload.clone(),
        ))
        .await?;

        debug!("Sent request {} to {}", id, address);
        let reply = self.correlator.wait(handle, self.config.call_timeout()).await;
        if reply.is_err() {
            conn.forget(id);
        }
        reply
    }

    fn interpret(&self, request: &CallRequest, address: Address, reply: ResponseBody) -> Result<Value> {
        match reply.status {
            Status::Success => Ok(reply.value),
            Status::Failure => Err(Error::Application(reply.message.unwrap_or_default())),
            Status::RateLimited => Err(Error::RateLimited(address)),
            Status::NotFound => Err(Error::NotFound {
                interface: request.payload.interface_name.clone(),
                method: request.payload.method_name.clone(),
            }),
            Status::Closing => {
                info!("{} is closing, excluding it from {}", address, request.service);
                self.connections.evict(&address);
                self.balancer.exclude(&request.service, &address);
                Err(Error::ServerClosing(address))
            }
            Status::HeartbeatOk => Err(Error::Network(format!(
                "{address} answered a request with a heartbeat status"
            ))),
        }
    }

    /// Follow registry membership changes on a background task.
    ///
    /// Cached selectors are rebuilt over the new provider list and connections
    /// to departed providers are closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher was already started.
    pub fn start_watcher(&self) -> Result<()> {
        if self.task_tracker.is_closed() {
            return Err(Error::Configuration(
                "membership watcher already started".to_string(),
            ));
        }

        let mut changes = self.registry.subscribe();
        let client = self.clone();

        self.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    () = client.shutdown_token.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(change) => client.apply(change),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Missed {} membership changes, dropping every selector", skipped);
                            client.balancer.invalidate_all();
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }

            debug!("Membership watcher stopped");
        });
        self.task_tracker.close();

        Ok(())
    }

    fn apply(&self, change: MembershipChange) {
        let MembershipChange { service, addresses } = change;

        let Some(previous) = self.balancer.candidates(&service) else {
            return;
        };
        let departed: Vec<Address> = previous
            .into_iter()
            .filter(|address| !addresses.contains(address))
            .collect();

        if addresses.is_empty() {
            self.balancer.invalidate(&service);
        } else {
            self.balancer.rebuild(&service, addresses);
        }

        // Connections are shared by every service a provider serves
        for address in departed {
            if self.balancer.is_candidate(&address) {
                debug!("{} left {} but still serves other services", address, service);
                continue;
            }

            info!("{} left {}, closing its connection", address, service);
            self.connections.evict(&address);
            self.balancer.latency().remove(&address);
        }
    }

    /// Stop the membership watcher and close every connection.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.connections.close_all();
    }

    /// Load balancer used for provider selection.
    #[must_use]
    pub const fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Connection cache.
    #[must_use]
    pub const fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Circuit breakers per provider.
    #[must_use]
    pub const fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }
}
