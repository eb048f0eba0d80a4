//! RPC transport and resilience runtime over TCP.
//!
//! Callers invoke methods of remote services through a [`ServiceProxy`];
//! providers publish [`ServiceDefinition`]s on an [`RpcServer`]. In between
//! sit a compact binary frame format, pluggable serialization and
//! compression, a shared connection per provider with id-based response
//! correlation, client-side load balancing, circuit breaking, provider-side
//! rate limiting, heartbeat liveness probing and graceful shutdown.
//!
//! # Features
//!
//! - **Framing**: 30-byte header with magic, version, codec codes and a
//!   64-bit request id
//! - **Codecs**: JSON or CBOR bodies, optionally gzip compressed
//! - **Load balancing**: round robin, consistent hashing on the request id, or
//!   lowest heartbeat round-trip time
//! - **Resilience**: per-provider circuit breakers, per-caller token buckets and
//!   retry policies
//!
//! # Example
//!
//! ```no_run
//! use std::convert::Infallible;
//! use std::sync::Arc;
//!
//! use proven_rpc::{Registry, RpcConfig, RpcContext, ServiceDefinition, ServiceKey};
//!
//! async fn example(registry: Arc<dyn Registry>) -> proven_rpc::Result<()> {
//!     let context = RpcContext::new(RpcConfig::default(), registry)?;
//!
//!     let server = context.server().await?;
//!     server
//!         .publish(ServiceDefinition::new(ServiceKey::new("HelloService")).method(
//!             "sayHi",
//!             |(msg,): (String,)| async move { Ok::<_, Infallible>(format!("hi consumer: {msg}")) },
//!         ))
//!         .await?;
//!     server.start()?;
//!     context.start()?;
//!
//!     let hello = context.client().reference(ServiceKey::new("HelloService")).await?;
//!     let reply: String = hello.invoke("sayHi", ("hi".to_string(),)).await?;
//!     assert_eq!(reply, "hi consumer: hi");
//!
//!     server.shutdown().await;
//!     context.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod balancer;
pub mod client;
pub mod config;
pub mod context;
pub mod correlator;
pub mod error;
pub mod heartbeat;
pub mod id;
pub mod protocol;
pub mod registry;
pub mod resilience;
pub mod server;
pub mod shutdown;
pub mod transport;

// Re-export commonly used types
pub use address::{Address, ServiceKey};
pub use balancer::{LatencyTable, LoadBalancer, Strategy};
pub use client::{CallRequest, ClientConfig, RetryPolicy, RpcClient, ServiceProxy};
pub use config::{IdConfig, RpcConfig};
pub use context::RpcContext;
pub use correlator::Correlator;
pub use error::{CodecError, Error, ProtocolError, Result};
pub use heartbeat::{HeartbeatConfig, HeartbeatDetector};
pub use id::IdGenerator;
pub use protocol::{
    Body, CodecRegistry, Envelope, Frame, FrameCodec, Header, MessageKind, RequestPayload,
    ResponseBody, Status,
};
pub use registry::{MembershipChange, Registry};
pub use resilience::{
    Admission, BreakerRegistry, BreakerState, CircuitBreaker, CircuitBreakerConfig, RateLimitConfig,
    RateLimiter, TokenBucket,
};
pub use server::{Dispatcher, MethodArgs, MethodRegistry, RpcServer, ServerConfig, ServiceDefinition};
pub use shutdown::{DrainOutcome, ShutdownConfig, ShutdownCoordinator};
pub use transport::{Connection, ConnectionConfig, ConnectionManager};

// Re-export dependencies that are part of our public API
pub use async_trait::async_trait;
pub use serde_json::Value;
