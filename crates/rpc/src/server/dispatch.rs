//! Admission and dispatch of inbound messages.

use super::methods::MethodRegistry;
use crate::address::Address;
use crate::protocol::{Body, Envelope, ResponseBody, Status};
use crate::resilience::RateLimiter;
use crate::shutdown::ShutdownCoordinator;

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, warn};

/// Turns one decoded request into its reply.
///
/// Checks run in order: closing flag, heartbeat, caller rate limit, method
/// lookup. Method failures and panics become `Failure` replies.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    methods: MethodRegistry,
    rate_limiter: RateLimiter,
    shutdown: ShutdownCoordinator,
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub const fn new(
        methods: MethodRegistry,
        rate_limiter: RateLimiter,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            methods,
            rate_limiter,
            shutdown,
        }
    }

    /// Published methods.
    #[must_use]
    pub const fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    /// Per-caller rate limiter.
    #[must_use]
    pub const fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Release state kept for `peer` once its connection has closed.
    pub fn disconnected(&self, peer: &Address) {
        self.rate_limiter.remove(peer);
    }

    /// Shutdown coordinator consulted before every request.
    #[must_use]
    pub const fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Handle one inbound envelope from `peer`.
    ///
    /// Returns `None` for messages that need no reply.
    pub async fn handle(&self, envelope: Envelope, peer: &Address) -> Option<Envelope> {
        let header = envelope.header;

        let payload = match envelope.body {
            Body::Response(_) => {
                warn!("Ignoring response {} sent by caller {}", header.request_id, peer);
                return None;
            }
            Body::Empty | Body::Request(_) if self.shutdown.is_closing() => {
                return Some(Envelope::reply_to(&header, ResponseBody::status(Status::Closing)));
            }
            Body::Empty => {
                return Some(Envelope::reply_to(&header, ResponseBody::heartbeat()));
            }
            Body::Request(payload) => payload,
        };

        if !self.rate_limiter.allow(peer) {
            debug!("Rate limited request {} from {}", header.request_id, peer);
            return Some(Envelope::reply_to(
                &header,
                ResponseBody::status(Status::RateLimited),
            ));
        }

        let Some(_guard) = self.shutdown.try_enter() else {
            return Some(Envelope::reply_to(&header, ResponseBody::status(Status::Closing)));
        };

        let Some(invoker) = self.methods.lookup(&payload) else {
            warn!(
                "No method {}.{} with parameters {:?}",
                payload.interface_name, payload.method_name, payload.parameter_types
            );
            return Some(Envelope::reply_to(
                &header,
                ResponseBody {
                    status: Status::NotFound,
                    value: serde_json::Value::Null,
                    message: Some(format!(
                        "{}.{}",
                        payload.interface_name, payload.method_name
                    )),
                },
            ));
        };

        debug!(
            "Invoking {}.{} for request {}",
            payload.interface_name, payload.method_name, header.request_id
        );

        let body = match AssertUnwindSafe(invoker(payload.parameter_values))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => ResponseBody::success(value),
            Ok(Err(message)) => ResponseBody::failure(message),
            Err(_) => {
                warn!(
                    "{}.{} panicked while handling request {}",
                    payload.interface_name, payload.method_name, header.request_id
                );
                ResponseBody::failure(format!(
                    "{}.{} panicked",
                    payload.interface_name, payload.method_name
                ))
            }
        };

        Some(Envelope::reply_to(&header, body))
    }
}
