//! Typed front end for calling one service.

use super::{CallRequest, RetryPolicy, RpcClient};
use crate::address::ServiceKey;
use crate::error::{CodecError, Error, Result};
use crate::server::MethodArgs;

use serde::de::DeserializeOwned;

/// Calls methods of one service with typed arguments and results.
#[derive(Debug, Clone)]
pub struct ServiceProxy {
    client: RpcClient,
    service: ServiceKey,
    retry: Option<RetryPolicy>,
}

impl ServiceProxy {
    /// Proxy for `service` using the client's retry policy.
    #[must_use]
    pub const fn new(client: RpcClient, service: ServiceKey) -> Self {
        Self {
            client,
            service,
            retry: None,
        }
    }

    /// Use `retry` for every call made through this proxy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Service this proxy calls.
    #[must_use]
    pub const fn service(&self) -> &ServiceKey {
        &self.service
    }

    /// Invoke `method` with the argument tuple `args`.
    ///
    /// # Errors
    ///
    /// Returns the call's error, or a codec error if the result does not
    /// deserialize into `R`.
    pub async fn invoke<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: MethodArgs,
        R: DeserializeOwned,
    {
        let request = CallRequest::typed::<A, R>(self.service.clone(), method, args)?;

        let value = match &self.retry {
            Some(retry) => self.client.call_with(&request, retry).await?,
            None => self.client.call(&request).await?,
        };

        serde_json::from_value(value)
            .map_err(|e| Error::Codec(CodecError::DeserializationFailed(e.to_string())))
    }
}
