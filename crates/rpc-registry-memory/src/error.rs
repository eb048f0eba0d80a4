use proven_rpc::ServiceKey;
use thiserror::Error;

/// Errors raised by the in-memory registry.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Nothing is registered for the service.
    #[error("no provider registered for {0}")]
    NoProviders(ServiceKey),
}

impl From<Error> for proven_rpc::Error {
    fn from(error: Error) -> Self {
        Self::Discovery(error.to_string())
    }
}
