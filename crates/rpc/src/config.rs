//! Runtime configuration.

use crate::balancer::Strategy;
use crate::client::ClientConfig;
use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatConfig;
use crate::id::{MAX_DATA_CENTER_ID, MAX_MACHINE_ID};
use crate::protocol::CodecRegistry;
use crate::protocol::framing::HEADER_LENGTH;
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};
use crate::server::ServerConfig;
use crate::shutdown::ShutdownConfig;
use crate::transport::ConnectionConfig;

use std::path::Path;

use serde::Deserialize;

/// Node identity used for request ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdConfig {
    /// Data center id, 0-31.
    pub data_center_id: u64,
    /// Machine id, 0-31.
    pub machine_id: u64,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            data_center_id: 1,
            machine_id: 2,
        }
    }
}

/// Everything an [`RpcContext`](crate::RpcContext) is built from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Name used in logs.
    pub app_name: String,
    /// Serializer name for outbound messages.
    pub serializer: String,
    /// Compressor name for outbound messages.
    pub compressor: String,
    /// Provider selection algorithm.
    pub strategy: Strategy,
    /// Provider listener.
    pub server: ServerConfig,
    /// Outbound connections.
    pub connection: ConnectionConfig,
    /// Call timeout and retries.
    pub client: ClientConfig,
    /// Liveness probing.
    pub heartbeat: HeartbeatConfig,
    /// Caller-side circuit breaking.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Provider-side rate limiting.
    pub rate_limit: RateLimitConfig,
    /// Graceful shutdown.
    pub shutdown: ShutdownConfig,
    /// Request id generation.
    pub id: IdConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            app_name: "proven-rpc".to_string(),
            serializer: "json".to_string(),
            compressor: "gzip".to_string(),
            strategy: Strategy::default(),
            server: ServerConfig::default(),
            connection: ConnectionConfig::default(),
            client: ClientConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            shutdown: ShutdownConfig::default(),
            id: IdConfig::default(),
        }
    }
}

impl RpcConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the document does not parse or fails
    /// [`validate`](Self::validate).
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or its contents
    /// are invalid.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("Failed to read config file: {e}")))?;
        Self::from_toml_str(&contents)
    }

    /// Reject values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        CodecRegistry::with_defaults(&self.serializer, &self.compressor)?;

        let min_frame = usize::from(HEADER_LENGTH);
        if self.server.max_frame_size < min_frame || self.connection.max_frame_size < min_frame {
            return Err(invalid(format!(
                "Max frame size must be at least {min_frame} bytes"
            )));
        }

        if let Strategy::ConsistentHash { virtual_nodes: 0 } = self.strategy {
            return Err(invalid("Consistent hash needs at least one virtual node"));
        }

        if self.client.call_timeout_ms == 0 {
            return Err(invalid("Call timeout must be positive"));
        }

        if self.client.retry.attempts == 0 {
            return Err(invalid("Retry attempts must be at least 1"));
        }

        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms == 0 {
            return Err(invalid("Heartbeat interval and timeout must be positive"));
        }

        if self.heartbeat.attempts == 0 {
            return Err(invalid("Heartbeat attempts must be at least 1"));
        }

        if self.circuit_breaker.max_errors == 0 {
            return Err(invalid("Circuit breaker max errors must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.circuit_breaker.max_error_rate) {
            return Err(invalid("Circuit breaker error rate must be within 0.0..=1.0"));
        }

        if self.rate_limit.capacity == 0 {
            return Err(invalid("Rate limit capacity must be at least 1"));
        }

        if self.shutdown.poll_interval_ms == 0 {
            return Err(invalid("Shutdown poll interval must be positive"));
        }

        if self.id.data_center_id > MAX_DATA_CENTER_ID || self.id.machine_id > MAX_MACHINE_ID {
            return Err(invalid(format!(
                "Data center and machine ids must be at most {MAX_DATA_CENTER_ID} and {MAX_MACHINE_ID}"
            )));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Configuration(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RpcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8094);
        assert_eq!(config.client.call_timeout_ms, 10_000);
        assert_eq!(config.client.retry.attempts, 3);
        assert_eq!(config.heartbeat.interval_ms, 2_000);
        assert_eq!(config.shutdown.drain_timeout_ms, 10_000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RpcConfig::from_toml_str(
            r#"
            app_name = "consumer"
            serializer = "cbor"

            [strategy]
            kind = "minimum_response_time"

            [circuit_breaker]
            max_errors = 3
            half_open = true

            [id]
            machine_id = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.app_name, "consumer");
        assert_eq!(config.serializer, "cbor");
        assert_eq!(config.compressor, "gzip");
        assert_eq!(config.strategy, Strategy::MinimumResponseTime);
        assert_eq!(config.circuit_breaker.max_errors, 3);
        assert!(config.circuit_breaker.half_open);
        assert_eq!(config.circuit_breaker.cool_down_ms, 5_000);
        assert_eq!(config.id, IdConfig { data_center_id: 1, machine_id: 7 });
    }

    #[test]
    fn test_config_validation() {
        let mut config = RpcConfig::default();
        assert!(config.validate().is_ok());

        config.serializer = "xml".to_string();
        assert!(config.validate().is_err());
        config.serializer = "json".to_string();

        config.id.machine_id = 32;
        assert!(config.validate().is_err());
        config.id.machine_id = 31;
        assert!(config.validate().is_ok());

        config.circuit_breaker.max_error_rate = 1.5;
        assert!(config.validate().is_err());
        config.circuit_breaker.max_error_rate = 0.5;

        config.client.retry.attempts = 0;
        assert!(config.validate().is_err());
        config.client.retry.attempts = 1;

        config.strategy = Strategy::ConsistentHash { virtual_nodes: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_configuration_error() {
        let err = RpcConfig::from_toml_str("server = 3").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
