//! Network addresses and service keys.

use crate::error::{Error, Result};

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Group used when a service is published without one.
pub const DEFAULT_GROUP: &str = "default";

/// Host and port of a remote provider.
///
/// Keys the connection cache and the per-peer circuit breaker and rate limiter maps.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host part.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Configuration(format!("address `{s}` has no port")))?;

        if host.is_empty() {
            return Err(Error::Configuration(format!("address `{s}` has no host")));
        }

        let port = port
            .parse()
            .map_err(|_| Error::Configuration(format!("address `{s}` has an invalid port")))?;

        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Logical service identity: an interface name within a group.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ServiceKey {
    name: String,
    group: String,
}

impl ServiceKey {
    /// A service in the default group.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_group(name, DEFAULT_GROUP)
    }

    /// A service in an explicit group.
    pub fn with_group(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// The interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: Address = "127.0.0.1:8094".parse().unwrap();
        assert_eq!(addr.host(), "127.0.0.1");
        assert_eq!(addr.port(), 8094);
        assert_eq!(addr.to_string(), "127.0.0.1:8094");

        let named: Address = "provider-a:9000".parse().unwrap();
        assert_eq!(named, Address::new("provider-a", 9000));

        let v6: Address = "[::1]:7000".parse().unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.to_string(), "[::1]:7000");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("no-port".parse::<Address>().is_err());
        assert!(":80".parse::<Address>().is_err());
        assert!("host:notaport".parse::<Address>().is_err());
    }

    #[test]
    fn test_ordering_is_by_host_then_port() {
        let mut addrs = vec![
            Address::new("b", 1),
            Address::new("a", 2),
            Address::new("a", 1),
        ];
        addrs.sort();
        assert_eq!(
            addrs,
            vec![Address::new("a", 1), Address::new("a", 2), Address::new("b", 1)]
        );
    }

    #[test]
    fn test_service_key_default_group() {
        let key = ServiceKey::new("HelloService");
        assert_eq!(key.group(), DEFAULT_GROUP);
        assert_eq!(key.to_string(), "default/HelloService");
    }
}
