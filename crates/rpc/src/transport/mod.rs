//! TCP transport: client connections and the connection cache.

pub mod connection;
pub mod manager;

pub use connection::{Connection, ConnectionConfig};
pub use manager::ConnectionManager;
