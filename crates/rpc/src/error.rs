//! Error types for the RPC runtime.

use crate::address::Address;

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
///
/// Cloneable so a single outcome can be handed to every caller waiting on
/// the same connect attempt or pending call.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Wire-level failure. The connection that produced it is closed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Serialization or compression failure for a single message.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// No provider address is known, or the lookup failed.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Connect or write failure, or a connection lost mid-call.
    #[error("Network error: {0}")]
    Network(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The local circuit breaker for the peer is open.
    #[error("Circuit open for {0}")]
    CircuitOpen(Address),

    /// The peer rejected the call with its rate limiter.
    #[error("Rate limited by {0}")]
    RateLimited(Address),

    /// The peer is draining and refuses new work.
    #[error("Server {0} is closing")]
    ServerClosing(Address),

    /// The peer has no such method.
    #[error("No method `{method}` on `{interface}`")]
    NotFound {
        /// Interface name of the call.
        interface: String,
        /// Method name of the call.
        method: String,
    },

    /// The target method itself failed.
    #[error("Application error: {0}")]
    Application(String),

    /// Every attempt allowed by the retry policy failed.
    #[error("Call failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: Box<Error>,
    },

    /// Invalid configuration or argument.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether a retry policy may attempt the call again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::Discovery(_)
                | Self::Network(_)
                | Self::Timeout(_)
                | Self::CircuitOpen(_)
                | Self::RateLimited(_)
                | Self::ServerClosing(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Wire-format errors. Any of these desynchronizes the byte stream.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame does not start with the magic marker.
    #[error("Bad magic marker: {0:02x?}")]
    BadMagic(Vec<u8>),

    /// The frame carries a version this build does not speak.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The declared header length is shorter than the fixed header.
    #[error("Invalid header length: {0}")]
    InvalidHeaderLength(u16),

    /// The declared total length is shorter than the header.
    #[error("Total length {total} is shorter than header length {header}")]
    InvalidTotalLength {
        /// Declared total length.
        total: usize,
        /// Declared header length.
        header: usize,
    },

    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Unknown message kind code.
    #[error("Unknown message kind: {0:#x}")]
    UnknownKind(u8),
}

/// Codec-related errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// Compression failed.
    #[error("Failed to compress: {0}")]
    CompressionFailed(String),

    /// Decompression failed.
    #[error("Failed to decompress: {0}")]
    DecompressionFailed(String),

    /// Body does not match the message kind.
    #[error("Unexpected body: {0}")]
    UnexpectedBody(String),
}
