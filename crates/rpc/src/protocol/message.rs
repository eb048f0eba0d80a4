//! Logical message types carried inside frames.

use super::framing::{Header, MessageKind};

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description of a method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Name of the interface hosting the method.
    pub interface_name: String,
    /// Method to invoke.
    pub method_name: String,
    /// Type descriptors of the parameters, in order.
    pub parameter_types: Vec<String>,
    /// Parameter values, in order.
    pub parameter_values: Vec<Value>,
    /// Type descriptor of the expected return value.
    pub return_type: String,
}

/// Outcome code carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Status {
    /// The method ran and returned a value.
    Success = 20,
    /// Reply to a heartbeat.
    HeartbeatOk = 21,
    /// The caller exceeded the provider's rate limit.
    RateLimited = 31,
    /// The provider has no such method.
    NotFound = 44,
    /// The method ran and failed.
    Failure = 50,
    /// The provider is shutting down.
    Closing = 51,
}

/// Status code that no known [`Status`] maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownStatus(pub u8);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown response status {}", self.0)
    }
}

impl TryFrom<u8> for Status {
    type Error = UnknownStatus;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            20 => Ok(Self::Success),
            21 => Ok(Self::HeartbeatOk),
            31 => Ok(Self::RateLimited),
            44 => Ok(Self::NotFound),
            50 => Ok(Self::Failure),
            51 => Ok(Self::Closing),
            other => Err(UnknownStatus(other)),
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        status as Self
    }
}

/// Body of a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    /// Outcome of the call.
    pub status: Status,
    /// Return value; `Null` when there is none.
    #[serde(default)]
    pub value: Value,
    /// Error description for failed calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResponseBody {
    /// Successful call returning `value`.
    #[must_use]
    pub const fn success(value: Value) -> Self {
        Self {
            status: Status::Success,
            value,
            message: None,
        }
    }

    /// Reply to a heartbeat.
    #[must_use]
    pub const fn heartbeat() -> Self {
        Self::status(Status::HeartbeatOk)
    }

    /// Failed call with a description.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failure,
            value: Value::Null,
            message: Some(message.into()),
        }
    }

    /// Bare status with no value.
    #[must_use]
    pub const fn status(status: Status) -> Self {
        Self {
            status,
            value: Value::Null,
            message: None,
        }
    }
}

/// Decoded body of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// No body (heartbeat requests).
    Empty,
    /// Method invocation.
    Request(RequestPayload),
    /// Reply.
    Response(ResponseBody),
}

/// A fully decoded message: header plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Header fields.
    pub header: Header,
    /// Decoded body.
    pub body: Body,
}

impl Envelope {
    /// Build a request envelope.
    #[must_use]
    pub fn request(request_id: u64, serializer: u8, compressor: u8, payload: RequestPayload) -> Self {
        Self {
            header: Header::new(MessageKind::Request, serializer, compressor, request_id),
            body: Body::Request(payload),
        }
    }

    /// Build a heartbeat probe.
    #[must_use]
    pub fn heartbeat(request_id: u64, serializer: u8, compressor: u8) -> Self {
        Self {
            header: Header::new(MessageKind::Heartbeat, serializer, compressor, request_id),
            body: Body::Empty,
        }
    }

    /// Build a response envelope.
    #[must_use]
    pub fn response(request_id: u64, serializer: u8, compressor: u8, body: ResponseBody) -> Self {
        Self {
            header: Header::new(MessageKind::Response, serializer, compressor, request_id),
            body: Body::Response(body),
        }
    }

    /// Build the reply to `request`, reusing its id and codecs.
    #[must_use]
    pub fn reply_to(request: &Header, body: ResponseBody) -> Self {
        Self::response(request.request_id, request.serializer, request.compressor, body)
    }

    /// Correlation id.
    #[must_use]
    pub const fn request_id(&self) -> u64 {
        self.header.request_id
    }
}
