//! Wire protocol: framing, message types and body codecs.

pub mod codecs;
pub mod compress;
pub mod framing;
pub mod message;
pub mod serialize;

pub use codecs::CodecRegistry;
pub use compress::{Compressor, GzipCompressor, NoCompression};
pub use framing::{Frame, FrameCodec, Header, MessageKind};
pub use message::{Body, Envelope, RequestPayload, ResponseBody, Status};
pub use serialize::{CborSerializer, JsonSerializer, Serializer};
