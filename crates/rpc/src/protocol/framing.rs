//! Message framing for the wire protocol.
//!
//! Every frame starts with a fixed 30 byte header, all integers big-endian:
//!
//! ```text
//! magic(4) | version(1) | header_len(2) | total_len(4) | kind(1)
//!   | serializer(1) | compressor(1) | request_id(8) | timestamp(8) | body
//! ```
//!
//! `total_len` covers the header and the body. The body is left opaque here;
//! decoding it is the job of [`CodecRegistry`](super::CodecRegistry).

use crate::error::{Error, ProtocolError};

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Marker every frame starts with.
pub const MAGIC: [u8; 4] = *b"PRPC";

/// Protocol version written by this build.
pub const VERSION: u8 = 1;

/// Length of the fixed header.
pub const HEADER_LENGTH: u16 = 30;

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const TOTAL_LENGTH_OFFSET: usize = 7;

/// Kind of message carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Method invocation.
    Request = 0x01,
    /// Liveness probe. Carries no body.
    Heartbeat = 0x02,
    /// Reply to a request or heartbeat.
    Response = 0x03,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Heartbeat),
            0x03 => Ok(Self::Response),
            _ => Err(ProtocolError::UnknownKind(value)),
        }
    }
}

/// Fixed header fields that vary per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Kind of message.
    pub kind: MessageKind,
    /// Code of the serializer used for the body.
    pub serializer: u8,
    /// Code of the compressor used for the body.
    pub compressor: u8,
    /// Correlation id.
    pub request_id: u64,
    /// Milliseconds since the Unix epoch when the message was built.
    pub timestamp: u64,
}

impl Header {
    /// Create a header stamped with the current time.
    #[must_use]
    pub fn new(kind: MessageKind, serializer: u8, compressor: u8, request_id: u64) -> Self {
        Self {
            kind,
            serializer,
            compressor,
            request_id,
            timestamp: now_millis(),
        }
    }
}

/// A frame in the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header of this frame.
    pub header: Header,
    /// Encoded body, possibly empty.
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub const fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Total length this frame occupies on the wire.
    #[must_use]
    pub const fn wire_len(&self) -> usize {
        HEADER_LENGTH as usize + self.body.len()
    }
}

/// Codec for encoding/decoding frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Reject foreign traffic as soon as the first bytes disagree
        let seen = buf.len().min(MAGIC.len());
        if buf[..seen] != MAGIC[..seen] {
            return Err(ProtocolError::BadMagic(buf[..seen].to_vec()).into());
        }

        if buf.len() < HEADER_LENGTH as usize {
            return Ok(None);
        }

        // Parse header without consuming
        let mut header = &buf[MAGIC.len()..HEADER_LENGTH as usize];
        let version = header.get_u8();
        if version != VERSION {
            return Err(ProtocolError::UnsupportedVersion(version).into());
        }

        let header_len = header.get_u16();
        if header_len < HEADER_LENGTH {
            return Err(ProtocolError::InvalidHeaderLength(header_len).into());
        }

        let total_len = header.get_u32() as usize;
        if total_len < header_len as usize {
            return Err(ProtocolError::InvalidTotalLength {
                total: total_len,
                header: header_len as usize,
            }
            .into());
        }

        if total_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total_len,
                max: self.max_frame_size,
            }
            .into());
        }

        let kind = MessageKind::try_from(header.get_u8())?;
        let serializer = header.get_u8();
        let compressor = header.get_u8();
        let request_id = header.get_u64();
        let timestamp = header.get_u64();

        // Check if we have the full frame
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        // Extended headers are skipped
        buf.advance(header_len as usize);
        let body = buf.split_to(total_len - header_len as usize).freeze();

        // Heartbeats never carry a body, whatever the sender declared
        let body = if kind == MessageKind::Heartbeat {
            Bytes::new()
        } else {
            body
        };

        Ok(Some(Frame {
            header: Header {
                kind,
                serializer,
                compressor,
                request_id,
                timestamp,
            },
            body,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let body = if frame.header.kind == MessageKind::Heartbeat {
            Bytes::new()
        } else {
            frame.body
        };

        let total_len = HEADER_LENGTH as usize + body.len();
        if total_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total_len,
                max: self.max_frame_size,
            }
            .into());
        }

        buf.reserve(total_len);
        let start = buf.len();

        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u16(HEADER_LENGTH);
        // Placeholder, backfilled once the body is written
        buf.put_u32(0);
        buf.put_u8(frame.header.kind as u8);
        buf.put_u8(frame.header.serializer);
        buf.put_u8(frame.header.compressor);
        buf.put_u64(frame.header.request_id);
        buf.put_u64(frame.header.timestamp);
        buf.put(body);

        #[allow(clippy::cast_possible_truncation)]
        let written = (buf.len() - start) as u32;
        let at = start + TOTAL_LENGTH_OFFSET;
        buf[at..at + 4].copy_from_slice(&written.to_be_bytes());

        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request_frame(id: u64, body: &'static [u8]) -> Frame {
        Frame::new(
            Header::new(MessageKind::Request, 1, 0, id),
            Bytes::from_static(body),
        )
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = request_frame(42, b"Hello, World!");
        codec.encode(frame.clone(), &mut buf).unwrap();

        assert_eq!(buf.len(), frame.wire_len());
        let declared = u32::from_be_bytes(buf[7..11].try_into().unwrap()) as usize;
        assert_eq!(declared, HEADER_LENGTH as usize + frame.body.len());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_heartbeat_has_no_body() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = Frame::new(
            Header::new(MessageKind::Heartbeat, 1, 1, 7),
            Bytes::from_static(b"ignored"),
        );
        codec.encode(frame, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LENGTH as usize);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header.kind, MessageKind::Heartbeat);
        assert_eq!(decoded.header.request_id, 7);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(request_frame(1, b"partial body"), &mut full)
            .unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 3..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_bad_magic_fails_fast() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"GE"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::BadMagic(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(request_frame(1, b"x"), &mut buf).unwrap();
        buf[4] = 9;

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_total_length_shorter_than_header() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(request_frame(1, b"x"), &mut buf).unwrap();
        buf[7..11].copy_from_slice(&10u32.to_be_bytes());

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidTotalLength { .. })
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new().with_max_frame_size(64);
        let mut buf = BytesMut::new();

        let err = codec
            .encode(request_frame(1, &[0u8; 64]), &mut buf)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::FrameTooLarge { .. })
        ));

        // A peer declaring a huge frame is refused before the body arrives
        let mut wide = FrameCodec::new();
        wide.encode(request_frame(1, &[0u8; 64]), &mut buf).unwrap();
        buf.truncate(HEADER_LENGTH as usize);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::FrameTooLarge { size: 94, max: 64 })
        ));
    }

    #[test]
    fn test_extended_header_is_skipped() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u16(HEADER_LENGTH + 2);
        buf.put_u32(u32::from(HEADER_LENGTH) + 2 + 3);
        buf.put_u8(MessageKind::Request as u8);
        buf.put_u8(1);
        buf.put_u8(0);
        buf.put_u64(5);
        buf.put_u64(0);
        buf.put_slice(&[0xAA, 0xBB]);
        buf.put_slice(b"abc");

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.request_id, 5);
        assert_eq!(&frame.body[..], b"abc");
    }

    #[tokio::test]
    async fn test_framed_read_over_chunked_stream() {
        use assert_matches::assert_matches;
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let mut codec = FrameCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(request_frame(1, b"first"), &mut wire).unwrap();
        codec.encode(request_frame(2, b"second"), &mut wire).unwrap();

        // The second frame arrives split across reads
        let split = wire.len() - 4;
        let io = tokio_test::io::Builder::new()
            .read(&wire[..11])
            .read(&wire[11..split])
            .read(&wire[split..])
            .read(b"XXXX")
            .build();
        let mut frames = FramedRead::new(io, FrameCodec::new());

        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(first, request_frame(1, b"first"));
        let second = frames.next().await.unwrap().unwrap();
        assert_eq!(second, request_frame(2, b"second"));

        assert_matches!(
            frames.next().await,
            Some(Err(Error::Protocol(ProtocolError::BadMagic(_))))
        );
    }

    proptest! {
        #[test]
        fn prop_split_stream_yields_every_frame(
            bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
            chunk in 1usize..40,
        ) {
            let mut codec = FrameCodec::new();
            let mut wire = BytesMut::new();
            let mut frames = Vec::new();
            for (i, body) in bodies.into_iter().enumerate() {
                let frame = Frame::new(
                    Header::new(MessageKind::Request, 2, 1, i as u64),
                    Bytes::from(body),
                );
                codec.encode(frame.clone(), &mut wire).unwrap();
                frames.push(frame);
            }

            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for piece in wire.chunks(chunk) {
                buf.extend_from_slice(piece);
                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    decoded.push(frame);
                }
            }

            prop_assert!(buf.is_empty());
            prop_assert_eq!(decoded, frames);
        }
    }
}
