//! Body compressors, selected on the wire by a single-byte code.

use crate::error::CodecError;

use std::fmt::Debug;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Code of the pass-through compressor.
pub const NONE: u8 = 0;

/// Code of the gzip compressor.
pub const GZIP: u8 = 1;

/// Byte-level body compression.
pub trait Compressor: Debug + Send + Sync + 'static {
    /// Wire code of this compressor.
    fn code(&self) -> u8;

    /// Configuration name of this compressor.
    fn name(&self) -> &'static str;

    /// Compress a body.
    ///
    /// # Errors
    ///
    /// Returns an error if compression fails.
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decompress a body into at most `limit` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not valid compressed data or expand
    /// beyond `limit`.
    fn decompress(&self, bytes: &[u8], limit: usize) -> Result<Vec<u8>, CodecError>;
}

/// Leaves bodies untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn code(&self) -> u8 {
        NONE
    }

    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }

    fn decompress(&self, bytes: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        if bytes.len() > limit {
            return Err(too_large(limit));
        }
        Ok(bytes.to_vec())
    }
}

/// Gzip via `flate2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn code(&self) -> u8 {
        GZIP
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
        encoder
            .write_all(bytes)
            .map_err(|e| CodecError::CompressionFailed(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::CompressionFailed(e.to_string()))
    }

    fn decompress(&self, bytes: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(bytes.len().saturating_mul(2).min(limit));
        // One byte past the limit tells an exact fit from an overflow
        GzDecoder::new(bytes)
            .take(u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1))
            .read_to_end(&mut out)
            .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?;

        if out.len() > limit {
            return Err(too_large(limit));
        }
        Ok(out)
    }
}

fn too_large(limit: usize) -> CodecError {
    CodecError::DecompressionFailed(format!("body expands beyond {limit} bytes"))
}
