// SPDX-License-Identifier: MIT OR Apache-2.0
//! insights-codec
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Decoding for opaque envelope payloads. Binary payload entries arrive as
//! base64 strings whose decoded bytes may or may not be gzipped; compression
//! is detected by sniffing the decoded bytes, never trusted from labels.

/// Minimal CycloneDX document handling.
pub mod cyclonedx;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

/// Errors surfaced while decoding a payload. These are pipeline errors, not
/// panics; a malformed payload fails its envelope and nothing else.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload string was not valid base64.
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The gzip stream was truncated or corrupt.
    #[error("payload gzip stream is corrupt: {0}")]
    Gzip(#[source] std::io::Error),

    /// The decoded bytes were not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Gzip magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Returns `true` when `bytes` look like a gzip stream.
#[must_use]
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC
}

/// Base64-decode a binary payload entry and, if the decoded bytes sniff as
/// gzip, decompress them.
///
/// # Errors
///
/// [`CodecError::Base64`] or [`CodecError::Gzip`].
pub fn decode_binary_payload(encoded: &str) -> Result<Vec<u8>, CodecError> {
    let decoded = BASE64.decode(encoded.trim())?;
    if is_gzip(&decoded) {
        let mut out = Vec::new();
        GzDecoder::new(decoded.as_slice())
            .read_to_end(&mut out)
            .map_err(CodecError::Gzip)?;
        Ok(out)
    } else {
        Ok(decoded)
    }
}

/// Decode a binary payload entry all the way to a JSON value.
///
/// # Errors
///
/// Any of the [`CodecError`] variants.
pub fn decode_binary_json(encoded: &str) -> Result<serde_json::Value, CodecError> {
    let bytes = decode_binary_payload(encoded)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Gzip-compress `bytes` (used by the archiver when re-compressed output is
/// requested).
///
/// # Errors
///
/// [`CodecError::Gzip`] on encoder I/O failure.
pub fn gzip_bytes(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(CodecError::Gzip)?;
    encoder.finish().map_err(CodecError::Gzip)
}
