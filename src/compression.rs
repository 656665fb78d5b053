//! Gzip handling for push-event payloads.
//!
//! Envelopes tagged as compressed carry a gzip stream inside the AES-GCM
//! plaintext. The stream is detected by its magic bytes so a malformed payload
//! fails with a clear error instead of an inflater panic or garbage output.

use flate2::read::GzDecoder;
use std::io::Read;

/// First two bytes of every gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors raised while inflating a payload.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// Payload does not start with the gzip magic bytes.
    #[error("payload is not a gzip stream")]
    NotGzip,
    /// The gzip stream is truncated or corrupt.
    #[error("gzip decompress failed: {0}")]
    Inflate(#[from] std::io::Error),
}

/// Returns `true` if `data` starts with the gzip magic bytes.
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= GZIP_MAGIC.len() && data[..2] == GZIP_MAGIC
}

/// Inflate a gzip stream.
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if !is_gzip(data) {
        return Err(CompressionError::NotGzip);
    }
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::with_capacity(data.len() * 4);
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}
