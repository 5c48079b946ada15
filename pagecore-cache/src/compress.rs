//! Gzip helpers for metadata-cache compression
//!
//! Values above a configurable size are compressed on insert. A
//! compressed payload that fails to inflate is treated as a cache miss
//! by callers, never an upstream error.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::{Error, Result};

/// Default minimum size before compression is attempted.
pub const DEFAULT_MIN_COMPRESS_BYTES: usize = 1024;

/// Compress `bytes` when it is at least `min_len` long and compression
/// actually helps. Returns `None` when the value should be stored
/// uncompressed.
pub fn maybe_compress(bytes: &[u8], min_len: usize) -> Option<Vec<u8>> {
    if bytes.len() < min_len {
        return None;
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes).ok()?;
    let compressed = encoder.finish().ok()?;
    if compressed.len() < bytes.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Inflate a gzip payload.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::CorruptPayload(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let body = vec![b'a'; 4096];
        let compressed = maybe_compress(&body, DEFAULT_MIN_COMPRESS_BYTES).unwrap();
        assert!(compressed.len() < body.len());
        assert_eq!(decompress(&compressed).unwrap(), body);
    }

    #[test]
    fn test_small_values_skip_compression() {
        assert!(maybe_compress(b"tiny", DEFAULT_MIN_COMPRESS_BYTES).is_none());
    }

    #[test]
    fn test_incompressible_values_stay_raw() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let noise: Vec<u8> = (0..4096).map(|_| rng.r#gen()).collect();
        // Random bytes do not shrink under deflate; the gzip framing
        // only adds overhead.
        assert!(maybe_compress(&noise, 16).is_none());
    }

    #[test]
    fn test_corrupt_payload_is_an_error() {
        assert!(decompress(b"not gzip at all").is_err());
    }
}
