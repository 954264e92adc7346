//! Value compression
//!
//! LZ4 block compression with fallback to storing the raw payload when the
//! value is small, incompressible or the compressor fails.
//!
//! # Example
//!
//! ```
//! use relaygate::cache::compression::{CompressionAlgorithm, CompressionCodec};
//!
//! let codec = CompressionCodec::default();
//! let data = "forecast ".repeat(400);
//! let (stored, algorithm) = codec.compress(data.as_bytes());
//! assert_eq!(algorithm, CompressionAlgorithm::Lz4);
//!
//! let restored = codec.decompress(&stored, algorithm).unwrap();
//! assert_eq!(restored.as_ref(), data.as_bytes());
//! ```

use crate::error::{Error, Result};
use bytes::Bytes;

/// How a stored payload is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// Raw bytes
    #[default]
    None,
    /// LZ4 block with prepended size
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Wire tag used in the stored entry header
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Codec settings
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Values smaller than this are stored raw
    pub min_size_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size_bytes: 1024,
            level: 4,
        }
    }
}

/// Compresses cache values on write and restores them on read
#[derive(Debug, Clone, Default)]
pub struct CompressionCodec {
    config: CompressionConfig,
}

impl CompressionCodec {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Codec with a custom minimum size
    pub fn with_min_size(min_size_bytes: u64) -> Self {
        Self::new(CompressionConfig {
            min_size_bytes,
            ..Default::default()
        })
    }

    /// Compress `data`, returning the stored bytes and how they are encoded.
    ///
    /// Never fails: anything that does not shrink is kept raw.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if (data.len() as u64) < self.config.min_size_bytes {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.config.level)),
            true,
        ) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), CompressionAlgorithm::Lz4)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!(error = %e, "LZ4 compression failed, storing raw value");
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Restore a stored payload
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        match algorithm {
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(data)),
            CompressionAlgorithm::Lz4 => lz4::block::decompress(data, None)
                .map(Bytes::from)
                .map_err(|e| Error::DecompressionFailed {
                    algorithm: algorithm.name().to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn payload() -> Vec<u8> {
        br#"{"city":"Lagos","temp":31.5,"conditions":"humid"}"#.repeat(64)
    }

    #[test]
    fn test_large_repetitive_value_is_compressed() {
        let codec = CompressionCodec::default();
        let data = payload();

        let (stored, algorithm) = codec.compress(&data);
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
        assert!(stored.len() < data.len());

        let restored = codec.decompress(&stored, algorithm).unwrap();
        assert_eq!(restored.as_ref(), data.as_slice());
    }

    #[test]
    fn test_small_value_stored_raw() {
        let codec = CompressionCodec::default();
        let (stored, algorithm) = codec.compress(b"tiny");
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored.as_ref(), b"tiny");
    }

    #[test]
    fn test_incompressible_value_stored_raw() {
        let codec = CompressionCodec::with_min_size(16);
        // xorshift noise does not compress
        let mut x: u32 = 0x9E37_79B9;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect();

        let (stored, algorithm) = codec.compress(&noise);
        if algorithm == CompressionAlgorithm::None {
            assert_eq!(stored.len(), noise.len());
        } else {
            assert!(stored.len() < noise.len());
        }
    }

    #[test]
    fn test_truncated_lz4_payload() {
        let codec = CompressionCodec::default();
        let err = codec
            .decompress(&[1, 2], CompressionAlgorithm::Lz4)
            .unwrap_err();
        assert_matches!(err, Error::DecompressionFailed { .. });
    }

    #[test]
    fn test_tags() {
        for algorithm in [CompressionAlgorithm::None, CompressionAlgorithm::Lz4] {
            assert_eq!(CompressionAlgorithm::from_tag(algorithm.tag()), Some(algorithm));
        }
        assert_eq!(CompressionAlgorithm::from_tag(9), None);
        assert_eq!(CompressionAlgorithm::Lz4.to_string(), "lz4");
    }
}
