//! Stored cache entries
//!
//! An entry carries its own creation time and TTL so every backend can do
//! the same lazy expiry check. External stores hold the binary envelope
//! produced by [`CacheEntry::encode`]:
//!
//! ```text
//! +---------+-----+---------------+-------------+----------------+---------+
//! | version | alg | created_at_ms | ttl_seconds | size_bytes     | payload |
//! | u8      | u8  | u64 BE        | u64 BE      | u64 BE         | ...     |
//! +---------+-----+---------------+-------------+----------------+---------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::compression::CompressionAlgorithm;
use crate::error::{Error, Result};

const ENVELOPE_VERSION: u8 = 1;
const HEADER_LEN: usize = 2 + 8 + 8 + 8;

/// A cached value and its lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Stored (possibly compressed) bytes
    pub value: Bytes,
    /// Creation timestamp (epoch ms)
    pub created_at_ms: u64,
    /// Lifetime in seconds
    pub ttl_seconds: u64,
    /// Uncompressed payload size
    pub size_bytes: u64,
    /// How `value` is encoded
    pub compression: CompressionAlgorithm,
}

impl CacheEntry {
    pub fn new(
        value: Bytes,
        size_bytes: u64,
        compression: CompressionAlgorithm,
        created_at_ms: u64,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            value,
            created_at_ms,
            ttl_seconds,
            size_bytes,
            compression,
        }
    }

    /// Whether `value` is compressed
    #[inline]
    pub fn compressed(&self) -> bool {
        self.compression != CompressionAlgorithm::None
    }

    /// Expired once `ttl_seconds` have fully elapsed since creation
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) >= self.ttl_seconds.saturating_mul(1000)
    }

    /// Epoch ms at which the entry expires
    #[inline]
    pub fn expires_at_ms(&self) -> u64 {
        self.created_at_ms
            .saturating_add(self.ttl_seconds.saturating_mul(1000))
    }

    /// Serialize into the external-store envelope
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.value.len());
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u8(self.compression.tag());
        buf.put_u64(self.created_at_ms);
        buf.put_u64(self.ttl_seconds);
        buf.put_u64(self.size_bytes);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    /// Parse an envelope written by [`encode`](Self::encode)
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(Error::CacheBackend(format!(
                "entry envelope too short: {} bytes",
                raw.len()
            )));
        }

        let mut buf = raw;
        let version = buf.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(Error::CacheBackend(format!(
                "unsupported entry envelope version {}",
                version
            )));
        }
        let tag = buf.get_u8();
        let compression = CompressionAlgorithm::from_tag(tag)
            .ok_or_else(|| Error::CacheBackend(format!("unknown compression tag {}", tag)))?;
        let created_at_ms = buf.get_u64();
        let ttl_seconds = buf.get_u64();
        let size_bytes = buf.get_u64();

        Ok(Self {
            value: Bytes::copy_from_slice(buf),
            created_at_ms,
            ttl_seconds,
            size_bytes,
            compression,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn entry(created: u64, ttl: u64) -> CacheEntry {
        CacheEntry::new(Bytes::from_static(b"payload"), 7, CompressionAlgorithm::None, created, ttl)
    }

    #[test]
    fn test_expiry_boundary() {
        let e = entry(10_000, 5);
        assert!(!e.is_expired(10_000));
        assert!(!e.is_expired(14_999));
        assert!(e.is_expired(15_000));
        assert_eq!(e.expires_at_ms(), 15_000);
    }

    #[test]
    fn test_envelope() {
        let e = CacheEntry::new(
            Bytes::from_static(b"\x01\x02\x03"),
            300,
            CompressionAlgorithm::Lz4,
            1_700_000_000_000,
            600,
        );
        let raw = e.encode();
        assert_eq!(raw.len(), HEADER_LEN + 3);

        let decoded = CacheEntry::decode(&raw).unwrap();
        assert_eq!(decoded, e);
        assert!(decoded.compressed());
    }

    #[test]
    fn test_short_envelope_rejected() {
        assert_matches!(CacheEntry::decode(&[1, 0, 0]), Err(Error::CacheBackend(_)));
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut raw = entry(0, 1).encode().to_vec();
        raw[0] = 9;
        assert_matches!(CacheEntry::decode(&raw), Err(Error::CacheBackend(msg)) if msg.contains("version"));
    }
}
