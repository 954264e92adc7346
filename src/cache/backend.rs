//! Pluggable cache storage
//!
//! [`CacheStore`](super::CacheStore) talks to storage only through
//! [`CacheBackend`]. Two implementations exist: the in-process
//! [`InMemoryBackend`](super::InMemoryBackend) (default) and, behind the
//! `redis` feature, `RedisBackend`. The backend is chosen once at startup.

use async_trait::async_trait;
use serde::Serialize;

use super::entry::CacheEntry;
use crate::error::Result;

/// The service partition a call targets
#[derive(Debug, Clone, Copy)]
pub struct Partition<'a> {
    /// Service name
    pub service: &'a str,
    /// Key prefix every key in the partition starts with
    pub prefix: &'a str,
    /// Capacity before eviction kicks in
    pub max_entries: usize,
}

/// Result of a read
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Live entry
    Hit(CacheEntry),
    /// Nothing stored
    Miss,
    /// An expired entry was found and removed by this read
    Expired { size_bytes: u64 },
}

/// An entry pushed out to make room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    pub key: String,
    pub size_bytes: u64,
    /// The victim had already expired
    pub expired: bool,
}

/// Result of a write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOutcome {
    /// Size of the entry this write replaced
    pub replaced_size: Option<u64>,
    pub evicted: Vec<Evicted>,
}

/// Entries removed by a clear or sweep, per service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Removed {
    pub service: String,
    pub entries: u64,
    pub bytes: u64,
}

/// Whole-backend occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub keys: u64,
    pub bytes: u64,
}

/// Supplies eviction priority (0..=10, higher survives longer) for a key
pub trait PriorityOracle: Send + Sync {
    fn priority(&self, service: &str, key: &str, now_ms: u64) -> u8;
}

/// Every key has the same priority; eviction degenerates to pure LRU
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformPriority;

impl PriorityOracle for UniformPriority {
    fn priority(&self, _service: &str, _key: &str, _now_ms: u64) -> u8 {
        5
    }
}

/// Storage backend
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Whether removals are reported precisely enough to keep `total_size` exact
    fn tracks_size(&self) -> bool {
        true
    }

    /// Read a key, removing it if it has expired
    async fn get(&self, partition: Partition<'_>, key: &str, now_ms: u64) -> Result<Lookup>;

    /// Insert or replace a key, evicting first if the partition is full
    async fn set(
        &self,
        partition: Partition<'_>,
        key: &str,
        entry: CacheEntry,
        now_ms: u64,
    ) -> Result<SetOutcome>;

    /// Remove a key, returning the removed entry's size
    async fn delete(&self, partition: Partition<'_>, key: &str) -> Result<Option<u64>>;

    /// Remove every key in the partition
    async fn clear(&self, partition: Partition<'_>) -> Result<Removed>;

    /// Remove every expired entry
    async fn sweep_expired(&self, now_ms: u64) -> Result<Vec<Removed>>;

    /// Occupancy across all partitions
    async fn stats(&self) -> Result<BackendStats>;
}
