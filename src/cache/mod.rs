//! Response cache
//!
//! Per-service TTL cache in front of third-party data providers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        CacheStore                            │
//! │   key derivation · compression · per-service metrics         │
//! ├──────────────────────────────────────────────────────────────┤
//! │              dyn CacheBackend (chosen at startup)            │
//! │  ┌───────────────────────────┐   ┌────────────────────────┐  │
//! │  │ InMemoryBackend           │   │ RedisBackend           │  │
//! │  │ partition per service     │   │ SET EX / SCAN + DEL    │  │
//! │  │ lazy expiry + eviction    │   │ (feature "redis")      │  │
//! │  └─────────────┬─────────────┘   └────────────────────────┘  │
//! │                │ priority                                    │
//! │        ┌───────┴──────────┐                                  │
//! │        │ AdaptiveStrategy │ ◄── every access and write       │
//! │        └──────────────────┘                                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Entries live exactly `ttl_seconds`; reads past that return a miss and
//!   remove the entry
//! - A full partition evicts the lowest (priority, last access) entry
//! - Backend failures are counted and surface as misses, never as errors
//!   on the request path

mod adaptive;
mod backend;
mod entry;
mod key;
mod memory;
mod metrics;
#[cfg(feature = "redis")]
mod redis;
mod store;
pub mod compression;

pub use adaptive::{AdaptiveParams, AdaptiveStrategy, CacheAnalysis, UsageStat};
pub use backend::{
    BackendStats, CacheBackend, Evicted, Lookup, Partition, PriorityOracle, Removed, SetOutcome,
    UniformPriority,
};
pub use compression::{CompressionAlgorithm, CompressionCodec, CompressionConfig};
pub use entry::CacheEntry;
pub use key::{canonical_json, fingerprint, CacheKey};
pub use memory::InMemoryBackend;
pub use metrics::{CacheMetricsSnapshot, ServiceCacheMetrics};
#[cfg(feature = "redis")]
pub use redis::RedisBackend;
pub use store::{CacheStore, StoreStats};
