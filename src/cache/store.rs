//! Service-facing cache API
//!
//! [`CacheStore`] maps `(service, params)` to a storage key, applies the
//! service's table (TTL, capacity, compression, metrics) and forwards to the
//! configured [`CacheBackend`]. Every backend call is bounded by a deadline;
//! backend failures and timeouts are counted as errors and reported to the
//! caller as a miss (reads) or a no-op (writes).

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::adaptive::AdaptiveStrategy;
use super::backend::{BackendStats, CacheBackend, Lookup, Partition};
use super::compression::{CompressionAlgorithm, CompressionCodec};
use super::entry::CacheEntry;
use super::key::{fingerprint, CacheKey};
use super::memory::InMemoryBackend;
use super::metrics::{CacheMetricsSnapshot, ServiceCacheMetrics};
use crate::clock::SharedClock;
use crate::config::{BackendConfig, CacheConfig};
use crate::error::{Error, Result};

/// Loader calls in flight during warm-up
const WARMUP_CONCURRENCY: usize = 4;

/// Backend occupancy plus per-service counters
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub backend: &'static str,
    pub keys: u64,
    pub bytes: u64,
    pub services: BTreeMap<String, CacheMetricsSnapshot>,
}

struct ServiceCache {
    config: CacheConfig,
    metrics: Arc<ServiceCacheMetrics>,
}

impl ServiceCache {
    fn partition<'a>(&'a self, service: &'a str) -> Partition<'a> {
        Partition {
            service,
            prefix: &self.config.key_prefix,
            max_entries: self.config.max_entries,
        }
    }

    fn metrics(&self) -> Option<&ServiceCacheMetrics> {
        self.config.metrics_enabled.then_some(&*self.metrics)
    }
}

/// Cache front end shared by every request handler
pub struct CacheStore {
    services: HashMap<String, ServiceCache>,
    backend: Arc<dyn CacheBackend>,
    codec: CompressionCodec,
    adaptive: Option<Arc<AdaptiveStrategy>>,
    clock: SharedClock,
    timeout: Duration,
}

impl CacheStore {
    /// Store over `backend` for the given per-service tables
    pub fn new(
        tables: BTreeMap<String, CacheConfig>,
        backend: Arc<dyn CacheBackend>,
        backend_config: &BackendConfig,
        clock: SharedClock,
    ) -> Self {
        let services = tables
            .into_iter()
            .map(|(name, config)| {
                (
                    name,
                    ServiceCache {
                        config,
                        metrics: Arc::new(ServiceCacheMetrics::new()),
                    },
                )
            })
            .collect();

        info!(
            backend = backend.name(),
            timeout_ms = backend_config.timeout_ms,
            "Cache store initialized"
        );

        Self {
            services,
            backend,
            codec: CompressionCodec::with_min_size(backend_config.compression_min_bytes),
            adaptive: None,
            clock,
            timeout: backend_config.timeout(),
        }
    }

    /// In-process store whose eviction consults a fresh adaptive strategy
    pub fn in_memory(
        tables: BTreeMap<String, CacheConfig>,
        backend_config: &BackendConfig,
        clock: SharedClock,
    ) -> Self {
        let ttls = tables
            .iter()
            .map(|(name, config)| (name.clone(), config.ttl_seconds))
            .collect();
        let adaptive = Arc::new(AdaptiveStrategy::new(ttls));
        let backend = Arc::new(InMemoryBackend::with_priorities(adaptive.clone()));
        Self::new(tables, backend, backend_config, clock).with_adaptive(adaptive)
    }

    /// Feed every access and write into `adaptive`
    pub fn with_adaptive(mut self, adaptive: Arc<AdaptiveStrategy>) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    pub fn adaptive(&self) -> Option<&Arc<AdaptiveStrategy>> {
        self.adaptive.as_ref()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Services with a cache table
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Table for a service
    pub fn config(&self, service: &str) -> Option<&CacheConfig> {
        self.services.get(service).map(|s| &s.config)
    }

    /// Storage key for `(service, params)`
    pub fn key_for(&self, service: &str, params: &Value) -> Option<CacheKey> {
        let svc = self.services.get(service)?;
        Some(CacheKey::derive(service, &svc.config.key_prefix, params))
    }

    async fn bounded<T, F>(&self, timeout: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::BackendTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Cached value for `(service, params)`.
    ///
    /// `None` on a miss, on an expired entry (removed by this read), for a
    /// service without a cache table, and when the backend fails.
    pub async fn get(&self, service: &str, params: &Value) -> Option<Bytes> {
        self.get_with_deadline(service, params, self.timeout).await
    }

    /// [`get`](Self::get) with an explicit deadline for the backend call
    pub async fn get_with_deadline(
        &self,
        service: &str,
        params: &Value,
        deadline: Duration,
    ) -> Option<Bytes> {
        let svc = self.services.get(service)?;
        let key = CacheKey::derive(service, &svc.config.key_prefix, params);
        let now = self.clock.now_ms();

        let lookup = self
            .bounded(
                deadline,
                self.backend.get(svc.partition(service), key.as_str(), now),
            )
            .await;

        let hit = match lookup {
            Ok(Lookup::Hit(entry)) => match self.codec.decompress(&entry.value, entry.compression) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(service = %service, key = %key, error = %e, "Dropping undecodable cache entry");
                    if let Some(m) = svc.metrics() {
                        m.record_error();
                    }
                    return None;
                }
            },
            Ok(Lookup::Expired { size_bytes }) => {
                debug!(service = %service, key = %key, "Cache entry expired on read");
                if let Some(m) = svc.metrics() {
                    m.record_expirations(1);
                    m.sub_size(size_bytes);
                }
                None
            }
            Ok(Lookup::Miss) => None,
            Err(e) => {
                warn!(service = %service, key = %key, error = %e, "Cache read failed, treating as miss");
                if let Some(m) = svc.metrics() {
                    m.record_error();
                }
                return None;
            }
        };

        if let Some(m) = svc.metrics() {
            if hit.is_some() {
                m.record_hit();
            } else {
                m.record_miss();
            }
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.record_access(service, key.as_str(), hit.is_some(), false, now);
        }
        hit
    }

    /// Cache `value` for `(service, params)` with the service's TTL.
    ///
    /// Returns whether the value was stored.
    pub async fn set(&self, service: &str, params: &Value, value: &[u8]) -> bool {
        let Some(svc) = self.services.get(service) else {
            return false;
        };
        let key = CacheKey::derive(service, &svc.config.key_prefix, params);
        let now = self.clock.now_ms();
        let size = value.len() as u64;

        let (stored, compression) = if svc.config.compression_enabled {
            self.codec.compress(value)
        } else {
            (Bytes::copy_from_slice(value), CompressionAlgorithm::None)
        };
        let entry = CacheEntry::new(stored, size, compression, now, svc.config.ttl_seconds);

        let outcome = match self
            .bounded(
                self.timeout,
                self.backend.set(svc.partition(service), key.as_str(), entry, now),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(service = %service, key = %key, error = %e, "Cache write failed");
                if let Some(m) = svc.metrics() {
                    m.record_error();
                }
                return false;
            }
        };

        if !outcome.evicted.is_empty() {
            debug!(
                service = %service,
                evicted = outcome.evicted.len(),
                "Evicted entries to make room"
            );
        }

        if let Some(m) = svc.metrics() {
            m.record_set();
            if self.backend.tracks_size() {
                m.add_size(size);
                if let Some(replaced) = outcome.replaced_size {
                    m.sub_size(replaced);
                }
                for victim in &outcome.evicted {
                    m.sub_size(victim.size_bytes);
                }
            }
            let expired = outcome.evicted.iter().filter(|v| v.expired).count() as u64;
            m.record_expirations(expired);
            m.record_evictions(outcome.evicted.len() as u64 - expired);
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.record_write(service, key.as_str(), fingerprint(value));
        }
        true
    }

    /// Remove the entry for `(service, params)`; returns whether one existed
    pub async fn delete(&self, service: &str, params: &Value) -> bool {
        let Some(svc) = self.services.get(service) else {
            return false;
        };
        let key = CacheKey::derive(service, &svc.config.key_prefix, params);

        match self
            .bounded(self.timeout, self.backend.delete(svc.partition(service), key.as_str()))
            .await
        {
            Ok(removed) => {
                if let Some(m) = svc.metrics() {
                    m.record_delete();
                    if let Some(size) = removed {
                        m.sub_size(size);
                    }
                }
                removed.is_some()
            }
            Err(e) => {
                warn!(service = %service, key = %key, error = %e, "Cache delete failed");
                if let Some(m) = svc.metrics() {
                    m.record_error();
                }
                false
            }
        }
    }

    /// Remove every entry of a service and zero its counters
    pub async fn clear_service(&self, service: &str) -> Result<u64> {
        let svc = self
            .services
            .get(service)
            .ok_or_else(|| Error::UnknownService(service.to_string()))?;

        let removed = self
            .bounded(self.timeout, self.backend.clear(svc.partition(service)))
            .await
            .map_err(|e| {
                svc.metrics.record_error();
                e
            })?;
        svc.metrics.reset();

        info!(service = %service, entries = removed.entries, "Cleared service cache");
        Ok(removed.entries)
    }

    /// Counters for one service, or the sum over all services
    pub fn stats(&self, service: Option<&str>) -> CacheMetricsSnapshot {
        match service {
            Some(name) => self
                .services
                .get(name)
                .map(|s| s.metrics.snapshot())
                .unwrap_or_default(),
            None => {
                let mut total = CacheMetricsSnapshot::default();
                for svc in self.services.values() {
                    total.merge(&svc.metrics.snapshot());
                }
                total
            }
        }
    }

    /// Counters per service
    pub fn all_stats(&self) -> BTreeMap<String, CacheMetricsSnapshot> {
        self.services
            .iter()
            .map(|(name, svc)| (name.clone(), svc.metrics.snapshot()))
            .collect()
    }

    /// Backend occupancy and per-service counters
    pub async fn store_stats(&self) -> Result<StoreStats> {
        let BackendStats { keys, bytes } =
            self.bounded(self.timeout, self.backend.stats()).await?;
        Ok(StoreStats {
            backend: self.backend.name(),
            keys,
            bytes,
            services: self.all_stats(),
        })
    }

    /// Remove every expired entry, adjusting each service's size.
    ///
    /// Returns the number of entries removed.
    pub async fn sweep(&self) -> Result<u64> {
        let now = self.clock.now_ms();
        let removed = self.backend.sweep_expired(now).await?;

        let mut total = 0;
        for r in &removed {
            total += r.entries;
            if let Some(m) = self.services.get(&r.service).and_then(|s| s.metrics()) {
                m.record_expirations(r.entries);
                m.sub_size(r.bytes);
            }
        }
        if total > 0 {
            info!(removed = total, "Swept expired cache entries");
        }
        Ok(total)
    }

    /// Pre-load entries for `params_list`, skipping ones already cached.
    ///
    /// Up to four loads run at once. Loader failures are logged and
    /// skipped. Returns how many entries were loaded.
    pub async fn warmup<F, Fut>(&self, service: &str, params_list: &[Value], loader: F) -> usize
    where
        F: Fn(Value) -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let Some(svc) = self.services.get(service) else {
            warn!(service = %service, "Warm-up requested for a service without a cache table");
            return 0;
        };

        let prefix = svc.config.key_prefix.as_str();
        let loaded = stream::iter(params_list)
            .map(|params| self.warm_one(service, prefix, params, &loader))
            .buffer_unordered(WARMUP_CONCURRENCY)
            .filter(|stored| future::ready(*stored))
            .count()
            .await;

        info!(service = %service, loaded, requested = params_list.len(), "Cache warm-up finished");
        loaded
    }

    async fn warm_one<F, Fut>(&self, service: &str, prefix: &str, params: &Value, loader: &F) -> bool
    where
        F: Fn(Value) -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let Some(svc) = self.services.get(service) else {
            return false;
        };
        let key = CacheKey::derive(service, prefix, params);
        let now = self.clock.now_ms();
        // Peek without counting a miss
        if let Ok(Lookup::Hit(_)) = self
            .bounded(self.timeout, self.backend.get(svc.partition(service), key.as_str(), now))
            .await
        {
            return false;
        }

        match loader(params.clone()).await {
            Ok(value) => self.set(service, params, &value).await,
            Err(e) => {
                warn!(service = %service, key = %key, error = %e, "Warm-up load failed");
                false
            }
        }
    }

    /// Deserialize a cached JSON value
    pub async fn get_json<T: DeserializeOwned>(&self, service: &str, params: &Value) -> Option<T> {
        let raw = self.get(service, params).await?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(service = %service, error = %e, "Cached value is not valid JSON");
                None
            }
        }
    }

    /// Serialize and cache a JSON value
    pub async fn set_json<T: Serialize>(&self, service: &str, params: &Value, value: &T) -> Result<bool> {
        let raw = serde_json::to_vec(value)?;
        Ok(self.set(service, params, &raw).await)
    }
}
