//! Per-service cache counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache counters for one service
#[derive(Debug, Default)]
pub struct ServiceCacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    total_size: AtomicU64,
}

impl ServiceCacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, n: u64) {
        self.expirations.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_size(&self, bytes: u64) {
        self.total_size.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Subtract without wrapping below zero
    pub fn sub_size(&self, bytes: u64) {
        let _ = self
            .total_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.sets,
            &self.deletes,
            &self.errors,
            &self.evictions,
            &self.expirations,
            &self.total_size,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            total_size: self.total_size(),
        }
    }
}

/// Point-in-time view of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub total_size: u64,
}

impl CacheMetricsSnapshot {
    /// Add another service's counters into this one
    pub fn merge(&mut self, other: &CacheMetricsSnapshot) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.sets += other.sets;
        self.deletes += other.deletes;
        self.errors += other.errors;
        self.evictions += other.evictions;
        self.expirations += other.expirations;
        self.total_size += other.total_size;
    }

    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_ratio() {
        let m = ServiceCacheMetrics::new();
        m.record_hit();
        m.record_hit();
        m.record_hit();
        m.record_miss();
        m.record_set();
        m.add_size(100);

        let snap = m.snapshot();
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.sets, 1);
        assert_eq!(snap.total_size, 100);
        assert!((snap.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_size_never_wraps() {
        let m = ServiceCacheMetrics::new();
        m.add_size(10);
        m.sub_size(25);
        assert_eq!(m.total_size(), 0);
    }

    #[test]
    fn test_reset() {
        let m = ServiceCacheMetrics::new();
        m.record_error();
        m.record_evictions(2);
        m.add_size(5);
        m.reset();
        assert_eq!(m.snapshot(), CacheMetricsSnapshot::default());
    }

    #[test]
    fn test_merge() {
        let mut total = CacheMetricsSnapshot::default();
        total.merge(&CacheMetricsSnapshot { hits: 2, total_size: 10, ..Default::default() });
        total.merge(&CacheMetricsSnapshot { hits: 1, misses: 4, ..Default::default() });
        assert_eq!(total.hits, 3);
        assert_eq!(total.misses, 4);
        assert_eq!(total.total_size, 10);
        assert_eq!(CacheMetricsSnapshot::default().hit_ratio(), 0.0);
    }
}
