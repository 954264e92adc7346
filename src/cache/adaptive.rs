//! Adaptive cache strategy
//!
//! Observes every cache access and write per key and derives a recommended
//! TTL and an eviction priority from the access pattern. The strategy only
//! advises: the store keeps writing entries with the static TTL, while the
//! in-memory backend consults [`AdaptiveStrategy::priority`] (through
//! [`PriorityOracle`]) ahead of recency when it must evict.
//!
//! All scoring constants live in [`AdaptiveParams`] and are tunable.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use super::backend::PriorityOracle;

/// Scoring constants
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveParams {
    /// Accesses needed before the pattern is trusted
    pub min_accesses: u64,
    /// Intervals remembered per key
    pub interval_window: usize,
    /// TTL used for services with no static table
    pub fallback_ttl_seconds: u64,
    pub min_ttl_seconds: u64,
    /// Upper TTL clamp as a multiple of the static TTL
    pub max_ttl_factor: f64,
    /// Base TTL cap as a multiple of the static TTL
    pub base_ttl_factor: f64,
    /// Share of the mean access interval used as base TTL
    pub interval_ttl_share: f64,
    pub volatile_above: f64,
    pub stable_below: f64,
    pub high_hit_rate: f64,
    pub low_hit_rate: f64,
    /// Multiplicative volatility decay on an unchanged rewrite
    pub volatility_decay: f64,
    /// Share of keys in each hot/cold/volatile/stable bucket
    pub bucket_share: f64,
}

impl Default for AdaptiveParams {
    fn default() -> Self {
        Self {
            min_accesses: 5,
            interval_window: 10,
            fallback_ttl_seconds: 300,
            min_ttl_seconds: 60,
            max_ttl_factor: 10.0,
            base_ttl_factor: 5.0,
            interval_ttl_share: 0.8,
            volatile_above: 0.7,
            stable_below: 0.3,
            high_hit_rate: 0.8,
            low_hit_rate: 0.4,
            volatility_decay: 0.9,
            bucket_share: 0.2,
        }
    }
}

const HOUR_MS: u64 = 3_600_000;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Usage statistics for one cache key
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStat {
    pub hits: u64,
    pub misses: u64,
    /// Epoch ms of the last access; `None` before the first one
    pub last_access_ms: Option<u64>,
    /// Most recent access intervals, oldest first
    pub intervals_ms: VecDeque<u64>,
    pub avg_interval_ms: f64,
    /// 0 (never changes) to 1 (changes every time)
    pub volatility: f64,
    /// Fingerprint of the last written payload
    #[serde(skip)]
    pub last_fingerprint: Option<u64>,
}

impl UsageStat {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn recompute_volatility(&mut self) {
        self.volatility = ((self.misses + 1) as f64 / (self.total() + 1) as f64).min(1.0);
    }
}

/// Output of [`AdaptiveStrategy::analyze`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheAnalysis {
    pub service: String,
    pub hot_keys: Vec<String>,
    pub cold_keys: Vec<String>,
    pub volatile_keys: Vec<String>,
    pub stable_keys: Vec<String>,
    pub recommendations: Vec<String>,
}

type KeyStats = Arc<RwLock<HashMap<String, UsageStat>>>;

/// Per-key access tracking and TTL/priority advice
pub struct AdaptiveStrategy {
    params: AdaptiveParams,
    static_ttls: HashMap<String, u64>,
    services: DashMap<String, KeyStats>,
}

impl AdaptiveStrategy {
    /// Strategy over the static per-service TTLs (seconds)
    pub fn new(static_ttls: HashMap<String, u64>) -> Self {
        Self::with_params(static_ttls, AdaptiveParams::default())
    }

    pub fn with_params(static_ttls: HashMap<String, u64>, params: AdaptiveParams) -> Self {
        Self {
            params,
            static_ttls,
            services: DashMap::new(),
        }
    }

    pub fn params(&self) -> &AdaptiveParams {
        &self.params
    }

    fn static_ttl(&self, service: &str) -> u64 {
        self.static_ttls
            .get(service)
            .copied()
            .unwrap_or(self.params.fallback_ttl_seconds)
    }

    fn service_stats(&self, service: &str) -> KeyStats {
        if let Some(existing) = self.services.get(service) {
            return existing.value().clone();
        }
        self.services
            .entry(service.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn lookup(&self, service: &str, key: &str) -> Option<UsageStat> {
        let stats = self.services.get(service)?.value().clone();
        let guard = stats.read();
        guard.get(key).cloned()
    }

    /// Record a cache read.
    ///
    /// `data_changed` recomputes volatility as `(misses + 1) / (total + 1)`.
    pub fn record_access(&self, service: &str, key: &str, hit: bool, data_changed: bool, now_ms: u64) {
        let stats = self.service_stats(service);
        let mut guard = stats.write();
        let stat = guard.entry(key.to_string()).or_default();

        if hit {
            stat.hits += 1;
        } else {
            stat.misses += 1;
        }

        if let Some(last) = stat.last_access_ms {
            stat.intervals_ms.push_back(now_ms.saturating_sub(last));
            while stat.intervals_ms.len() > self.params.interval_window {
                stat.intervals_ms.pop_front();
            }
            stat.avg_interval_ms =
                stat.intervals_ms.iter().sum::<u64>() as f64 / stat.intervals_ms.len() as f64;
        }

        if data_changed {
            stat.recompute_volatility();
        }

        stat.last_access_ms = Some(now_ms);
    }

    /// Record a write of a payload with the given fingerprint.
    ///
    /// A rewrite with a different payload counts as a data change; an
    /// identical one lets volatility decay. Returns whether data changed.
    pub fn record_write(&self, service: &str, key: &str, fingerprint: u64) -> bool {
        let stats = self.service_stats(service);
        let mut guard = stats.write();
        let stat = guard.entry(key.to_string()).or_default();

        let changed = match stat.last_fingerprint {
            Some(previous) if previous != fingerprint => {
                stat.recompute_volatility();
                true
            }
            Some(_) => {
                stat.volatility *= self.params.volatility_decay;
                false
            }
            None => false,
        };
        stat.last_fingerprint = Some(fingerprint);
        changed
    }

    /// Usage statistics for a key
    pub fn usage(&self, service: &str, key: &str) -> Option<UsageStat> {
        self.lookup(service, key)
    }

    /// Recommended TTL in seconds
    pub fn recommended_ttl(&self, service: &str, key: &str) -> u64 {
        let static_ttl = self.static_ttl(service);
        match self.lookup(service, key) {
            Some(stat) if stat.total() >= self.params.min_accesses => {
                self.score_ttl(&stat, static_ttl)
            }
            _ => static_ttl,
        }
    }

    fn score_ttl(&self, stat: &UsageStat, static_ttl: u64) -> u64 {
        let p = &self.params;
        let static_secs = static_ttl as f64;

        let mut ttl = static_secs;
        if stat.avg_interval_ms > 0.0 {
            // Interval stays in ms against a cap in seconds
            ttl = (stat.avg_interval_ms * p.interval_ttl_share).min(static_secs * p.base_ttl_factor);
        }

        if stat.volatility > p.volatile_above {
            ttl *= 0.5;
        } else if stat.volatility < p.stable_below {
            ttl *= 1.5;
        }

        let hit_rate = stat.hit_rate();
        if hit_rate > p.high_hit_rate {
            ttl *= 1.2;
        } else if hit_rate < p.low_hit_rate {
            ttl *= 0.8;
        }

        let max_ttl = static_secs * p.max_ttl_factor;
        let clamped = ttl.round().min(max_ttl).max(p.min_ttl_seconds as f64);
        clamped as u64
    }

    /// Eviction priority in `0..=10`; higher survives longer
    pub fn priority(&self, service: &str, key: &str, now_ms: u64) -> u8 {
        match self.lookup(service, key) {
            Some(stat) if stat.total() >= self.params.min_accesses => {
                self.score_priority(&stat, now_ms)
            }
            _ => 5,
        }
    }

    fn score_priority(&self, stat: &UsageStat, now_ms: u64) -> u8 {
        let p = &self.params;
        let mut priority = 5.0_f64;

        if stat.avg_interval_ms > 0.0 {
            priority += (5.0 * (HOUR_MS as f64 / stat.avg_interval_ms)).min(5.0);
        }

        let hit_rate = stat.hit_rate();
        if hit_rate > p.high_hit_rate {
            priority += 2.0;
        } else if hit_rate < p.low_hit_rate {
            priority -= 2.0;
        }

        if let Some(last) = stat.last_access_ms {
            let idle = now_ms.saturating_sub(last);
            if idle < HOUR_MS {
                priority += 1.0;
            } else if idle > DAY_MS {
                priority -= 2.0;
            }
        }

        priority.round().clamp(0.0, 10.0) as u8
    }

    /// Partition a service's keys into hot/cold/volatile/stable buckets and
    /// produce advice. Never mutates cache state.
    pub fn analyze(&self, service: &str) -> CacheAnalysis {
        let mut analysis = CacheAnalysis {
            service: service.to_string(),
            ..Default::default()
        };

        let snapshot: Vec<(String, UsageStat)> = match self.services.get(service) {
            Some(stats) => {
                let stats = stats.value().clone();
                let guard = stats.read();
                guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            None => Vec::new(),
        };

        if snapshot.is_empty() {
            analysis
                .recommendations
                .push("not enough cache usage data to analyze".to_string());
            return analysis;
        }

        let bucket = ((snapshot.len() as f64 * self.params.bucket_share).ceil() as usize).max(1);

        let mut by_frequency: Vec<&(String, UsageStat)> = snapshot.iter().collect();
        by_frequency.sort_by(|a, b| b.1.total().cmp(&a.1.total()).then_with(|| a.0.cmp(&b.0)));

        let mut by_volatility: Vec<&(String, UsageStat)> = snapshot.iter().collect();
        by_volatility.sort_by(|a, b| {
            b.1.volatility
                .total_cmp(&a.1.volatility)
                .then_with(|| a.0.cmp(&b.0))
        });

        let names = |items: &[&(String, UsageStat)]| -> Vec<String> {
            items.iter().map(|(k, _)| k.clone()).collect()
        };
        let n = snapshot.len();
        analysis.hot_keys = names(&by_frequency[..bucket]);
        analysis.cold_keys = names(&by_frequency[n - bucket..]);
        analysis.volatile_keys = names(&by_volatility[..bucket]);
        analysis.stable_keys = names(&by_volatility[n - bucket..]);

        let static_ttl = self.static_ttl(service);
        let grow: Vec<String> = by_frequency[..bucket]
            .iter()
            .filter(|(_, stat)| {
                let recommended = if stat.total() >= self.params.min_accesses {
                    self.score_ttl(stat, static_ttl)
                } else {
                    static_ttl
                };
                recommended as f64 > static_ttl as f64 * 1.5
            })
            .map(|(k, _)| k.clone())
            .collect();
        if !grow.is_empty() {
            analysis
                .recommendations
                .push(format!("increase TTL for hot keys: {}", grow.join(", ")));
        }
        analysis.recommendations.push(format!(
            "reduce TTL for volatile keys: {}",
            analysis.volatile_keys.join(", ")
        ));
        analysis.recommendations.push(format!(
            "increase TTL for stable keys: {}",
            analysis.stable_keys.join(", ")
        ));

        let avg_hit_rate =
            snapshot.iter().map(|(_, s)| s.hit_rate()).sum::<f64>() / snapshot.len() as f64;
        if avg_hit_rate < 0.5 {
            analysis.recommendations.push(format!(
                "{} hit rate is low ({:.1}%), consider adjusting the caching strategy",
                service,
                avg_hit_rate * 100.0
            ));
        } else if avg_hit_rate > 0.8 {
            analysis.recommendations.push(format!(
                "{} hit rate is healthy ({:.1}%), consider increasing cache capacity",
                service,
                avg_hit_rate * 100.0
            ));
        }

        analysis
    }

    /// Analyze every observed service and log the advice
    pub fn analyze_all(&self) -> Vec<CacheAnalysis> {
        let mut services: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        services.sort();

        services
            .iter()
            .map(|service| {
                let analysis = self.analyze(service);
                info!(
                    service = %service,
                    hot = analysis.hot_keys.len(),
                    cold = analysis.cold_keys.len(),
                    volatile = analysis.volatile_keys.len(),
                    stable = analysis.stable_keys.len(),
                    "Adaptive cache analysis"
                );
                for recommendation in &analysis.recommendations {
                    info!(service = %service, "{}", recommendation);
                }
                analysis
            })
            .collect()
    }

    /// Drop statistics for keys idle longer than `max_idle_ms`
    pub fn prune_idle(&self, now_ms: u64, max_idle_ms: u64) -> usize {
        let services: Vec<KeyStats> = self.services.iter().map(|e| e.value().clone()).collect();
        let mut pruned = 0;
        for stats in services {
            let mut guard = stats.write();
            let before = guard.len();
            guard.retain(|_, stat| {
                stat.last_access_ms
                    .map(|last| now_ms.saturating_sub(last) <= max_idle_ms)
                    .unwrap_or(true)
            });
            pruned += before - guard.len();
        }
        pruned
    }
}

impl PriorityOracle for AdaptiveStrategy {
    fn priority(&self, service: &str, key: &str, now_ms: u64) -> u8 {
        AdaptiveStrategy::priority(self, service, key, now_ms)
    }
}
