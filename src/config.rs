//! Static configuration tables
//!
//! Configuration is loaded once at process start from YAML (or the built-in
//! tables), merged over defaults by [`RelayConfig::resolve`] and validated.
//! Nothing here is reconfigured at runtime.
//!
//! ```yaml
//! defaults:
//!   rate_limit: { max_requests: 50, window_ms: 60000 }
//! services:
//!   weather:
//!     cache: { ttl_seconds: 300, max_entries: 1000, compression_enabled: true }
//!     rate_limit: { max_requests: 30 }
//!     thresholds: { response_time_warning_ms: 1500, response_time_critical_ms: 3000 }
//!   qrcode:
//!     fallback_available: false
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

// =============================================================================
// Resolved tables
// =============================================================================

/// Per-service cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CacheConfig {
    /// Entry lifetime in seconds
    pub ttl_seconds: u64,
    /// Maximum entries held for the service
    pub max_entries: usize,
    /// Prefix prepended to every derived key
    pub key_prefix: String,
    /// Compress values before storage
    pub compression_enabled: bool,
    /// Count hits/misses/sets for the service
    pub metrics_enabled: bool,
}

impl CacheConfig {
    /// Default table for a service, keyed under `cache:<service>:`
    pub fn for_service(service: &str) -> Self {
        Self {
            ttl_seconds: 300,
            max_entries: 1000,
            key_prefix: format!("cache:{}:", service),
            compression_enabled: false,
            metrics_enabled: true,
        }
    }

    /// TTL as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Fixed-window rate limit table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RateLimitConfig {
    /// Requests admitted per window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Counter key prefix
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 50,
            window_ms: 60_000,
            key_prefix: "ratelimit:".to_string(),
        }
    }
}

/// Monitor thresholds for one service
///
/// Rates are fractions in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Thresholds {
    pub response_time_warning_ms: f64,
    pub response_time_critical_ms: f64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    pub cache_hit_rate_floor: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            response_time_warning_ms: 2000.0,
            response_time_critical_ms: 5000.0,
            error_rate_warning: 0.05,
            error_rate_critical: 0.10,
            cache_hit_rate_floor: 0.60,
        }
    }
}

/// Backend selection and request-path deadlines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BackendConfig {
    /// Redis URL; when absent the in-process backends are used
    pub redis_url: Option<String>,
    /// Deadline for a single backend call on the request path
    pub timeout_ms: u64,
    /// Values smaller than this are stored uncompressed
    pub compression_min_bytes: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeout_ms: 250,
            compression_min_bytes: 1024,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Degradation state machine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HealthTuning {
    pub recovery_interval_ms: u64,
    pub max_recovery_attempts: u32,
    pub max_backoff_multiplier: u32,
    pub error_window_ms: u64,
    pub critical_error_threshold: u32,
    pub default_error_threshold: u32,
}

impl Default for HealthTuning {
    fn default() -> Self {
        Self {
            recovery_interval_ms: 60_000,
            max_recovery_attempts: 3,
            max_backoff_multiplier: 10,
            error_window_ms: 5 * 60_000,
            critical_error_threshold: 3,
            default_error_threshold: 5,
        }
    }
}

/// API monitor windows and retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MonitorTuning {
    pub event_retention_ms: u64,
    /// Ring capacity per service
    pub max_events_per_service: usize,
    pub alert_window_ms: u64,
    pub alert_min_samples: usize,
    pub alert_error_rate: f64,
    pub alert_avg_response_ms: f64,
    pub alert_dedupe_ms: u64,
    pub alert_retention_ms: u64,
    pub active_alert_limit: usize,
}

impl Default for MonitorTuning {
    fn default() -> Self {
        Self {
            event_retention_ms: 24 * 3_600_000,
            max_events_per_service: 10_000,
            alert_window_ms: 5 * 60_000,
            alert_min_samples: 10,
            alert_error_rate: 0.10,
            alert_avg_response_ms: 5000.0,
            alert_dedupe_ms: 10 * 60_000,
            alert_retention_ms: 7 * 24 * 3_600_000,
            active_alert_limit: 20,
        }
    }
}

/// Periodic maintenance intervals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub cache_sweep_secs: u64,
    pub health_sweep_secs: u64,
    pub adaptive_analysis_secs: u64,
    pub cleanup_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cache_sweep_secs: 300,
            health_sweep_secs: 60,
            adaptive_analysis_secs: 1800,
            cleanup_secs: 3600,
        }
    }
}

// =============================================================================
// File format (overrides)
// =============================================================================

/// Partial cache table as written in the config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CacheOverride {
    pub ttl_seconds: Option<u64>,
    pub max_entries: Option<usize>,
    pub key_prefix: Option<String>,
    pub compression_enabled: Option<bool>,
    pub metrics_enabled: Option<bool>,
}

/// Partial rate limit table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RateLimitOverride {
    pub max_requests: Option<u32>,
    pub window_ms: Option<u64>,
    pub key_prefix: Option<String>,
}

/// Partial threshold table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ThresholdsOverride {
    pub response_time_warning_ms: Option<f64>,
    pub response_time_critical_ms: Option<f64>,
    pub error_rate_warning: Option<f64>,
    pub error_rate_critical: Option<f64>,
    pub cache_hit_rate_floor: Option<f64>,
}

/// One service entry in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ServiceSpec {
    /// Cache table; services without one are never cached
    pub cache: Option<CacheOverride>,
    pub rate_limit: Option<RateLimitOverride>,
    pub thresholds: Option<ThresholdsOverride>,
    /// Critical services degrade after fewer errors and drag dependents down
    pub critical: bool,
    pub fallback_available: bool,
    /// Services this one calls through
    pub dependencies: Vec<String>,
    /// 1 (highest) to 10
    pub priority: u8,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            cache: None,
            rate_limit: None,
            thresholds: None,
            critical: false,
            fallback_available: true,
            dependencies: Vec::new(),
            priority: 5,
        }
    }
}

/// Global defaults every service table is merged over
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Defaults {
    pub cache: CacheOverride,
    pub rate_limit: RateLimitOverride,
    pub thresholds: ThresholdsOverride,
}

/// Root of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RelayConfig {
    pub defaults: Defaults,
    pub services: BTreeMap<String, ServiceSpec>,
    pub backend: BackendConfig,
    pub health: HealthTuning,
    pub monitor: MonitorTuning,
    pub maintenance: MaintenanceConfig,
    /// Retry policy for upstream loaders
    pub retry: RetryPolicy,
}

/// Fully merged table for one registered service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedService {
    pub name: String,
    pub cache: Option<CacheConfig>,
    pub rate_limit: RateLimitConfig,
    pub thresholds: Thresholds,
    pub critical: bool,
    pub fallback_available: bool,
    pub dependencies: Vec<String>,
    pub priority: u8,
}

/// Validated configuration handed to every component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    pub services: BTreeMap<String, ResolvedService>,
    pub default_rate_limit: RateLimitConfig,
    pub default_thresholds: Thresholds,
    pub backend: BackendConfig,
    pub health: HealthTuning,
    pub monitor: MonitorTuning,
    pub maintenance: MaintenanceConfig,
    pub retry: RetryPolicy,
}

impl ResolvedConfig {
    /// Service table lookup
    pub fn service(&self, name: &str) -> Option<&ResolvedService> {
        self.services.get(name)
    }

    /// Cache tables of every cacheable service
    pub fn cache_tables(&self) -> BTreeMap<String, CacheConfig> {
        self.services
            .values()
            .filter_map(|s| s.cache.clone().map(|c| (s.name.clone(), c)))
            .collect()
    }
}

// =============================================================================
// Merging
// =============================================================================

fn merge_cache(service: &str, defaults: &CacheOverride, over: &CacheOverride) -> CacheConfig {
    let base = CacheConfig::for_service(service);
    CacheConfig {
        ttl_seconds: over.ttl_seconds.or(defaults.ttl_seconds).unwrap_or(base.ttl_seconds),
        max_entries: over.max_entries.or(defaults.max_entries).unwrap_or(base.max_entries),
        // A default prefix shared by every service would collide, so it is never inherited
        key_prefix: over.key_prefix.clone().unwrap_or(base.key_prefix),
        compression_enabled: over
            .compression_enabled
            .or(defaults.compression_enabled)
            .unwrap_or(base.compression_enabled),
        metrics_enabled: over
            .metrics_enabled
            .or(defaults.metrics_enabled)
            .unwrap_or(base.metrics_enabled),
    }
}

fn merge_rate_limit(base: &RateLimitConfig, over: &RateLimitOverride) -> RateLimitConfig {
    RateLimitConfig {
        max_requests: over.max_requests.unwrap_or(base.max_requests),
        window_ms: over.window_ms.unwrap_or(base.window_ms),
        key_prefix: over.key_prefix.clone().unwrap_or_else(|| base.key_prefix.clone()),
    }
}

fn merge_thresholds(base: &Thresholds, over: &ThresholdsOverride) -> Thresholds {
    Thresholds {
        response_time_warning_ms: over
            .response_time_warning_ms
            .unwrap_or(base.response_time_warning_ms),
        response_time_critical_ms: over
            .response_time_critical_ms
            .unwrap_or(base.response_time_critical_ms),
        error_rate_warning: over.error_rate_warning.unwrap_or(base.error_rate_warning),
        error_rate_critical: over.error_rate_critical.unwrap_or(base.error_rate_critical),
        cache_hit_rate_floor: over.cache_hit_rate_floor.unwrap_or(base.cache_hit_rate_floor),
    }
}

impl RelayConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a YAML file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// JSON schema of the file format
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(RelayConfig);
        Ok(serde_json::to_string_pretty(&schema)?)
    }

    /// Built-in service tables used when no file is supplied
    pub fn builtin() -> Self {
        fn cached(ttl: u64, max: usize, compress: bool, rate: u32, priority: u8) -> ServiceSpec {
            ServiceSpec {
                cache: Some(CacheOverride {
                    ttl_seconds: Some(ttl),
                    max_entries: Some(max),
                    compression_enabled: Some(compress),
                    ..Default::default()
                }),
                rate_limit: Some(RateLimitOverride {
                    max_requests: Some(rate),
                    ..Default::default()
                }),
                priority,
                ..Default::default()
            }
        }

        fn uncached(priority: u8) -> ServiceSpec {
            ServiceSpec {
                priority,
                ..Default::default()
            }
        }

        let mut services = BTreeMap::new();

        let mut weather = cached(300, 1000, true, 30, 2);
        weather.thresholds = Some(ThresholdsOverride {
            response_time_warning_ms: Some(1500.0),
            response_time_critical_ms: Some(3000.0),
            ..Default::default()
        });
        services.insert("weather".to_string(), weather);
        services.insert("news".to_string(), cached(600, 500, true, 20, 3));
        services.insert("ipinfo".to_string(), cached(3600, 2000, false, 40, 4));
        services.insert("currency".to_string(), cached(180, 800, true, 30, 5));
        services.insert("stock".to_string(), uncached(5));
        services.insert("geocode".to_string(), uncached(6));

        let mut translate = uncached(4);
        translate.thresholds = Some(ThresholdsOverride {
            response_time_warning_ms: Some(3000.0),
            response_time_critical_ms: Some(6000.0),
            ..Default::default()
        });
        services.insert("translate".to_string(), translate);

        let mut qrcode = uncached(7);
        qrcode.fallback_available = false;
        services.insert("qrcode".to_string(), qrcode);

        Self {
            services,
            ..Default::default()
        }
    }

    /// Merge every service over the defaults and validate the result
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let default_rate_limit =
            merge_rate_limit(&RateLimitConfig::default(), &self.defaults.rate_limit);
        let default_thresholds =
            merge_thresholds(&Thresholds::default(), &self.defaults.thresholds);

        let mut services = BTreeMap::new();
        for (name, spec) in &self.services {
            let cache = spec
                .cache
                .as_ref()
                .map(|over| merge_cache(name, &self.defaults.cache, over));
            let rate_limit = spec
                .rate_limit
                .as_ref()
                .map(|over| merge_rate_limit(&default_rate_limit, over))
                .unwrap_or_else(|| default_rate_limit.clone());
            let thresholds = spec
                .thresholds
                .as_ref()
                .map(|over| merge_thresholds(&default_thresholds, over))
                .unwrap_or_else(|| default_thresholds.clone());

            services.insert(
                name.clone(),
                ResolvedService {
                    name: name.clone(),
                    cache,
                    rate_limit,
                    thresholds,
                    critical: spec.critical,
                    fallback_available: spec.fallback_available,
                    dependencies: spec.dependencies.clone(),
                    priority: spec.priority,
                },
            );
        }

        let resolved = ResolvedConfig {
            services,
            default_rate_limit,
            default_thresholds,
            backend: self.backend.clone(),
            health: self.health.clone(),
            monitor: self.monitor.clone(),
            maintenance: self.maintenance.clone(),
            retry: self.retry.clone(),
        };
        resolved.validate()?;
        Ok(resolved)
    }
}

impl ResolvedConfig {
    fn validate(&self) -> Result<()> {
        validate_rate_limit("defaults", &self.default_rate_limit)?;

        for service in self.services.values() {
            if let Some(cache) = &service.cache {
                if cache.ttl_seconds == 0 {
                    return Err(Error::Config(format!(
                        "service '{}': cache.ttl_seconds must be greater than 0",
                        service.name
                    )));
                }
                if cache.max_entries == 0 {
                    return Err(Error::Config(format!(
                        "service '{}': cache.max_entries must be greater than 0",
                        service.name
                    )));
                }
                if cache.key_prefix.is_empty() {
                    return Err(Error::Config(format!(
                        "service '{}': cache.key_prefix must not be empty",
                        service.name
                    )));
                }
            }

            validate_rate_limit(&service.name, &service.rate_limit)?;

            for dep in &service.dependencies {
                if dep == &service.name {
                    return Err(Error::Config(format!(
                        "service '{}' cannot depend on itself",
                        service.name
                    )));
                }
                if !self.services.contains_key(dep) {
                    return Err(Error::Config(format!(
                        "service '{}' depends on unregistered service '{}'",
                        service.name, dep
                    )));
                }
            }
        }

        if self.backend.timeout_ms == 0 {
            return Err(Error::Config("backend.timeout_ms must be greater than 0".into()));
        }
        if self.retry.factor < 1.0 {
            return Err(Error::Config("retry.factor must be at least 1.0".into()));
        }
        if self.health.recovery_interval_ms == 0 {
            return Err(Error::Config(
                "health.recovery_interval_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

fn validate_rate_limit(scope: &str, config: &RateLimitConfig) -> Result<()> {
    if config.max_requests == 0 {
        return Err(Error::Config(format!(
            "{}: rate_limit.max_requests must be greater than 0",
            scope
        )));
    }
    if config.window_ms == 0 {
        return Err(Error::Config(format!(
            "{}: rate_limit.window_ms must be greater than 0",
            scope
        )));
    }
    Ok(())
}
