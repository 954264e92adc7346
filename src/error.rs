//! Error types for RelayGate

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in RelayGate
///
/// Hot-path operations (cache reads, rate-limit checks, health transitions)
/// never surface these to callers; they are counted and converted to a safe
/// default. Construction, configuration and backend plumbing return them.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML configuration could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Service was never registered
    #[error("Service not registered: {0}")]
    UnknownService(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Cache backend error
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    /// Cache backend call exceeded its deadline
    #[error("Cache backend timed out after {timeout_ms}ms")]
    BackendTimeout { timeout_ms: u64 },

    /// Value (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Rate Limiting Errors
    // =========================================================================
    /// Counter store error
    #[error("Rate limit backend error: {0}")]
    RateLimitBackend(String),

    // =========================================================================
    // Observability Errors
    // =========================================================================
    /// Prometheus registry or encoding error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // External Store Errors
    // =========================================================================
    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
