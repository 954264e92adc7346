//! Health states and upstream error kinds

use std::fmt;

use serde::{Deserialize, Serialize};

/// Degradation level of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceHealth {
    /// Every feature available
    Healthy,
    /// Serving a reduced response
    Degraded,
    /// Only core functionality
    Critical,
    /// Not serving at all
    Unavailable,
}

impl ServiceHealth {
    /// Full-feature path allowed
    pub fn is_healthy(&self) -> bool {
        *self == ServiceHealth::Healthy
    }

    /// Some response (full or reduced) can still be produced
    pub fn is_operational(&self) -> bool {
        !matches!(self, ServiceHealth::Unavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceHealth::Healthy => "HEALTHY",
            ServiceHealth::Degraded => "DEGRADED",
            ServiceHealth::Critical => "CRITICAL",
            ServiceHealth::Unavailable => "UNAVAILABLE",
        }
    }
}

impl fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a failed upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Client side
    Validation,
    Authentication,
    Authorization,
    RateLimit,
    Request,
    NotFound,

    // Server side
    Server,
    #[serde(alias = "database")]
    Storage,
    Cache,
    ExternalApi,
    Timeout,
    Resource,

    // Network
    Network,
    Dns,

    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 15] = [
        ErrorKind::Validation,
        ErrorKind::Authentication,
        ErrorKind::Authorization,
        ErrorKind::RateLimit,
        ErrorKind::Request,
        ErrorKind::NotFound,
        ErrorKind::Server,
        ErrorKind::Storage,
        ErrorKind::Cache,
        ErrorKind::ExternalApi,
        ErrorKind::Timeout,
        ErrorKind::Resource,
        ErrorKind::Network,
        ErrorKind::Dns,
        ErrorKind::Unknown,
    ];

    /// Faults that degrade a service on first occurrence
    pub fn is_severe(&self) -> bool {
        matches!(
            self,
            ErrorKind::Storage | ErrorKind::Resource | ErrorKind::Server
        )
    }

    /// Whether the same call may succeed if repeated
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::Dns
                | ErrorKind::ExternalApi
                | ErrorKind::RateLimit
                | ErrorKind::Resource
        )
    }

    /// HTTP status a caller should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation | ErrorKind::Request => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::Authorization => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Timeout => 408,
            ErrorKind::RateLimit => 429,
            ErrorKind::ExternalApi | ErrorKind::Network | ErrorKind::Dns => 502,
            ErrorKind::Resource => 503,
            ErrorKind::Server | ErrorKind::Storage | ErrorKind::Cache | ErrorKind::Unknown => 500,
        }
    }

    /// Kind for an upstream HTTP status
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => ErrorKind::Validation,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            404 => ErrorKind::NotFound,
            408 | 504 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            402..=499 => ErrorKind::Request,
            502 => ErrorKind::ExternalApi,
            503 => ErrorKind::Resource,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Request => "request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Server => "server",
            ErrorKind::Storage => "storage",
            ErrorKind::Cache => "cache",
            ErrorKind::ExternalApi => "external_api",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Resource => "resource",
            ErrorKind::Network => "network",
            ErrorKind::Dns => "dns",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one service's degradation state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub health: ServiceHealth,
    /// Errors since the last reset
    pub error_count: u32,
    pub error_threshold: u32,
    pub last_error: Option<ErrorKind>,
    pub last_error_at_ms: Option<u64>,
    pub degraded_since_ms: Option<u64>,
    pub recovery_attempts: u32,
    pub next_recovery_at_ms: Option<u64>,
}

impl ServiceStatus {
    pub(crate) fn new(name: &str, error_threshold: u32) -> Self {
        Self {
            name: name.to_string(),
            health: ServiceHealth::Healthy,
            error_count: 0,
            error_threshold,
            last_error: None,
            last_error_at_ms: None,
            degraded_since_ms: None,
            recovery_attempts: 0,
            next_recovery_at_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&ServiceHealth::Degraded).unwrap(), "\"DEGRADED\"");
        assert_eq!(ServiceHealth::Unavailable.to_string(), "UNAVAILABLE");
        assert!(ServiceHealth::Critical.is_operational());
        assert!(!ServiceHealth::Unavailable.is_operational());
    }

    #[test]
    fn test_severe_kinds() {
        let severe: Vec<_> = ErrorKind::ALL.iter().filter(|k| k.is_severe()).collect();
        assert_eq!(severe, vec![&ErrorKind::Server, &ErrorKind::Storage, &ErrorKind::Resource]);
    }

    #[test]
    fn test_kind_parsing() {
        let kind: ErrorKind = serde_json::from_str("\"database\"").unwrap();
        assert_eq!(kind, ErrorKind::Storage);
        let kind: ErrorKind = serde_json::from_str("\"external_api\"").unwrap();
        assert_eq!(kind, ErrorKind::ExternalApi);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_status(418), ErrorKind::Request);
        assert_eq!(ErrorKind::from_status(504), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from_status(500), ErrorKind::Server);
        assert_eq!(ErrorKind::RateLimit.http_status(), 429);
        assert_eq!(ErrorKind::Timeout.http_status(), 408);
        for kind in ErrorKind::ALL {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
    }
}
