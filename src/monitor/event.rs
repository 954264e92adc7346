//! Recorded upstream calls

use serde::{Deserialize, Serialize};

use super::ring::Timestamped;

/// One completed upstream API call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEvent {
    pub service: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    /// Completion time (epoch ms)
    pub timestamp_ms: u64,
    /// Served from cache
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiEvent {
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        status_code: u16,
        response_time_ms: f64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            method: "GET".to_string(),
            status_code,
            response_time_ms,
            timestamp_ms,
            cache_hit: false,
            error: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Any 4xx or 5xx status
    #[inline]
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

impl Timestamped for ApiEvent {
    fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }
}
