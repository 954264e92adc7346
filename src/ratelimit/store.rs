//! Window counter storage
//!
//! A counter is identified by the limiter key plus the start of its fixed
//! window. Increments are atomic per counter: the in-process store does the
//! read-modify-write under the owning `DashMap` shard lock, Redis uses
//! `INCR` + `PEXPIRE` in a `MULTI` block.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Atomic fixed-window counters
#[async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Add one to the counter of `key` for the window starting at
    /// `window_start_ms` and return the new count
    async fn increment(&self, key: &str, window_start_ms: u64, window_ms: u64) -> Result<u64>;

    /// Drop counters whose window has closed; returns how many were dropped
    async fn purge_expired(&self, _now_ms: u64) -> Result<usize> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window_start_ms: u64,
    reset_at_ms: u64,
    count: u64,
}

/// In-process counters
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, WindowCounter>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live counters
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn increment(&self, key: &str, window_start_ms: u64, window_ms: u64) -> Result<u64> {
        let fresh = WindowCounter {
            window_start_ms,
            reset_at_ms: window_start_ms.saturating_add(window_ms),
            count: 1,
        };

        let mut counter = self.counters.entry(key.to_string()).or_insert(WindowCounter {
            count: 0,
            ..fresh
        });
        if counter.window_start_ms != window_start_ms {
            *counter = WindowCounter { count: 0, ..fresh };
        }
        counter.count += 1;
        Ok(counter.count)
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<usize> {
        let before = self.counters.len();
        self.counters.retain(|_, c| c.reset_at_ms > now_ms);
        Ok(before.saturating_sub(self.counters.len()))
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisCounterStore;

#[cfg(feature = "redis")]
mod redis_store {
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use tracing::info;

    use super::CounterStore;
    use crate::error::Result;

    /// Counters kept in Redis, one key per window, expiring with it
    #[derive(Clone)]
    pub struct RedisCounterStore {
        conn: ConnectionManager,
    }

    impl RedisCounterStore {
        pub async fn connect(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)?;
            let conn = ConnectionManager::new(client).await?;
            info!(url = %url, "Redis rate-limit store connected");
            Ok(Self { conn })
        }

        pub fn from_connection(conn: ConnectionManager) -> Self {
            Self { conn }
        }
    }

    #[async_trait]
    impl CounterStore for RedisCounterStore {
        fn name(&self) -> &'static str {
            "redis"
        }

        async fn increment(&self, key: &str, window_start_ms: u64, window_ms: u64) -> Result<u64> {
            let mut conn = self.conn.clone();
            let window_key = format!("{}:{}", key, window_start_ms);
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .cmd("INCR")
                .arg(&window_key)
                .cmd("PEXPIRE")
                .arg(&window_key)
                .arg(window_ms)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_counts_within_window() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.increment("k", 0, 1000).await.unwrap(), 1);
        assert_eq!(store.increment("k", 0, 1000).await.unwrap(), 2);
        assert_eq!(store.increment("other", 0, 1000).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_new_window_resets() {
        let store = InMemoryCounterStore::new();
        store.increment("k", 0, 1000).await.unwrap();
        store.increment("k", 0, 1000).await.unwrap();
        assert_eq!(store.increment("k", 1000, 1000).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_closed_windows() {
        let store = InMemoryCounterStore::new();
        store.increment("a", 0, 1000).await.unwrap();
        store.increment("b", 1000, 1000).await.unwrap();

        assert_eq!(store.purge_expired(1000).await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_expired(2000).await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let store = Arc::new(InMemoryCounterStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store.increment("k", 0, 60_000).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.increment("k", 0, 60_000).await.unwrap(), 801);
    }
}
