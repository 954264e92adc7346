//! Redis-backed cache storage (feature `redis`)
//!
//! Entries are written with `SET .. EX ttl`, so Redis expires them natively;
//! reads still run the lazy check against the envelope's own timestamp in
//! case the server clock drifts. Capacity is left to the server's
//! `maxmemory` policy.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use super::backend::{BackendStats, CacheBackend, Lookup, Partition, Removed, SetOutcome};
use super::entry::CacheEntry;
use crate::error::{Error, Result};

const DELETE_BATCH: usize = 500;

/// Redis cache backend
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Redis cache backend connected");
        Ok(Self { conn })
    }

    /// Wrap an existing connection
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn tracks_size(&self) -> bool {
        false
    }

    async fn get(&self, _partition: Partition<'_>, key: &str, now_ms: u64) -> Result<Lookup> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(key).await?;
        let Some(raw) = raw else {
            return Ok(Lookup::Miss);
        };

        let entry = CacheEntry::decode(&raw)?;
        if entry.is_expired(now_ms) {
            conn.del::<_, ()>(key).await?;
            return Ok(Lookup::Expired {
                size_bytes: entry.size_bytes,
            });
        }
        Ok(Lookup::Hit(entry))
    }

    async fn set(
        &self,
        _partition: Partition<'_>,
        key: &str,
        entry: CacheEntry,
        _now_ms: u64,
    ) -> Result<SetOutcome> {
        let mut conn = self.conn.clone();
        let ttl = entry.ttl_seconds.max(1);
        conn.set_ex::<_, _, ()>(key, entry.encode().to_vec(), ttl)
            .await?;
        Ok(SetOutcome::default())
    }

    async fn delete(&self, _partition: Partition<'_>, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;
        // Size of the removed value is not known without a prior read
        Ok((removed > 0).then_some(0))
    }

    async fn clear(&self, partition: Partition<'_>) -> Result<Removed> {
        if partition.prefix.is_empty() {
            return Err(Error::CacheBackend(format!(
                "refusing to clear service '{}' with an empty key prefix",
                partition.service
            )));
        }

        let mut conn = self.conn.clone();
        let pattern = format!("{}*", partition.prefix);
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        let mut removed = Removed {
            service: partition.service.to_string(),
            ..Default::default()
        };
        for chunk in keys.chunks(DELETE_BATCH) {
            let n: u64 = conn.del(chunk).await?;
            removed.entries += n;
        }
        debug!(service = partition.service, removed = removed.entries, "Cleared Redis keys");
        Ok(removed)
    }

    async fn sweep_expired(&self, _now_ms: u64) -> Result<Vec<Removed>> {
        // Redis expires keys itself
        Ok(Vec::new())
    }

    async fn stats(&self) -> Result<BackendStats> {
        let mut conn = self.conn.clone();
        let keys: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(BackendStats { keys, bytes: 0 })
    }
}
