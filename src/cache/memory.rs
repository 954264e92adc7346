//! In-process cache backend
//!
//! # Design
//!
//! - One partition per service, each behind its own `parking_lot::Mutex`,
//!   held in a `DashMap` so services never contend with each other
//! - Lookup, lazy expiry and eviction for a key all happen under the
//!   partition lock, so a read that finds an expired entry removes it
//!   exactly once
//! - Eviction picks an already-expired entry if there is one, otherwise the
//!   lowest (priority, last access, touch sequence)
//! - The sweep collects expired keys under a short lock, then removes them
//!   one by one, re-checking each

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::backend::{
    BackendStats, CacheBackend, Evicted, Lookup, Partition, PriorityOracle, Removed, SetOutcome,
    UniformPriority,
};
use super::entry::CacheEntry;
use crate::error::Result;

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    last_access_ms: u64,
    /// Logical access clock; breaks ties between accesses in the same millisecond
    touch: u64,
}

#[derive(Debug, Default)]
struct PartitionState {
    slots: HashMap<String, Slot>,
    bytes: u64,
}

impl PartitionState {
    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.bytes = self.bytes.saturating_sub(slot.entry.size_bytes);
        Some(slot)
    }
}

/// In-process backend
pub struct InMemoryBackend {
    partitions: DashMap<String, Arc<Mutex<PartitionState>>>,
    priorities: Arc<dyn PriorityOracle>,
    touch: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Backend with pure LRU eviction
    pub fn new() -> Self {
        Self::with_priorities(Arc::new(UniformPriority))
    }

    /// Backend consulting `priorities` before recency when evicting
    pub fn with_priorities(priorities: Arc<dyn PriorityOracle>) -> Self {
        Self {
            partitions: DashMap::new(),
            priorities,
            touch: AtomicU64::new(0),
        }
    }

    fn partition(&self, service: &str) -> Arc<Mutex<PartitionState>> {
        if let Some(existing) = self.partitions.get(service) {
            return existing.clone();
        }
        self.partitions
            .entry(service.to_string())
            .or_default()
            .clone()
    }

    fn next_touch(&self) -> u64 {
        self.touch.fetch_add(1, Ordering::Relaxed)
    }

    /// Entries held for a service
    pub fn len(&self, service: &str) -> usize {
        self.partitions
            .get(service)
            .map(|p| p.lock().slots.len())
            .unwrap_or(0)
    }

    /// Whether no partition holds anything
    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(|p| p.lock().slots.is_empty())
    }

    /// Whether a key is present (expired or not), without touching it
    pub fn contains(&self, service: &str, key: &str) -> bool {
        self.partitions
            .get(service)
            .map(|p| p.lock().slots.contains_key(key))
            .unwrap_or(false)
    }

    fn pick_victim(&self, service: &str, state: &PartitionState, now_ms: u64) -> Option<(String, bool)> {
        if let Some((key, _)) = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now_ms))
            .min_by_key(|(_, slot)| slot.touch)
        {
            return Some((key.clone(), true));
        }

        state
            .slots
            .iter()
            .min_by_key(|(key, slot)| {
                (
                    self.priorities.priority(service, key, now_ms),
                    slot.last_access_ms,
                    slot.touch,
                )
            })
            .map(|(key, _)| (key.clone(), false))
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, partition: Partition<'_>, key: &str, now_ms: u64) -> Result<Lookup> {
        let part = self.partition(partition.service);
        let mut state = part.lock();

        match state.slots.get_mut(key) {
            None => return Ok(Lookup::Miss),
            Some(slot) if !slot.entry.is_expired(now_ms) => {
                slot.last_access_ms = now_ms;
                slot.touch = self.next_touch();
                return Ok(Lookup::Hit(slot.entry.clone()));
            }
            Some(_) => {}
        }

        let size_bytes = state
            .remove(key)
            .map(|slot| slot.entry.size_bytes)
            .unwrap_or(0);
        Ok(Lookup::Expired { size_bytes })
    }

    async fn set(
        &self,
        partition: Partition<'_>,
        key: &str,
        entry: CacheEntry,
        now_ms: u64,
    ) -> Result<SetOutcome> {
        let part = self.partition(partition.service);
        let mut state = part.lock();
        let touch = self.next_touch();
        let size = entry.size_bytes;

        if let Some(previous) = state.remove(key) {
            state.slots.insert(
                key.to_string(),
                Slot {
                    entry,
                    last_access_ms: now_ms,
                    touch,
                },
            );
            state.bytes += size;
            return Ok(SetOutcome {
                replaced_size: Some(previous.entry.size_bytes),
                evicted: Vec::new(),
            });
        }

        let mut evicted = Vec::new();
        while state.slots.len() >= partition.max_entries.max(1) {
            let Some((victim, expired)) = self.pick_victim(partition.service, &state, now_ms)
            else {
                break;
            };
            if let Some(slot) = state.remove(&victim) {
                tracing::debug!(
                    service = partition.service,
                    key = %victim,
                    expired,
                    "Evicted cache entry"
                );
                evicted.push(Evicted {
                    key: victim,
                    size_bytes: slot.entry.size_bytes,
                    expired,
                });
            }
        }

        state.slots.insert(
            key.to_string(),
            Slot {
                entry,
                last_access_ms: now_ms,
                touch,
            },
        );
        state.bytes += size;

        Ok(SetOutcome {
            replaced_size: None,
            evicted,
        })
    }

    async fn delete(&self, partition: Partition<'_>, key: &str) -> Result<Option<u64>> {
        let Some(part) = self.partitions.get(partition.service).map(|p| p.clone()) else {
            return Ok(None);
        };
        let removed = part.lock().remove(key);
        Ok(removed.map(|slot| slot.entry.size_bytes))
    }

    async fn clear(&self, partition: Partition<'_>) -> Result<Removed> {
        let mut removed = Removed {
            service: partition.service.to_string(),
            ..Default::default()
        };
        if let Some(part) = self.partitions.get(partition.service).map(|p| p.clone()) {
            let mut state = part.lock();
            let taken = std::mem::take(&mut *state);
            removed.entries = taken.slots.len() as u64;
            removed.bytes = taken.bytes;
        }
        Ok(removed)
    }

    async fn sweep_expired(&self, now_ms: u64) -> Result<Vec<Removed>> {
        let partitions: Vec<(String, Arc<Mutex<PartitionState>>)> = self
            .partitions
            .iter()
            .map(|p| (p.key().clone(), p.value().clone()))
            .collect();

        let mut report = Vec::new();
        for (service, part) in partitions {
            let candidates: Vec<String> = {
                let state = part.lock();
                state
                    .slots
                    .iter()
                    .filter(|(_, slot)| slot.entry.is_expired(now_ms))
                    .map(|(key, _)| key.clone())
                    .collect()
            };
            if candidates.is_empty() {
                continue;
            }

            let mut removed = Removed {
                service,
                ..Default::default()
            };
            for key in candidates {
                let mut state = part.lock();
                // Re-check: the key may have been rewritten since collection
                let still_expired = state
                    .slots
                    .get(&key)
                    .map(|slot| slot.entry.is_expired(now_ms))
                    .unwrap_or(false);
                if still_expired {
                    if let Some(slot) = state.remove(&key) {
                        removed.entries += 1;
                        removed.bytes += slot.entry.size_bytes;
                    }
                }
            }
            report.push(removed);
        }
        Ok(report)
    }

    async fn stats(&self) -> Result<BackendStats> {
        let mut stats = BackendStats::default();
        for part in self.partitions.iter() {
            let state = part.lock();
            stats.keys += state.slots.len() as u64;
            stats.bytes += state.bytes;
        }
        Ok(stats)
    }
}
