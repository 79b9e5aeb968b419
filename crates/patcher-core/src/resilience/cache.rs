//! TTL + LRU response cache.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use super::backend::BackendResponse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// Zero disables caching.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            capacity: 1000,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: BackendResponse,
    created_at: Instant,
    last_access: Instant,
    expires_at: Instant,
    /// Recency stamp; the smallest live stamp is the LRU victim.
    tick: u64,
}

/// Responses keyed by request fingerprint.
///
/// An entry inserted at `T` is served through `T + ttl` and is gone after.
/// When full, the least recently accessed entry is evicted.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            capacity: config.capacity,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
        }
    }

    fn stamp(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    pub fn get(&mut self, key: &str, now: Instant) -> Option<BackendResponse> {
        let expired = now > self.entries.get(key)?.expires_at;
        if expired {
            self.remove(key);
            return None;
        }
        let tick = self.stamp();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        entry.last_access = now;
        self.recency.insert(tick, key.to_string());
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, key: String, value: BackendResponse, now: Instant) {
        if self.capacity == 0 {
            return;
        }
        self.remove(&key);
        self.purge_expired(now);
        while self.entries.len() >= self.capacity {
            let Some((_, victim)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&victim);
            tracing::trace!(key = %victim, "evicted least recently used response");
        }
        let tick = self.stamp();
        self.recency.insert(tick, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                last_access: now,
                expires_at: now + self.ttl,
                tick,
            },
        );
    }

    /// Drop every entry whose TTL has elapsed.
    pub fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now > e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    /// Age of an entry, if present.
    pub fn age(&self, key: &str, now: Instant) -> Option<Duration> {
        self.entries.get(key).map(|e| now.saturating_duration_since(e.created_at))
    }

    /// Time since the entry was last served, if present.
    pub fn idle(&self, key: &str, now: Instant) -> Option<Duration> {
        self.entries.get(key).map(|e| now.saturating_duration_since(e.last_access))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
