//! In-memory cache index and its persisted form.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::store::KeyValueStore;

/// Store key holding the serialized index
pub const INDEX_STORE_KEY: &str = "@imgstash/index";

/// Store key holding the hit/miss counters
pub const STATS_STORE_KEY: &str = "@imgstash/stats";

/// Metadata for one cached remote image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// URL (or opaque identifier) the UI asked for
    pub remote_reference: String,
    /// Materialized file inside the cache directory
    pub local_path: PathBuf,
    /// First download time
    pub created_at: DateTime<Utc>,
    /// Last hit or write; drives LRU ordering
    pub last_accessed_at: DateTime<Utc>,
    /// File size at write time
    pub size_bytes: u64,
    /// Informational only
    pub access_count: u64,
}

impl CacheEntry {
    /// Entry for a file that was just written.
    pub fn fresh(remote_reference: &str, local_path: PathBuf, size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            remote_reference: remote_reference.to_string(),
            local_path,
            created_at: now,
            last_accessed_at: now,
            size_bytes,
            access_count: 1,
        }
    }

    /// Record a hit.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now.max(self.created_at);
        self.access_count = self.access_count.saturating_add(1);
    }

    /// Time since first download.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Whether the entry has outlived `max_age`.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > max_age
    }
}

/// Authoritative `key -> CacheEntry` map
#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
}

impl CacheIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrate from the store. Missing or unreadable data means a cold start.
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let raw = match store.get_item(INDEX_STORE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Self::new(),
            Err(e) => {
                tracing::warn!("Failed to read image cache index, starting cold: {e}");
                return Self::new();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(entries) => Self { entries },
            Err(e) => {
                tracing::warn!("Corrupt image cache index, starting cold: {e}");
                Self::new()
            }
        }
    }

    /// Overwrite the persisted snapshot with the whole map.
    pub fn save(&self, store: &dyn KeyValueStore) {
        let result = serde_json::to_string(&self.entries)
            .map_err(Into::into)
            .and_then(|json| store.set_item(INDEX_STORE_KEY, &json));
        if let Err(e) = result {
            tracing::warn!("Failed to persist image cache index: {e}");
        }
    }

    /// Look up an entry.
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Look up an entry for update.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    /// Insert or replace an entry.
    pub fn put(&mut self, key: String, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Remove an entry, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    /// Iterate over all `(key, entry)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &CacheEntry)> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of `size_bytes` over all entries.
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Hit/miss counters, persisted next to the index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    /// Valid lookups served from disk
    pub hits: u64,
    /// Lookups that needed a download
    pub misses: u64,
}

impl CacheCounters {
    /// Hydrate from the store, zeroed on missing or corrupt data.
    pub fn load(store: &dyn KeyValueStore) -> Self {
        match store.get_item(STATS_STORE_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Corrupt image cache stats, resetting: {e}");
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!("Failed to read image cache stats: {e}");
                Self::default()
            }
        }
    }

    /// Persist the counters.
    pub fn save(&self, store: &dyn KeyValueStore) {
        let result = serde_json::to_string(self)
            .map_err(Into::into)
            .and_then(|json| store.set_item(STATS_STORE_KEY, &json));
        if let Err(e) = result {
            tracing::warn!("Failed to persist image cache stats: {e}");
        }
    }

    /// Fraction of lookups that were hits (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
