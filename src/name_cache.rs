//! TTL-bounded cache of mutable name resolutions
//!
//! Entries expire individually (a resolved record carries its own TTL, capped
//! by the cache's maximum) and the cache evicts least recently used entries
//! once it holds `max_entries`.

use crate::name_resolver::ResolvedName;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone)]
struct CacheEntry {
    value: ResolvedName,
    expires_at: Instant,
    last_accessed: Instant,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCacheStats {
    pub total_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Cache of name → resolved path
pub struct NameCache {
    storage: Arc<RwLock<HashMap<String, CacheEntry>>>,
    max_ttl: Duration,
    max_entries: usize,
    hits: Arc<RwLock<u64>>,
    misses: Arc<RwLock<u64>>,
}

impl NameCache {
    /// Create a new NameCache
    ///
    /// # Arguments
    /// * `max_ttl` - Upper bound on how long any entry is kept
    /// * `max_entries` - Entry count beyond which LRU eviction kicks in
    pub fn new(max_ttl: Duration, max_entries: usize) -> Self {
        NameCache {
            storage: Arc::new(RwLock::new(HashMap::new())),
            max_ttl,
            max_entries: max_entries.max(1),
            hits: Arc::new(RwLock::new(0)),
            misses: Arc::new(RwLock::new(0)),
        }
    }

    /// Get cache statistics
    pub fn get_stats(&self) -> NameCacheStats {
        let total_entries = self.storage.read().map(|s| s.len()).unwrap_or(0);
        let hits = self.hits.read().map(|h| *h).unwrap_or(0);
        let misses = self.misses.read().map(|m| *m).unwrap_or(0);

        NameCacheStats {
            total_entries,
            hits,
            misses,
        }
    }

    /// Look up a live entry, refreshing its access time
    pub fn get(&self, name: &str) -> Option<ResolvedName> {
        let now = Instant::now();
        let result = match self.storage.write() {
            Ok(mut storage) => match storage.get(name).map(|e| e.expires_at > now) {
                Some(true) => storage.get_mut(name).map(|entry| {
                    entry.last_accessed = now;
                    entry.value.clone()
                }),
                Some(false) => {
                    debug!("Name cache entry expired: name={}", name);
                    storage.remove(name);
                    None
                }
                None => None,
            },
            Err(_) => None,
        };

        let counter = if result.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        if let Ok(mut count) = counter.write() {
            *count += 1;
        }

        result
    }

    /// Whether a live entry exists (does not touch statistics)
    pub fn has(&self, name: &str) -> bool {
        let now = Instant::now();
        self.storage
            .read()
            .map(|s| s.get(name).map(|e| e.expires_at > now).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Store a resolution for `ttl`, capped at the cache's maximum TTL
    pub fn set(&self, name: &str, value: ResolvedName, ttl: Duration) {
        let ttl = ttl.min(self.max_ttl);
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();

        if let Ok(mut storage) = self.storage.write() {
            storage.retain(|_, entry| entry.expires_at > now);

            if !storage.contains_key(name) && storage.len() >= self.max_entries {
                let oldest = storage
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_accessed)
                    .map(|(key, _)| key.clone());
                if let Some(key) = oldest {
                    debug!("Name cache LRU eviction: name={}", key);
                    storage.remove(&key);
                }
            }

            storage.insert(
                name.to_string(),
                CacheEntry {
                    value,
                    expires_at: now + ttl,
                    last_accessed: now,
                },
            );
        }
    }

    /// Remove an entry
    pub fn delete(&self, name: &str) -> bool {
        self.storage
            .write()
            .map(|mut s| s.remove(name).is_some())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut storage) = self.storage.write() {
            storage.clear();
        }
    }
}
