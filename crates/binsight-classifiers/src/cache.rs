//! Bounded in-memory prediction cache
//!
//! Entries are evicted in insertion order once the cache is full. Replacing an existing
//! key updates it in place and keeps its position.

use crate::fingerprint::CacheKey;
use binsight_core::{ClassificationResult, Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of cache activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0.0 before any lookup
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<CacheKey, ClassificationResult>,
    order: VecDeque<CacheKey>,
}

/// Fingerprint → result map with a fixed capacity
#[derive(Debug)]
pub struct PredictionCache {
    entries: Mutex<Entries>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl PredictionCache {
    /// Create a cache holding at most `capacity` results
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::config("cache capacity must be at least 1"));
        }

        Ok(Self {
            entries: Mutex::new(Entries {
                map: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Look up a stored result
    pub fn get(&self, key: &CacheKey) -> Option<ClassificationResult> {
        let found = self.entries.lock().map.get(key).cloned();

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("binsight_cache_hits_total").increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("binsight_cache_misses_total").increment(1);
        }

        found
    }

    /// Store a result, evicting the oldest entry when full
    pub fn put(&self, key: CacheKey, result: ClassificationResult) {
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.map.get_mut(&key) {
            *existing = result;
            return;
        }

        if entries.map.len() >= self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.map.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("binsight_cache_evictions_total").increment(1);
                tracing::debug!(key = %oldest, "Evicted cached prediction");
            }
        }

        entries.order.push_back(key);
        entries.map.insert(key, result);
    }

    /// Whether `key` is stored (does not count as a lookup)
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().map.contains_key(key)
    }

    /// Number of stored results
    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of stored results
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every stored result. Counters are kept.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.map.clear();
        entries.order.clear();
    }

    /// Current hit/miss/eviction counts
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
