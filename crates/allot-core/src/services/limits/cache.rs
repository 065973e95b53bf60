//! Read-through cache for status queries
//!
//! A bounded, process-local mirror of committed records. Entries expire after
//! a period without access (sliding TTL). Writers invalidate, never patch, so
//! the next read repopulates from storage. The cache never sits on the
//! check-then-increment path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use super::types::EntitlementRecord;

/// Cache key: limit type, user, and character for per-character limits
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub field: String,
    pub user_id: String,
    pub character_id: Option<String>,
}

impl CacheKey {
    pub fn new(field: impl Into<String>, user_id: impl Into<String>, character_id: Option<&str>) -> Self {
        Self {
            field: field.into(),
            user_id: user_id.into(),
            character_id: character_id.map(str::to_string),
        }
    }
}

/// Counters exposed through `getCacheStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: u64,
    pub capacity: u64,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

/// Snapshot of the cache generation, taken before a storage read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

/// Bounded LRU-style cache of entitlement records
pub struct ReadThroughCache {
    inner: Cache<CacheKey, EntitlementRecord>,
    capacity: u64,
    ttl: Duration,
    metrics: CacheMetrics,
    /// Bumped before every invalidation
    generation: AtomicU64,
}

impl ReadThroughCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_idle(ttl)
            .build();

        Self {
            inner,
            capacity,
            ttl,
            metrics: CacheMetrics::default(),
            generation: AtomicU64::new(0),
        }
    }

    /// Owned copy of the cached record; mutating it never touches the cache
    pub fn get(&self, key: &CacheKey) -> Option<EntitlementRecord> {
        match self.inner.get(key) {
            Some(record) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                log::debug!("[limits:cache] Hit for {}:{}", key.field, key.user_id);
                Some(record)
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: CacheKey, record: EntitlementRecord) {
        self.inner.insert(key, record);
    }

    /// Take before reading from storage; pass to [`Self::insert_if_current`]
    pub fn generation(&self) -> Generation {
        Generation(self.generation.load(Ordering::SeqCst))
    }

    /// Insert a record read from storage unless an invalidation happened
    /// since `seen` was taken. Returns whether the entry was kept.
    pub fn insert_if_current(&self, key: CacheKey, record: EntitlementRecord, seen: Generation) -> bool {
        if self.generation() != seen {
            return false;
        }
        self.inner.insert(key.clone(), record);

        // an invalidation racing with the insert may have missed the new entry
        if self.generation() != seen {
            self.inner.invalidate(&key);
            return false;
        }
        true
    }

    /// Drop one entry after a write to its key
    pub fn invalidate(&self, key: &CacheKey) {
        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.invalidate(key);
    }

    /// Drop every entry belonging to `user_id` (all characters)
    pub fn invalidate_user(&self, user_id: &str) {
        let targets: Vec<CacheKey> = self
            .inner
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in &targets {
            self.invalidate(key);
        }
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.invalidate_all();
        self.inner.run_pending_tasks();
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.run_pending_tasks();
        CacheStats {
            entries: self.inner.entry_count(),
            capacity: self.capacity,
            ttl_secs: self.ttl.as_secs(),
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            invalidations: self.metrics.invalidations.load(Ordering::Relaxed),
        }
    }
}
