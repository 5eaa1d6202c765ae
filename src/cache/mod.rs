//! Weighted, tiered caching.
//!
//! [`TieredCache`] is the in-memory Hot/Warm/Cold/Persistent cache. The
//! [`Cache`] trait is the one capability interface every cache variant
//! implements, so the rest of the system can hold an `Arc<dyn Cache>` without
//! caring whether values come from memory, the record store ([`StoreCache`])
//! or the vector index ([`VectorCache`]).

pub mod adapters;
pub mod entry;
pub mod level;
pub mod spill;
pub mod tiered;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::error::RecallResult;

pub use adapters::{StoreCache, VectorCache};
pub use entry::{CacheEntry, CachedValue, EntryMetadata, EntrySnapshot};
pub use level::{CacheLevel, LevelCapacity};
pub use spill::{EvictedEntry, EvictionSink, SpillStats, SpillWriter, artifact_name};
pub use tiered::{CacheConfig, Reconciled, TieredCache};

/// Occupancy of one level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelStats {
    pub items: usize,
    pub bytes: usize,
    pub max_items: usize,
    pub max_bytes: usize,
}

/// Counters and occupancy of a cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub cache_id: String,
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub evictions: u64,
    /// Evictions or deletes the sink could not take
    pub sink_failures: u64,
    /// Per-level occupancy, keyed by level name
    pub levels: BTreeMap<String, LevelStats>,
}

impl CacheStats {
    pub fn new(cache_id: impl Into<String>) -> Self {
        Self {
            cache_id: cache_id.into(),
            ..Self::default()
        }
    }

    /// Hits over lookups, 0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// The capability every cache variant offers.
///
/// Misses are `Ok(None)`, never errors.
#[async_trait]
pub trait Cache: Send + Sync {
    fn cache_id(&self) -> &str;

    async fn get(&self, key: &str) -> RecallResult<Option<CachedValue>>;

    async fn put(&self, key: &str, value: JsonValue, metadata: EntryMetadata) -> RecallResult<()>;

    /// Remove a key. `Ok(false)` if it was not there.
    async fn delete(&self, key: &str) -> RecallResult<bool>;

    async fn contains(&self, key: &str) -> RecallResult<bool>;

    async fn clear(&self) -> RecallResult<()>;

    async fn stats(&self) -> RecallResult<CacheStats>;
}

#[async_trait]
impl Cache for TieredCache {
    fn cache_id(&self) -> &str {
        self.id()
    }

    async fn get(&self, key: &str) -> RecallResult<Option<CachedValue>> {
        Ok(TieredCache::get(self, key))
    }

    async fn put(&self, key: &str, value: JsonValue, metadata: EntryMetadata) -> RecallResult<()> {
        TieredCache::put(self, key, value, metadata).map(|_| ())
    }

    async fn delete(&self, key: &str) -> RecallResult<bool> {
        TieredCache::delete(self, key)
    }

    async fn contains(&self, key: &str) -> RecallResult<bool> {
        Ok(TieredCache::contains(self, key))
    }

    async fn clear(&self) -> RecallResult<()> {
        TieredCache::clear(self);
        Ok(())
    }

    async fn stats(&self) -> RecallResult<CacheStats> {
        Ok(TieredCache::stats(self))
    }
}
