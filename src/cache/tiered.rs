/// In-memory tiered cache.
///
/// Entries live on a ladder of levels, `Hot ⇄ Warm ⇄ Cold`, plus a sticky
/// `Persistent` level for pinned entries. The importance weight an entry is
/// stored with picks its level (core/archive → hot, long-term → warm,
/// short-term → cold).
///
/// ## Eviction
///
/// Each level is bounded by item count and by serialized bytes. When an insert
/// would break a bound, the entry with the lowest
/// `priority * 0.5^(idle_hours / half_life)` is flushed one level down (ties go
/// to the least recently accessed). Falling off `Cold` is a hard eviction: the
/// entry is handed to the [`EvictionSink`] and an `Evict` event is published.
/// Pinned entries are never evicted.
///
/// ## Promotion
///
/// Every hit nudges an entry's priority. An entry moves up one level when its
/// nudged priority maps to a hotter level than the one it sits in, or after
/// `promote_after_hits` hits at its current level.
///
/// ## Locking
///
/// One `RwLock` guards the whole cache. Hits take the read lock (access
/// statistics are atomics) and only upgrade to the write lock to promote.
/// Events are published while the lock is held, which keeps them in mutation
/// order; listeners must not call back into the cache.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use super::entry::{CacheEntry, CachedValue, EntryMetadata, EntrySnapshot};
use super::level::{CacheLevel, LevelCapacity};
use super::spill::{EvictedEntry, EvictionSink};
use super::{CacheStats, LevelStats};
use crate::error::{RecallError, RecallResult};
use crate::events::{CacheEvent, CacheEventBus, CacheEventKind};
use crate::weight::WeightUpdate;

/// Tiered cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub hot: LevelCapacity,
    pub warm: LevelCapacity,
    pub cold: LevelCapacity,
    pub persistent: LevelCapacity,
    /// Hits at one level that trigger a promotion
    pub promote_after_hits: u32,
    /// Priority added per hit
    pub hit_nudge: f64,
    /// Idle time that halves an entry's retention score
    pub recency_half_life_hours: f64,
    /// Where hard-evicted entries are spilled, if anywhere
    pub spill_dir: Option<PathBuf>,
    pub spill_queue_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        const MIB: usize = 1024 * 1024;
        Self {
            hot: LevelCapacity::new(256, 4 * MIB),
            warm: LevelCapacity::new(1024, 16 * MIB),
            cold: LevelCapacity::new(4096, 64 * MIB),
            persistent: LevelCapacity::new(256, 4 * MIB),
            promote_after_hits: 3,
            hit_nudge: 0.1,
            recency_half_life_hours: 24.0,
            spill_dir: None,
            spill_queue_depth: 256,
        }
    }
}

impl CacheConfig {
    /// Capacity of a stored level. `External` has none.
    pub fn capacity(&self, level: CacheLevel) -> LevelCapacity {
        match level {
            CacheLevel::Hot => self.hot,
            CacheLevel::Warm => self.warm,
            CacheLevel::Cold => self.cold,
            CacheLevel::Persistent => self.persistent,
            CacheLevel::External => LevelCapacity::new(0, 0),
        }
    }

    /// Same capacity for every ladder level.
    pub fn uniform(max_items: usize, max_bytes: usize) -> Self {
        let capacity = LevelCapacity::new(max_items, max_bytes);
        Self {
            hot: capacity,
            warm: capacity,
            cold: capacity,
            persistent: capacity,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> RecallResult<()> {
        for level in CacheLevel::STORED {
            let capacity = self.capacity(level);
            if capacity.max_items == 0 || capacity.max_bytes == 0 {
                return Err(RecallError::InvalidConfig(format!(
                    "{level} level needs a positive item and byte capacity"
                )));
            }
        }
        if self.promote_after_hits == 0 {
            return Err(RecallError::InvalidConfig(
                "promote_after_hits must be at least 1".into(),
            ));
        }
        if !(self.hit_nudge.is_finite() && self.hit_nudge >= 0.0) {
            return Err(RecallError::InvalidConfig(
                "hit_nudge must be a non-negative number".into(),
            ));
        }
        if !(self.recency_half_life_hours.is_finite() && self.recency_half_life_hours > 0.0) {
            return Err(RecallError::InvalidConfig(
                "recency_half_life_hours must be positive".into(),
            ));
        }
        if self.spill_queue_depth == 0 {
            return Err(RecallError::InvalidConfig(
                "spill_queue_depth must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// What [`TieredCache::reconcile`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Unchanged,
    Moved { from: CacheLevel, to: CacheLevel },
    Evicted,
}

#[derive(Debug, Default)]
struct LevelSlot {
    keys: HashSet<String>,
    bytes: usize,
}

#[derive(Debug, Default)]
struct TieredState {
    entries: HashMap<String, CacheEntry>,
    levels: [LevelSlot; 4],
    keywords: HashMap<String, HashSet<String>>,
}

impl TieredState {
    fn slot(&self, level: CacheLevel) -> Option<&LevelSlot> {
        level.slot().map(|i| &self.levels[i])
    }

    fn attach(&mut self, entry: CacheEntry) {
        if let Some(i) = entry.level.slot() {
            self.levels[i].keys.insert(entry.key.clone());
            self.levels[i].bytes += entry.size_bytes;
        }
        for keyword in &entry.keywords {
            self.keywords
                .entry(keyword.clone())
                .or_default()
                .insert(entry.key.clone());
        }
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Remove an entry from every index.
    fn detach(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        if let Some(i) = entry.level.slot() {
            self.levels[i].keys.remove(key);
            self.levels[i].bytes = self.levels[i].bytes.saturating_sub(entry.size_bytes);
        }
        for keyword in &entry.keywords {
            if let Some(keys) = self.keywords.get_mut(keyword) {
                keys.remove(key);
                if keys.is_empty() {
                    self.keywords.remove(keyword);
                }
            }
        }
        Some(entry)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    evictions: AtomicU64,
    sink_failures: AtomicU64,
}

/// In-memory, weight-aware tiered cache.
pub struct TieredCache {
    id: String,
    config: CacheConfig,
    state: RwLock<TieredState>,
    bus: Arc<CacheEventBus>,
    sink: Option<Arc<dyn EvictionSink>>,
    counters: Counters,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("id", &self.id)
            .field("entries", &self.len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl TieredCache {
    /// Create an empty cache publishing on `bus`.
    pub fn new(id: impl Into<String>, config: CacheConfig, bus: Arc<CacheEventBus>) -> RecallResult<Self> {
        config.validate()?;
        let cache = Self {
            id: id.into(),
            config,
            state: RwLock::new(TieredState::default()),
            bus,
            sink: None,
            counters: Counters::default(),
        };
        cache.publish(CacheEvent::new(CacheEventKind::Init, cache.id.as_str()));
        Ok(cache)
    }

    /// Send hard evictions (and deletes) to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EvictionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, TieredState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TieredState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: CacheEvent) {
        self.bus.publish(&event);
    }

    /// Look up a value, counting the hit and promoting if it earned it.
    pub fn get(&self, key: &str) -> Option<CachedValue> {
        let now = Utc::now();
        let (cached, promote) = {
            let state = self.read();
            let Some(entry) = state.entries.get(key) else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                trace!(cache = %self.id, key, "Cache miss");
                return None;
            };

            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            let hits = entry.record_hit(now);
            let priority = entry.nudge_priority(self.config.hit_nudge);
            let promote = match (entry.level.rank(), CacheLevel::for_weight(priority).rank()) {
                (Some(current), Some(implied)) => {
                    entry.level.up().is_some()
                        && (implied > current || hits >= self.config.promote_after_hits)
                }
                _ => false,
            };

            self.publish(
                CacheEvent::new(CacheEventKind::Get, self.id.as_str())
                    .key(key)
                    .metadata(json!({"level": entry.level, "priority": priority})),
            );
            let cached = CachedValue {
                value: entry.value.clone(),
                level: entry.level,
                priority,
                access_count: entry.access_count(),
            };
            (cached, promote)
        };

        if promote {
            let mut state = self.write();
            // Another writer may have moved or removed it in between.
            let still_there = state
                .entries
                .get(key)
                .is_some_and(|entry| entry.level == cached.level);
            if let (true, Some(target)) = (still_there, cached.level.up()) {
                self.move_entry(&mut state, key, target, now, "hits");
            }
        }
        Some(cached)
    }

    /// Insert or replace a value. Returns the level it landed in.
    ///
    /// Fails with `CapacityExceeded` only when the value is larger than the
    /// byte budget of every level it could go to.
    pub fn put(
        &self,
        key: &str,
        value: JsonValue,
        metadata: EntryMetadata,
    ) -> RecallResult<CacheLevel> {
        let size = serde_json::to_vec(&value)?.len();
        let now = Utc::now();
        let weight_level = CacheLevel::for_weight(metadata.weight);

        let mut state = self.write();
        let previous = state.detach(key);

        let mut start = if metadata.pinned {
            CacheLevel::Persistent
        } else {
            weight_level
        };
        if start == CacheLevel::Persistent {
            let fits = state.slot(CacheLevel::Persistent).is_some_and(|slot| {
                self.config
                    .persistent
                    .fits(slot.keys.len(), slot.bytes, size)
            });
            if !fits {
                warn!(
                    cache = %self.id,
                    key,
                    fallback = %weight_level,
                    "Persistent level full, placing pinned entry by weight"
                );
                start = weight_level;
            }
        }

        let Some(level) = self.fitting_level(start, size) else {
            if let Some(previous) = previous {
                state.attach(previous);
            }
            return Err(RecallError::CapacityExceeded {
                level: start.to_string(),
            });
        };

        let priority = metadata.weight;
        let mut entry = CacheEntry::new(key.to_string(), value, level, metadata, size, now);
        if let Some(previous) = &previous {
            entry.inherit(previous);
        }
        self.make_room(&mut state, level, size, now);
        let event_value = entry.value.clone();
        state.attach(entry);

        debug!(cache = %self.id, key, %level, size, "Cached entry");
        self.publish(
            CacheEvent::new(CacheEventKind::Put, self.id.as_str())
                .key(key)
                .value(event_value)
                .metadata(json!({
                    "level": level,
                    "priority": priority,
                    "size_bytes": size,
                    "replaced": previous.is_some(),
                })),
        );
        Ok(level)
    }

    /// Swap the payload of a cached entry in place, keeping its level,
    /// priority and hit statistics. Returns false when the key is not cached,
    /// or when the new payload no longer fits its level; the old payload
    /// stays in that case.
    pub fn refresh(&self, key: &str, value: JsonValue) -> RecallResult<bool> {
        let size = serde_json::to_vec(&value)?.len();
        let now = Utc::now();
        let mut state = self.write();
        let Some(mut entry) = state.detach(key) else {
            return Ok(false);
        };

        let level = entry.level;
        let fits = size <= self.config.capacity(level).max_bytes
            && self.make_room(&mut state, level, size, now);
        if fits {
            entry.value = value;
            entry.size_bytes = size;
            trace!(cache = %self.id, key, %level, size, "Refreshed entry");
        } else {
            debug!(cache = %self.id, key, %level, size, "Refreshed payload does not fit, keeping old one");
        }
        state.attach(entry);
        Ok(fits)
    }

    /// Remove a value and any artifact persisted for it.
    ///
    /// Returns whether it was cached. The in-memory removal always happens;
    /// failing to queue the artifact cleanup is reported afterwards as
    /// `PersistenceFailure`.
    pub fn delete(&self, key: &str) -> RecallResult<bool> {
        let removed = {
            let mut state = self.write();
            let removed = state.detach(key).is_some();
            if removed {
                self.publish(CacheEvent::new(CacheEventKind::Delete, self.id.as_str()).key(key));
            }
            removed
        };

        if let Some(sink) = &self.sink {
            sink.removed(key).map_err(|e| {
                self.counters.sink_failures.fetch_add(1, Ordering::Relaxed);
                RecallError::PersistenceFailure(format!("Failed to remove artifact for {key}: {e}"))
            })?;
        }
        Ok(removed)
    }

    /// Move an entry one level up. Returns whether it moved.
    pub fn promote(&self, key: &str) -> bool {
        let mut state = self.write();
        let Some(target) = state.entries.get(key).and_then(|entry| entry.level.up()) else {
            return false;
        };
        self.move_entry(&mut state, key, target, Utc::now(), "manual")
    }

    /// Move an entry one level down. A pinned entry is unpinned into the
    /// level its priority implies. Returns whether it moved.
    pub fn demote(&self, key: &str) -> bool {
        let mut state = self.write();
        let Some(target) = state.entries.get(key).and_then(|entry| match entry.level {
            CacheLevel::Persistent => Some(CacheLevel::for_weight(entry.priority())),
            level => level.down(),
        }) else {
            return false;
        };
        self.move_entry(&mut state, key, target, Utc::now(), "manual")
    }

    /// Apply a recomputed weight: reprioritize, move to the implied level, or
    /// hard-evict an eviction candidate. Pinned entries only get the new
    /// priority. None if the key is not cached.
    pub fn reconcile(&self, key: &str, update: &WeightUpdate) -> Option<Reconciled> {
        let now = Utc::now();
        let mut state = self.write();
        let entry = state.entries.get(key)?;
        entry.set_priority(update.weight);
        if entry.pinned {
            return Some(Reconciled::Unchanged);
        }

        let from = entry.level;
        if update.eviction_candidate {
            if let Some(entry) = state.detach(key) {
                self.hard_evict(entry, now, "weight");
            }
            return Some(Reconciled::Evicted);
        }

        let to = CacheLevel::for_weight(update.weight);
        if to != from && self.move_entry(&mut state, key, to, now, "reconcile") {
            Some(Reconciled::Moved { from, to })
        } else {
            Some(Reconciled::Unchanged)
        }
    }

    /// Keys indexed under `keyword`, sorted.
    pub fn find_by_keyword(&self, keyword: &str) -> Vec<String> {
        let keyword = keyword.trim().to_lowercase();
        let state = self.read();
        let mut keys: Vec<String> = state
            .keywords
            .get(&keyword)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Keys stored at `level`, sorted.
    pub fn keys_at(&self, level: CacheLevel) -> Vec<String> {
        let state = self.read();
        let mut keys: Vec<String> = state
            .slot(level)
            .map(|slot| slot.keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Level a key currently lives in.
    pub fn level_of(&self, key: &str) -> Option<CacheLevel> {
        self.read().entries.get(key).map(|entry| entry.level)
    }

    /// Entry details without counting an access.
    pub fn peek(&self, key: &str) -> Option<EntrySnapshot> {
        self.read().entries.get(key).map(CacheEntry::snapshot)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every in-memory entry. Spilled artifacts are left alone.
    pub fn clear(&self) {
        let mut state = self.write();
        let removed = state.entries.len();
        *state = TieredState::default();
        self.publish(
            CacheEvent::new(CacheEventKind::Clear, self.id.as_str())
                .metadata(json!({"removed": removed})),
        );
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.read();
        let mut stats = CacheStats::new(self.id.as_str());
        for level in CacheLevel::STORED {
            let (items, bytes) = state
                .slot(level)
                .map_or((0, 0), |slot| (slot.keys.len(), slot.bytes));
            let capacity = self.config.capacity(level);
            stats.entries += items;
            stats.bytes += bytes;
            stats.levels.insert(
                level.to_string(),
                LevelStats {
                    items,
                    bytes,
                    max_items: capacity.max_items,
                    max_bytes: capacity.max_bytes,
                },
            );
        }
        stats.hits = self.counters.hits.load(Ordering::Relaxed);
        stats.misses = self.counters.misses.load(Ordering::Relaxed);
        stats.promotions = self.counters.promotions.load(Ordering::Relaxed);
        stats.demotions = self.counters.demotions.load(Ordering::Relaxed);
        stats.evictions = self.counters.evictions.load(Ordering::Relaxed);
        stats.sink_failures = self.counters.sink_failures.load(Ordering::Relaxed);
        stats
    }

    /// First level from `start` downwards whose byte budget can hold `size`.
    fn fitting_level(&self, start: CacheLevel, size: usize) -> Option<CacheLevel> {
        let mut level = Some(start);
        while let Some(current) = level {
            if size <= self.config.capacity(current).max_bytes {
                return Some(current);
            }
            level = current.down();
        }
        None
    }

    /// Evict from `level` until an entry of `size` fits. False if it can't.
    fn make_room(&self, state: &mut TieredState, level: CacheLevel, size: usize, now: DateTime<Utc>) -> bool {
        let capacity = self.config.capacity(level);
        loop {
            let Some(slot) = state.slot(level) else {
                return false;
            };
            if capacity.fits(slot.keys.len(), slot.bytes, size) {
                return true;
            }
            if level == CacheLevel::Persistent {
                return false;
            }
            let Some(victim) = self.pick_victim(state, level, now) else {
                return false;
            };
            self.flush_down(state, &victim, now);
        }
    }

    /// Lowest retention score in `level`; ties go to the oldest access.
    fn pick_victim(&self, state: &TieredState, level: CacheLevel, now: DateTime<Utc>) -> Option<String> {
        let half_life = self.config.recency_half_life_hours;
        state
            .slot(level)?
            .keys
            .iter()
            .filter_map(|key| state.entries.get(key))
            .filter(|entry| !entry.pinned)
            .map(|entry| {
                (
                    entry.retention_score(now, half_life),
                    entry.last_accessed(),
                    entry.key.as_str(),
                )
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(b.2)))
            .map(|(_, _, key)| key.to_string())
    }

    /// Push an entry one level down, or out of the cache from `Cold`.
    fn flush_down(&self, state: &mut TieredState, key: &str, now: DateTime<Utc>) {
        let Some(mut entry) = state.detach(key) else {
            return;
        };
        let from = entry.level;
        let lower = from.down().filter(|lower| {
            entry.size_bytes <= self.config.capacity(*lower).max_bytes
                && self.make_room(state, *lower, entry.size_bytes, now)
        });

        match lower {
            Some(to) => {
                entry.moved_to(to);
                state.attach(entry);
                self.counters.demotions.fetch_add(1, Ordering::Relaxed);
                self.publish(
                    CacheEvent::new(CacheEventKind::Demote, self.id.as_str())
                        .key(key)
                        .metadata(json!({"from": from, "to": to, "reason": "capacity"})),
                );
            }
            None => self.hard_evict(entry, now, "capacity"),
        }
    }

    fn hard_evict(&self, entry: CacheEntry, now: DateTime<Utc>, reason: &str) {
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(cache = %self.id, key = %entry.key, level = %entry.level, reason, "Evicted entry");

        let event = CacheEvent::new(CacheEventKind::Evict, self.id.as_str())
            .key(entry.key.as_str())
            .metadata(json!({
                "level": entry.level,
                "priority": entry.priority(),
                "reason": reason,
            }));

        if let Some(sink) = &self.sink {
            let evicted = EvictedEntry {
                key: entry.key.clone(),
                priority: entry.priority(),
                keywords: entry.keywords,
                value: entry.value,
                evicted_at: now,
            };
            if let Err(e) = sink.evicted(evicted) {
                self.counters.sink_failures.fetch_add(1, Ordering::Relaxed);
                warn!(cache = %self.id, key = %entry.key, error = %e, "Eviction not persisted");
            }
        }
        self.publish(event);
    }

    /// Move an existing entry to `to`, making room there first.
    fn move_entry(
        &self,
        state: &mut TieredState,
        key: &str,
        to: CacheLevel,
        now: DateTime<Utc>,
        reason: &str,
    ) -> bool {
        let Some(mut entry) = state.detach(key) else {
            return false;
        };
        let from = entry.level;
        if from == to
            || entry.size_bytes > self.config.capacity(to).max_bytes
            || !self.make_room(state, to, entry.size_bytes, now)
        {
            state.attach(entry);
            return false;
        }

        entry.moved_to(to);
        state.attach(entry);

        let promoted = match (from.rank(), to.rank()) {
            (Some(a), Some(b)) => b > a,
            (None, _) => false,
            (Some(_), None) => true,
        };
        let kind = if promoted {
            self.counters.promotions.fetch_add(1, Ordering::Relaxed);
            CacheEventKind::Promote
        } else {
            self.counters.demotions.fetch_add(1, Ordering::Relaxed);
            CacheEventKind::Demote
        };
        trace!(cache = %self.id, key, %from, %to, reason, "Moved entry");
        self.publish(
            CacheEvent::new(kind, self.id.as_str())
                .key(key)
                .metadata(json!({"from": from, "to": to, "reason": reason})),
        );
        true
    }
}
