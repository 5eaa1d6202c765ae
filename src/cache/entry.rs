//! Cache entries.
//!
//! Access statistics are atomics so a hit only needs the cache's read lock.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use super::level::CacheLevel;
use crate::types::{DEFAULT_WEIGHT, MAX_WEIGHT, MIN_WEIGHT};

/// How a value should be cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Importance weight; picks the level
    pub weight: f64,
    /// Keep in the persistent level, never auto-evict
    pub pinned: bool,
    /// Terms for the keyword side-index
    pub keywords: Vec<String>,
    /// Caller data carried along with the entry
    pub extra: Option<JsonValue>,
}

impl Default for EntryMetadata {
    fn default() -> Self {
        Self {
            weight: DEFAULT_WEIGHT,
            pinned: false,
            keywords: Vec::new(),
            extra: None,
        }
    }
}

impl EntryMetadata {
    /// Metadata with a weight.
    pub fn weight(weight: f64) -> Self {
        Self {
            weight,
            ..Self::default()
        }
    }

    /// Pin the entry.
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Index the entry under these keywords (lowercased, deduplicated).
    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for keyword in keywords {
            let keyword = keyword.as_ref().trim().to_lowercase();
            if !keyword.is_empty() && !self.keywords.contains(&keyword) {
                self.keywords.push(keyword);
            }
        }
        self
    }

    /// Attach caller data.
    pub fn extra(mut self, extra: JsonValue) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// A value returned from a cache lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    pub value: JsonValue,
    /// Level that served the value (before any promotion it triggered)
    pub level: CacheLevel,
    pub priority: f64,
    pub access_count: u64,
}

/// Serializable view of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub key: String,
    pub level: CacheLevel,
    pub priority: f64,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub keywords: Vec<String>,
    pub size_bytes: usize,
    pub pinned: bool,
    pub extra: Option<JsonValue>,
}

/// One cached value with its placement and access statistics.
#[derive(Debug)]
pub struct CacheEntry {
    pub(crate) key: String,
    pub(crate) value: JsonValue,
    pub(crate) level: CacheLevel,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) keywords: Vec<String>,
    pub(crate) size_bytes: usize,
    pub(crate) pinned: bool,
    pub(crate) extra: Option<JsonValue>,
    priority: AtomicU64,
    access_count: AtomicU64,
    last_accessed_ms: AtomicI64,
    hits_since_move: AtomicU32,
}

impl CacheEntry {
    pub(crate) fn new(
        key: String,
        value: JsonValue,
        level: CacheLevel,
        metadata: EntryMetadata,
        size_bytes: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            value,
            level,
            created_at: now,
            keywords: metadata.keywords,
            size_bytes,
            pinned: metadata.pinned && level == CacheLevel::Persistent,
            extra: metadata.extra,
            priority: AtomicU64::new(clamp_priority(metadata.weight).to_bits()),
            access_count: AtomicU64::new(0),
            last_accessed_ms: AtomicI64::new(now.timestamp_millis()),
            hits_since_move: AtomicU32::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &JsonValue {
        &self.value
    }

    pub fn level(&self) -> CacheLevel {
        self.level
    }

    pub fn priority(&self) -> f64 {
        f64::from_bits(self.priority.load(Ordering::Relaxed))
    }

    pub(crate) fn set_priority(&self, priority: f64) {
        self.priority
            .store(clamp_priority(priority).to_bits(), Ordering::Relaxed);
    }

    /// Add `nudge` to the priority, returning the new value.
    pub(crate) fn nudge_priority(&self, nudge: f64) -> f64 {
        let mut current = self.priority.load(Ordering::Relaxed);
        loop {
            let next = clamp_priority(f64::from_bits(current) + nudge);
            match self.priority.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_accessed_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at)
    }

    /// Count a hit at `now`. Returns hits since the last level change.
    pub(crate) fn record_hit(&self, now: DateTime<Utc>) -> u32 {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_accessed_ms
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
        self.hits_since_move.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn moved_to(&mut self, level: CacheLevel) {
        self.level = level;
        if level != CacheLevel::Persistent {
            self.pinned = false;
        }
        self.hits_since_move.store(0, Ordering::Relaxed);
    }

    /// Carry access history over from the entry this one replaces.
    pub(crate) fn inherit(&mut self, previous: &CacheEntry) {
        self.created_at = previous.created_at;
        self.access_count
            .store(previous.access_count(), Ordering::Relaxed);
        self.last_accessed_ms.store(
            previous.last_accessed_ms.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
    }

    /// Eviction score: priority halved every `half_life_hours` of idleness.
    ///
    /// The lowest score in a level is evicted first.
    pub fn retention_score(&self, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
        let idle_ms = (now.timestamp_millis() - self.last_accessed_ms.load(Ordering::Relaxed)).max(0);
        let idle_hours = idle_ms as f64 / 3_600_000.0;
        self.priority() * 0.5f64.powf(idle_hours / half_life_hours)
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            key: self.key.clone(),
            level: self.level,
            priority: self.priority(),
            access_count: self.access_count(),
            last_accessed: self.last_accessed(),
            created_at: self.created_at,
            keywords: self.keywords.clone(),
            size_bytes: self.size_bytes,
            pinned: self.pinned,
            extra: self.extra.clone(),
        }
    }
}

fn clamp_priority(priority: f64) -> f64 {
    if priority.is_nan() {
        MIN_WEIGHT
    } else {
        priority.clamp(MIN_WEIGHT, MAX_WEIGHT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry(weight: f64, now: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(
            "k".into(),
            json!({"text": "hello"}),
            CacheLevel::Warm,
            EntryMetadata::weight(weight),
            16,
            now,
        )
    }

    #[test]
    fn test_metadata_keywords_normalized() {
        let meta = EntryMetadata::weight(2.0).keywords(["Rust", "rust ", "", "Tokio"]);
        assert_eq!(meta.keywords, vec!["rust", "tokio"]);
        assert!(!meta.pinned);
        assert!(EntryMetadata::default().pinned().pinned);
    }

    #[test]
    fn test_hits_and_nudges() {
        let now = Utc::now();
        let entry = entry(4.0, now);
        assert_eq!(entry.record_hit(now + Duration::seconds(1)), 1);
        assert_eq!(entry.record_hit(now + Duration::seconds(2)), 2);
        assert_eq!(entry.access_count(), 2);
        assert_eq!(
            entry.last_accessed().timestamp_millis(),
            (now + Duration::seconds(2)).timestamp_millis()
        );

        assert!((entry.nudge_priority(0.5) - 4.5).abs() < 1e-12);
        assert_eq!(entry.nudge_priority(100.0), MAX_WEIGHT);
    }

    #[test]
    fn test_priority_clamped() {
        let now = Utc::now();
        let entry = entry(42.0, now);
        assert_eq!(entry.priority(), MAX_WEIGHT);
        entry.set_priority(f64::NAN);
        assert_eq!(entry.priority(), MIN_WEIGHT);
    }

    #[test]
    fn test_retention_score_halves() {
        let now = Utc::now();
        let entry = entry(8.0, now);
        let fresh = entry.retention_score(now, 24.0);
        let day_later = entry.retention_score(now + Duration::hours(24), 24.0);
        assert!((fresh - 8.0).abs() < 1e-9);
        assert!((day_later - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_pinned_only_in_persistent() {
        let now = Utc::now();
        let mut pinned = CacheEntry::new(
            "p".into(),
            json!(1),
            CacheLevel::Persistent,
            EntryMetadata::weight(1.0).pinned(),
            1,
            now,
        );
        assert!(pinned.pinned);
        pinned.moved_to(CacheLevel::Cold);
        assert!(!pinned.pinned);

        assert!(!entry(1.0, now).pinned);
    }
}
