/// Cache variants backed by other parts of the system.
///
/// - [`StoreCache`]: reads and writes [`MemoryRecord`] payloads straight
///   through a [`MemoryStore`]
/// - [`VectorCache`]: keys map to [`Vector`]s in a [`VectorIndex`], with
///   optional per-key JSON artifact files
///
/// Both report their values at [`CacheLevel::External`] and publish on the
/// same event bus as the tiered cache.
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, warn};

use super::entry::{CachedValue, EntryMetadata};
use super::level::CacheLevel;
use super::spill::artifact_name;
use super::{Cache, CacheStats, LevelStats};
use crate::error::{RecallError, RecallResult};
use crate::events::{CacheEvent, CacheEventBus, CacheEventKind};
use crate::persistence::write_atomic;
use crate::store::MemoryStore;
use crate::types::{DEFAULT_WEIGHT, MemoryRecord};
use crate::vector::{Vector, VectorIndex};

#[derive(Debug, Default)]
struct LookupCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LookupCounters {
    fn count(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fill(&self, stats: &mut CacheStats) {
        stats.hits = self.hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);
    }
}

/// Database-backed cache over a [`MemoryStore`].
///
/// Values are record payloads ([`MemoryRecord::to_payload`]). `put` stores the
/// record under the given key with the metadata weight.
pub struct StoreCache {
    id: String,
    store: Arc<dyn MemoryStore>,
    bus: Arc<CacheEventBus>,
    counters: LookupCounters,
}

impl StoreCache {
    pub fn new(id: impl Into<String>, store: Arc<dyn MemoryStore>, bus: Arc<CacheEventBus>) -> Self {
        Self {
            id: id.into(),
            store,
            bus,
            counters: LookupCounters::default(),
        }
    }
}

#[async_trait]
impl Cache for StoreCache {
    fn cache_id(&self) -> &str {
        &self.id
    }

    async fn get(&self, key: &str) -> RecallResult<Option<CachedValue>> {
        let record = self.store.get_record(key).await?;
        self.counters.count(record.is_some());
        let Some(record) = record else {
            return Ok(None);
        };
        self.bus.publish(
            &CacheEvent::new(CacheEventKind::Get, self.id.as_str())
                .key(key)
                .metadata(json!({"level": CacheLevel::External})),
        );
        Ok(Some(CachedValue {
            value: record.to_payload(),
            level: CacheLevel::External,
            priority: record.weight,
            access_count: 0,
        }))
    }

    async fn put(&self, key: &str, value: JsonValue, metadata: EntryMetadata) -> RecallResult<()> {
        let mut record = MemoryRecord::from_payload(&value)
            .ok_or_else(|| RecallError::Store(format!("value for {key} is not a memory record")))?;
        record.id = key.to_string();
        record.set_weight(metadata.weight);
        self.store.upsert_record(record).await?;
        self.bus.publish(
            &CacheEvent::new(CacheEventKind::Put, self.id.as_str())
                .key(key)
                .value(value)
                .metadata(json!({"level": CacheLevel::External, "priority": metadata.weight})),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> RecallResult<bool> {
        let removed = self.store.delete_record(key).await?;
        if removed {
            self.bus
                .publish(&CacheEvent::new(CacheEventKind::Delete, self.id.as_str()).key(key));
        }
        Ok(removed)
    }

    async fn contains(&self, key: &str) -> RecallResult<bool> {
        Ok(self.store.get_record(key).await?.is_some())
    }

    async fn clear(&self) -> RecallResult<()> {
        Err(RecallError::Store(
            "clear is not supported by a store-backed cache".into(),
        ))
    }

    async fn stats(&self) -> RecallResult<CacheStats> {
        let mut stats = CacheStats::new(self.id.as_str());
        stats.entries = self.store.count().await?;
        self.counters.fill(&mut stats);
        stats.levels.insert(
            CacheLevel::External.to_string(),
            LevelStats {
                items: stats.entries,
                ..LevelStats::default()
            },
        );
        Ok(stats)
    }
}

/// Index-backed cache over a [`VectorIndex`].
///
/// Values are serialized [`Vector`]s. With an artifact directory each put also
/// writes `<dir>/<sha256(key)>.json`, and delete removes it again.
pub struct VectorCache {
    id: String,
    index: Arc<VectorIndex>,
    bus: Arc<CacheEventBus>,
    artifact_dir: Option<PathBuf>,
    counters: LookupCounters,
}

impl VectorCache {
    pub fn new(id: impl Into<String>, index: Arc<VectorIndex>, bus: Arc<CacheEventBus>) -> Self {
        Self {
            id: id.into(),
            index,
            bus,
            artifact_dir: None,
            counters: LookupCounters::default(),
        }
    }

    /// Mirror every vector to a JSON file under `dir`.
    pub fn with_artifacts(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    /// The artifact file for `key`, if artifacts are enabled.
    pub fn artifact_path(&self, key: &str) -> Option<PathBuf> {
        self.artifact_dir
            .as_ref()
            .map(|dir| dir.join(artifact_name(key)))
    }

    async fn write_artifact(path: &Path, vector: &Vector) -> RecallResult<()> {
        write_atomic(path, &serde_json::to_vec(vector)?).await
    }
}

#[async_trait]
impl Cache for VectorCache {
    fn cache_id(&self) -> &str {
        &self.id
    }

    async fn get(&self, key: &str) -> RecallResult<Option<CachedValue>> {
        let vector = self.index.get(key);
        self.counters.count(vector.is_some());
        let Some(vector) = vector else {
            return Ok(None);
        };
        self.bus.publish(
            &CacheEvent::new(CacheEventKind::Get, self.id.as_str())
                .key(key)
                .metadata(json!({"level": CacheLevel::External})),
        );
        Ok(Some(CachedValue {
            value: serde_json::to_value(&vector)?,
            level: CacheLevel::External,
            priority: DEFAULT_WEIGHT,
            access_count: 0,
        }))
    }

    /// Index the vector. A failed artifact write is logged; the vector stays
    /// indexed.
    async fn put(&self, key: &str, value: JsonValue, metadata: EntryMetadata) -> RecallResult<()> {
        let vector: Vector = serde_json::from_value(value)?;
        self.index.add(key, &vector)?;

        if let Some(path) = self.artifact_path(key) {
            if let Err(e) = Self::write_artifact(&path, &vector).await {
                warn!(cache = %self.id, key, error = %e, "Failed to write vector artifact");
            }
        }

        self.bus.publish(
            &CacheEvent::new(CacheEventKind::Put, self.id.as_str())
                .key(key)
                .metadata(json!({
                    "level": CacheLevel::External,
                    "priority": metadata.weight,
                    "dimensions": vector.dimensions(),
                })),
        );
        Ok(())
    }

    /// Remove the vector, then its artifact. An artifact that can't be removed
    /// is reported as `PersistenceFailure` once the vector is gone.
    async fn delete(&self, key: &str) -> RecallResult<bool> {
        let removed = self.index.remove(key);
        if removed {
            self.bus
                .publish(&CacheEvent::new(CacheEventKind::Delete, self.id.as_str()).key(key));
        }

        if let Some(path) = self.artifact_path(key) {
            match fs::remove_file(&path).await {
                Ok(()) => debug!(key, "Removed vector artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(RecallError::PersistenceFailure(format!(
                        "Failed to remove {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        Ok(removed)
    }

    async fn contains(&self, key: &str) -> RecallResult<bool> {
        Ok(self.index.contains(key))
    }

    async fn clear(&self) -> RecallResult<()> {
        let removed = self.index.len();
        self.index.clear();

        if let Some(dir) = &self.artifact_dir {
            let mut entries = match fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(RecallError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.ends_with(".json") || name.ends_with(".json.tmp") {
                    fs::remove_file(entry.path()).await?;
                }
            }
        }

        self.bus.publish(
            &CacheEvent::new(CacheEventKind::Clear, self.id.as_str())
                .metadata(json!({"removed": removed})),
        );
        Ok(())
    }

    async fn stats(&self) -> RecallResult<CacheStats> {
        let mut stats = CacheStats::new(self.id.as_str());
        stats.entries = self.index.len();
        stats.bytes = stats.entries * self.index.dimension() * std::mem::size_of::<f32>();
        self.counters.fill(&mut stats);
        stats.levels.insert(
            CacheLevel::External.to_string(),
            LevelStats {
                items: stats.entries,
                bytes: stats.bytes,
                ..LevelStats::default()
            },
        );
        Ok(stats)
    }
}
