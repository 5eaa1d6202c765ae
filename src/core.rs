/// The memory core: one explicitly constructed object that owns the index,
/// the tiered cache, the event bus and the maintenance workers.
///
/// # Write path
///
/// [`MemoryCore::remember`] writes the record to the store, indexes its
/// vector, caches its payload at the level its weight implies and submits a
/// maintenance task (score, summarize, persist, publish).
///
/// # Read path
///
/// [`MemoryCore::recall`] searches the index, serves each hit from the cache
/// (falling back to the store and re-caching on a miss) and reinforces the
/// weight of every record it returns.
///
/// # Example
///
/// ```ignore
/// use koru_recall::{InMemoryStore, MemoryCore, MemoryRecord, RecallConfig, Role, Vector};
/// use std::sync::Arc;
///
/// let core = MemoryCore::open(RecallConfig::default(), Arc::new(InMemoryStore::new())).await?;
///
/// let turn = MemoryRecord::new("The deploy key lives in the vault", Role::User);
/// core.remember(turn, embedding, Remember::default()).await?;
///
/// for hit in core.recall(&query, 5, 0.3).await? {
///     println!("{:.3} {}", hit.similarity, hit.record.content);
/// }
///
/// core.shutdown().await;
/// ```
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheLevel, CacheStats, EntryMetadata, SpillWriter, TieredCache};
use crate::config::RecallConfig;
use crate::error::{RecallError, RecallResult};
use crate::events::{CacheEvent, CacheEventBus, CacheEventKind};
use crate::maintenance::{
    ExtractiveSummarizer, MaintenanceScheduler, MaintenanceTask, Pipeline, ReconcileHandle,
    ReconcileReport, Reconciler, SchedulerStats, ShutdownReport, Submission, Summarizer,
};
use crate::store::MemoryStore;
use crate::types::{MemoryId, MemoryRecord};
use crate::vector::{Vector, VectorIndex};
use crate::weight::{SharedWeightConfig, WeightConfig, WeightContext};

const CACHE_ID: &str = "memory";

/// Options for [`MemoryCore::remember`].
#[derive(Debug, Clone, Default)]
pub struct Remember {
    /// Keep the payload in the persistent level
    pub pinned: bool,
    /// Terms for the cache keyword index
    pub keywords: Vec<String>,
    /// Records this one answers or continues
    pub related: Vec<MemoryId>,
    /// Context for the first weight update
    pub context: WeightContext,
}

impl Remember {
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn related_to(mut self, id: impl Into<MemoryId>) -> Self {
        self.related.push(id.into());
        self
    }

    pub fn context(mut self, context: WeightContext) -> Self {
        self.context = context;
        self
    }
}

/// One recalled memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Recalled {
    pub record: MemoryRecord,
    pub similarity: f32,
    /// Cache level that served the record; `None` when it came from the store
    pub level: Option<CacheLevel>,
}

/// Point-in-time view of every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreStats {
    pub cache: CacheStats,
    pub vectors: usize,
    pub tombstone_ratio: f64,
    pub records: usize,
    pub scheduler: SchedulerStats,
}

/// Tiered, weighted memory with vector recall.
pub struct MemoryCore {
    config: RecallConfig,
    store: Arc<dyn MemoryStore>,
    weights: SharedWeightConfig,
    index: Arc<VectorIndex>,
    cache: Arc<TieredCache>,
    bus: Arc<CacheEventBus>,
    spill: Option<Arc<SpillWriter>>,
    scheduler: MaintenanceScheduler,
    reconciler: Arc<Reconciler>,
    reconcile_loop: Mutex<Option<ReconcileHandle>>,
}

impl std::fmt::Debug for MemoryCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCore")
            .field("cache", &self.cache)
            .field("index", &self.index)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl MemoryCore {
    /// Open with the built-in extractive summarizer.
    pub async fn open(config: RecallConfig, store: Arc<dyn MemoryStore>) -> RecallResult<Self> {
        let summarizer = Arc::new(ExtractiveSummarizer::new(
            config.maintenance.summary_max_chars,
        ));
        Self::open_with(config, store, summarizer, Arc::new(CacheEventBus::new())).await
    }

    /// Open with a caller-supplied summarizer and event bus.
    ///
    /// Loads the vector checkpoint if one exists; a checkpoint that cannot be
    /// read is logged and the index starts empty. Must be called inside a
    /// tokio runtime.
    pub async fn open_with(
        config: RecallConfig,
        store: Arc<dyn MemoryStore>,
        summarizer: Arc<dyn Summarizer>,
        bus: Arc<CacheEventBus>,
    ) -> RecallResult<Self> {
        config.validate()?;
        let weights = SharedWeightConfig::new(config.weights.clone())?;

        let index = Arc::new(VectorIndex::new(config.index.clone())?);
        match index.load().await {
            Ok(report) if report.found => {
                if report.reconstructed_keys > 0 {
                    warn!(
                        reconstructed = report.reconstructed_keys,
                        "Vector checkpoint keys were reconstructed"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => warn!(
                error = %e,
                path = %config.index.checkpoint_path.display(),
                "Could not load vector checkpoint, starting empty"
            ),
        }

        let mut cache = TieredCache::new(CACHE_ID, config.cache.clone(), Arc::clone(&bus))?;
        let spill = config.cache.spill_dir.as_ref().map(|dir| {
            SpillWriter::spawn(dir.clone(), config.cache.spill_queue_depth)
        });
        if let Some(writer) = &spill {
            cache = cache.with_sink(writer.clone());
        }
        let cache = Arc::new(cache);

        let pipeline = Pipeline::new(
            Arc::clone(&store),
            weights.clone(),
            summarizer,
            Arc::clone(&bus),
        )
        .with_cache(Arc::clone(&cache));
        let scheduler = MaintenanceScheduler::start(Arc::new(pipeline), config.maintenance.clone())?;

        let reconciler = Arc::new(
            Reconciler::new(
                Arc::clone(&store),
                weights.clone(),
                Arc::clone(&cache),
                Arc::clone(&index),
                Arc::clone(&bus),
            )
            .batch(config.maintenance.reconcile_batch),
        );
        let reconcile_loop = config
            .maintenance
            .reconcile_interval()
            .map(|period| Arc::clone(&reconciler).spawn_periodic(period));

        info!(
            dimension = index.dimension(),
            kind = %index.index_kind(),
            vectors = index.len(),
            workers = config.maintenance.workers,
            "Memory core ready"
        );
        bus.publish(&CacheEvent::new(CacheEventKind::Init, "core").metadata(serde_json::json!({
            "vectors": index.len(),
        })));

        Ok(Self {
            config,
            store,
            weights,
            index,
            cache,
            bus,
            spill,
            scheduler,
            reconciler,
            reconcile_loop: Mutex::new(reconcile_loop),
        })
    }

    /// Store a turn and its embedding, then queue its maintenance task.
    ///
    /// The vector dimension is checked before anything is written. An entry
    /// too large for any cache level is still stored and indexed.
    pub async fn remember(
        &self,
        record: MemoryRecord,
        vector: Vector,
        options: Remember,
    ) -> RecallResult<Submission> {
        if vector.dimensions() != self.index.dimension() {
            return Err(RecallError::DimensionMismatch {
                expected: self.index.dimension(),
                actual: vector.dimensions(),
            });
        }

        let id = record.id.clone();
        let payload = record.to_payload();
        let mut metadata = EntryMetadata::weight(record.weight).keywords(&options.keywords);
        if options.pinned {
            metadata = metadata.pinned();
        }

        self.store.upsert_record(record).await?;
        self.index.add(&id, &vector)?;
        match self.cache.put(&id, payload, metadata) {
            Ok(level) => debug!(record = %id, %level, "Remembered"),
            Err(RecallError::CapacityExceeded { level }) => {
                warn!(record = %id, %level, "Record too large to cache")
            }
            Err(e) => return Err(e),
        }

        let task = options
            .related
            .into_iter()
            .fold(MaintenanceTask::new(id).context(options.context), |task, related| {
                task.related_to(related)
            });
        self.scheduler.submit(task).await
    }

    /// Top-`k` memories similar to `query`.
    pub async fn recall(
        &self,
        query: &Vector,
        k: usize,
        min_similarity: f32,
    ) -> RecallResult<Vec<Recalled>> {
        self.recall_matching(query, k, min_similarity, &[]).await
    }

    /// Like [`recall`](Self::recall); hits whose cache entry carries one of
    /// `keywords` get the keyword bonus when reinforced.
    pub async fn recall_matching(
        &self,
        query: &Vector,
        k: usize,
        min_similarity: f32,
        keywords: &[&str],
    ) -> RecallResult<Vec<Recalled>> {
        let hits = self.index.search(query, k, min_similarity)?;
        let matched: Vec<String> = keywords
            .iter()
            .flat_map(|keyword| self.cache.find_by_keyword(keyword))
            .collect();
        let engine = self.weights.engine();
        let now = Utc::now();

        let mut recalled = Vec::with_capacity(hits.len());
        for hit in hits {
            let level = match self.cache.get(&hit.key) {
                Some(cached) if MemoryRecord::from_payload(&cached.value).is_none() => {
                    warn!(key = %hit.key, "Cached payload is not a record");
                    continue;
                }
                Some(cached) => Some(cached.level),
                None => None,
            };

            let context = if matched.contains(&hit.key) {
                WeightContext::none().keyword_match()
            } else {
                WeightContext::none()
            };
            let reinforce = |current: &MemoryRecord| engine.reinforce(current.weight, context);
            let record = match self.store.update_weight(&hit.key, &reinforce, Some(now)).await {
                Ok(write) => write.after,
                Err(RecallError::NotFound { .. }) => {
                    debug!(key = %hit.key, "Vector has no record, leaving it for reconcile");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match level {
                Some(_) => self.refresh_cached(&record),
                None => self.recache(&record),
            }
            recalled.push(Recalled {
                record,
                similarity: hit.similarity,
                level,
            });
        }
        Ok(recalled)
    }

    /// Bring a cached payload up to date with a freshly written record.
    fn refresh_cached(&self, record: &MemoryRecord) {
        match self.cache.refresh(&record.id, record.to_payload()) {
            Ok(true) => {}
            Ok(false) => trace!(record = %record.id, "Cached payload left as is"),
            Err(e) => debug!(record = %record.id, error = %e, "Could not refresh cached record"),
        }
    }

    fn recache(&self, record: &MemoryRecord) {
        if let Err(e) = self.cache.put(
            &record.id,
            record.to_payload(),
            EntryMetadata::weight(record.weight),
        ) {
            debug!(record = %record.id, error = %e, "Could not re-cache record");
        }
    }

    /// Fetch one record, cache first.
    pub async fn get(&self, id: &str) -> RecallResult<Option<MemoryRecord>> {
        if let Some(record) = self
            .cache
            .get(id)
            .and_then(|cached| MemoryRecord::from_payload(&cached.value))
        {
            return Ok(Some(record));
        }
        let record = self.store.get_record(id).await?;
        if let Some(record) = &record {
            self.recache(record);
        }
        Ok(record)
    }

    /// Remove a memory everywhere: vector first, then cache, then store.
    ///
    /// Returns whether anything was removed. A failure to remove the cache's
    /// persisted artifact is reported after the store delete went through.
    pub async fn forget(&self, id: &str) -> RecallResult<bool> {
        let vector = self.index.remove(id);
        let cached = self.cache.delete(id);
        let stored = self.store.delete_record(id).await?;
        let cached = cached?;
        debug!(record = %id, vector, cached, stored, "Forgot");
        Ok(vector || cached || stored)
    }

    /// Queue a maintenance task directly.
    pub async fn submit(&self, task: MaintenanceTask) -> RecallResult<Submission> {
        self.scheduler.submit(task).await
    }

    /// Wait until queued maintenance work is finished.
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    /// Run one reconcile pass now.
    pub async fn run_maintenance(&self) -> RecallResult<ReconcileReport> {
        self.reconciler.run_pass(Utc::now()).await
    }

    /// Replace the weighting config for every later computation.
    pub fn reload_weights(&self, config: WeightConfig) -> RecallResult<()> {
        self.weights.swap(config)?;
        info!("Reloaded weight config");
        Ok(())
    }

    /// Save the vector checkpoint and flush pending spill writes.
    pub async fn checkpoint(&self) -> RecallResult<()> {
        self.index.save().await?;
        if let Some(spill) = &self.spill {
            spill.flush().await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> RecallResult<CoreStats> {
        Ok(CoreStats {
            cache: self.cache.stats(),
            vectors: self.index.len(),
            tombstone_ratio: self.index.tombstone_ratio(),
            records: self.store.count().await?,
            scheduler: self.scheduler.stats(),
        })
    }

    /// Stop the reconcile loop and the workers, then checkpoint.
    ///
    /// Queued maintenance tasks are cancelled; call
    /// [`wait_idle`](Self::wait_idle) first to let them finish.
    pub async fn shutdown(&self) -> ShutdownReport {
        let grace = self.config.maintenance.shutdown_grace();
        let reconcile_loop = self
            .reconcile_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = reconcile_loop {
            handle.shutdown(grace).await;
        }

        let report = self.scheduler.shutdown_within(grace).await;
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Checkpoint on shutdown failed");
            self.bus.publish(
                &CacheEvent::new(CacheEventKind::Error, CACHE_ID)
                    .metadata(serde_json::json!({"error": e.to_string()})),
            );
        }
        info!(joined = report.joined, aborted = report.aborted, "Memory core stopped");
        report
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Bus carrying every cache and maintenance event.
    pub fn events(&self) -> &Arc<CacheEventBus> {
        &self.bus
    }

    pub fn weights(&self) -> &SharedWeightConfig {
        &self.weights
    }

    pub fn scheduler(&self) -> &MaintenanceScheduler {
        &self.scheduler
    }
}
