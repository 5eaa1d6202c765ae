/// System-wide reconciliation pass.
///
/// Per-record tasks only touch the record they were submitted for. The
/// reconciler sweeps every record, one page at a time, on a timer, re-applies the
/// weight function, moves cache entries to the level their new weight implies
/// and evicts the ones that fell to the eviction threshold. The same pass
/// drops vectors whose record no longer exists and compacts the index once
/// tombstones pile up, so the index and cache converge after every pass.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::cache::{Reconciled, TieredCache};
use crate::error::{RecallError, RecallResult};
use crate::events::{CacheEvent, CacheEventBus, CacheEventKind};
use crate::store::{MemoryStore, RecordFilter};
use crate::types::{MemoryId, MemoryRecord};
use crate::vector::VectorIndex;
use crate::weight::{SharedWeightConfig, WeightContext};

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Records re-weighted or confirmed
    pub scanned: usize,
    /// Records whose weight changed and was written back
    pub reweighted: usize,
    /// Cache entries moved to another level
    pub moved: usize,
    /// Cache entries evicted as eviction candidates
    pub evicted: usize,
    /// Vectors dropped because their record is gone
    pub dangling_removed: usize,
    /// Tombstones dropped by compaction
    pub compacted: usize,
    pub elapsed_ms: u64,
}

/// Re-weights records and brings cache and index in line with them.
pub struct Reconciler {
    store: Arc<dyn MemoryStore>,
    weights: SharedWeightConfig,
    cache: Arc<TieredCache>,
    index: Arc<VectorIndex>,
    bus: Arc<CacheEventBus>,
    batch: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        weights: SharedWeightConfig,
        cache: Arc<TieredCache>,
        index: Arc<VectorIndex>,
        bus: Arc<CacheEventBus>,
    ) -> Self {
        Self {
            store,
            weights,
            cache,
            index,
            bus,
            batch: 500,
        }
    }

    /// Page size used to walk the store.
    pub fn batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Run one pass as of `now`.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> RecallResult<ReconcileReport> {
        let started = Instant::now();
        let mut report = ReconcileReport::default();
        let engine = self.weights.engine();

        for id in self.record_ids().await? {
            let recompute = |current: &MemoryRecord| engine.compute(current, now, WeightContext::none()).weight;
            let write = match self.store.update_weight(&id, &recompute, None).await {
                Ok(write) => write,
                Err(RecallError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            report.scanned += 1;
            let update = engine.compute(&write.before, now, WeightContext::none());
            let changed = write.after.weight != write.before.weight;
            if changed {
                report.reweighted += 1;
            }
            match self.cache.reconcile(&id, &update) {
                Some(Reconciled::Moved { .. }) => report.moved += 1,
                Some(Reconciled::Evicted) => report.evicted += 1,
                Some(Reconciled::Unchanged) | None => {}
            }
            if changed {
                if let Err(e) = self.cache.refresh(&id, write.after.to_payload()) {
                    debug!(record = %id, error = %e, "Could not refresh cached record");
                }
            }
        }

        for key in self.index.keys() {
            if self.store.get_record(&key).await?.is_none() && self.index.remove(&key) {
                debug!(key = %key, "Removed dangling vector");
                report.dangling_removed += 1;
            }
        }
        if self.index.needs_compaction() {
            report.compacted = self.index.compact();
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            scanned = report.scanned,
            reweighted = report.reweighted,
            moved = report.moved,
            evicted = report.evicted,
            dangling = report.dangling_removed,
            "Reconcile pass complete"
        );
        self.bus.publish(
            &CacheEvent::new(CacheEventKind::Maintenance, self.cache.id())
                .metadata(serde_json::to_value(&report)?),
        );
        Ok(report)
    }

    /// Every record id, read page by page before any weight is written so a
    /// record that sinks during the pass is not visited twice.
    async fn record_ids(&self) -> RecallResult<Vec<MemoryId>> {
        let mut ids = Vec::new();
        loop {
            let page = self
                .store
                .query(&RecordFilter::by_weight(self.batch).offset(ids.len()))
                .await?;
            let full = page.len() == self.batch;
            ids.extend(page.into_iter().map(|record| record.id));
            if !full {
                return Ok(ids);
            }
        }
    }

    /// Run a pass every `period` until the handle is stopped. The first pass
    /// runs one period from now.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration) -> ReconcileHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = tokio::spawn(async move {
            let mut ticks = interval(period);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = self.run_pass(Utc::now()).await {
                    warn!(error = %e, "Reconcile pass failed");
                    self.bus.publish(
                        &CacheEvent::new(CacheEventKind::Error, self.cache.id())
                            .metadata(serde_json::json!({"error": e.to_string()})),
                    );
                }
            }
            debug!("Reconcile loop stopped");
        });

        ReconcileHandle { stop, handle }
    }
}

/// Handle to a periodic reconcile loop.
#[derive(Debug)]
pub struct ReconcileHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ReconcileHandle {
    /// Ask the loop to stop after its current pass.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stop and wait up to `grace`; abort if the loop doesn't finish in time.
    pub async fn shutdown(self, grace: Duration) {
        self.stop();
        let mut handle = self.handle;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            handle.abort();
        }
    }
}
