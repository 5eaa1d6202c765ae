/// The four-stage maintenance task.
///
/// 1. **Score**: recompute the record's weight from its stored state and
///    write it with `update_weight`; the cached entry is reconciled to the
///    new weight and its payload refreshed.
/// 2. **Summarize**: produce a summary artifact with the [`Summarizer`].
/// 3. **Persist**: write the summary, a `summary_id` annotation on the record
///    and the associations as one [`PersistBatch`]. The record's weight and
///    access time are left to whoever wrote them last.
/// 4. **Publish**: emit a `Maintenance` event carrying the weight update.
///
/// Each stage is caught on its own and recorded in the [`TaskReport`]. Stages
/// 2 and 3 write to different places than stage 1, so their failure leaves
/// the new weight in place. The cancellation flag is checked before every
/// stage.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::summary::{Summarizer, Summary};
use crate::cache::TieredCache;
use crate::error::RecallResult;
use crate::events::{CacheEvent, CacheEventBus, CacheEventKind};
use crate::store::{MemoryStore, PersistBatch};
use crate::types::{Association, AssociationKind, MemoryId, MemoryRecord, Role};
use crate::weight::{SharedWeightConfig, WeightContext, WeightUpdate};

/// Identifier handed out by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Work item for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceTask {
    pub record_id: MemoryId,
    /// Retrieval context for the weight update
    pub context: WeightContext,
    /// Records this one belongs with, earliest first (e.g. the user turn an
    /// assistant turn answers)
    pub related: Vec<MemoryId>,
}

impl MaintenanceTask {
    pub fn new(record_id: impl Into<MemoryId>) -> Self {
        Self {
            record_id: record_id.into(),
            context: WeightContext::none(),
            related: Vec::new(),
        }
    }

    pub fn context(mut self, context: WeightContext) -> Self {
        self.context = context;
        self
    }

    /// Pair with an earlier record.
    pub fn related_to(mut self, id: impl Into<MemoryId>) -> Self {
        self.related.push(id.into());
        self
    }
}

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Score,
    Summarize,
    Persist,
    Publish,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Score, Stage::Summarize, Stage::Persist, Stage::Publish];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Score => "score",
            Stage::Summarize => "summarize",
            Stage::Persist => "persist",
            Stage::Publish => "publish",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum StageOutcome {
    Done,
    Failed(String),
    /// Not run: an earlier stage it depends on failed, or the task was cancelled
    Skipped,
}

/// What happened to one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub record_id: MemoryId,
    /// Set once stage 1 wrote a weight
    #[serde(skip)]
    pub weight: Option<WeightUpdate>,
    pub summary_id: Option<MemoryId>,
    pub stages: Vec<(Stage, StageOutcome)>,
    pub cancelled: bool,
    pub inline: bool,
    pub elapsed_ms: u64,
}

impl TaskReport {
    fn new(task_id: TaskId, record_id: MemoryId) -> Self {
        Self {
            task_id,
            record_id,
            weight: None,
            summary_id: None,
            stages: Vec::with_capacity(Stage::ALL.len()),
            cancelled: false,
            inline: false,
            elapsed_ms: 0,
        }
    }

    /// Outcome of `stage`, if it was reached.
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, outcome)| outcome)
    }

    /// Stages that failed, with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (Stage, &str)> {
        self.stages.iter().filter_map(|(stage, outcome)| match outcome {
            StageOutcome::Failed(error) => Some((*stage, error.as_str())),
            _ => None,
        })
    }

    /// Every stage completed.
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.stages.len() == Stage::ALL.len()
            && self
                .stages
                .iter()
                .all(|(_, outcome)| *outcome == StageOutcome::Done)
    }

    fn record(&mut self, stage: Stage, outcome: StageOutcome) {
        if let StageOutcome::Failed(error) = &outcome {
            warn!(task = %self.task_id, record = %self.record_id, %stage, error, "Maintenance stage failed");
        }
        self.stages.push((stage, outcome));
    }

    fn skip_rest(&mut self) {
        for stage in Stage::ALL {
            if self.outcome(stage).is_none() {
                self.stages.push((stage, StageOutcome::Skipped));
            }
        }
    }
}

/// Runs [`MaintenanceTask`]s against the store, cache and bus.
pub struct Pipeline {
    store: Arc<dyn MemoryStore>,
    weights: SharedWeightConfig,
    summarizer: Arc<dyn Summarizer>,
    bus: Arc<CacheEventBus>,
    cache: Option<Arc<TieredCache>>,
    source: String,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        weights: SharedWeightConfig,
        summarizer: Arc<dyn Summarizer>,
        bus: Arc<CacheEventBus>,
    ) -> Self {
        Self {
            store,
            weights,
            summarizer,
            bus,
            cache: None,
            source: "maintenance".to_string(),
        }
    }

    /// Reconcile this cache after every weight write.
    pub fn with_cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.source = cache.id().to_string();
        self.cache = Some(cache);
        self
    }

    /// Run every stage of `task`.
    pub async fn run(&self, task_id: TaskId, task: MaintenanceTask, cancel: &AtomicBool) -> TaskReport {
        let started = Instant::now();
        let mut report = TaskReport::new(task_id, task.record_id.clone());
        trace!(task = %task_id, record = %task.record_id, "Running maintenance task");

        let mut record = None;
        let mut summary = None;
        for stage in Stage::ALL {
            if cancel.load(Ordering::Acquire) {
                debug!(task = %task_id, %stage, "Maintenance task cancelled");
                report.cancelled = true;
                break;
            }

            let outcome = match stage {
                Stage::Score => match self.score(&task).await {
                    Ok((scored, update)) => {
                        report.weight = Some(update);
                        record = Some(scored);
                        StageOutcome::Done
                    }
                    Err(e) => {
                        report.record(stage, StageOutcome::Failed(e.to_string()));
                        break;
                    }
                },
                Stage::Summarize => match &record {
                    Some(scored) => match self.summarize(scored, &task.related).await {
                        Ok(produced) => {
                            summary = Some(produced);
                            StageOutcome::Done
                        }
                        Err(e) => StageOutcome::Failed(format!("{e:#}")),
                    },
                    None => StageOutcome::Skipped,
                },
                Stage::Persist => match (&record, summary.take()) {
                    (Some(scored), Some((produced, related))) => {
                        match self.persist(scored, produced, &related).await {
                            Ok(summary_id) => {
                                report.summary_id = Some(summary_id);
                                StageOutcome::Done
                            }
                            Err(e) => StageOutcome::Failed(e.to_string()),
                        }
                    }
                    _ => StageOutcome::Skipped,
                },
                Stage::Publish => {
                    self.publish(&report);
                    StageOutcome::Done
                }
            };
            report.record(stage, outcome);
        }

        report.skip_rest();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }

    async fn score(&self, task: &MaintenanceTask) -> RecallResult<(MemoryRecord, WeightUpdate)> {
        let engine = self.weights.engine();
        let now = Utc::now();
        let recompute = |current: &MemoryRecord| engine.compute(current, now, task.context).weight;
        let write = self
            .store
            .update_weight(&task.record_id, &recompute, Some(now))
            .await?;
        let update = engine.compute(&write.before, now, task.context);
        let written = write.after;

        if let Some(cache) = &self.cache {
            if cache.reconcile(&task.record_id, &update).is_some() {
                if let Err(e) = cache.refresh(&task.record_id, written.to_payload()) {
                    debug!(record = %task.record_id, error = %e, "Could not refresh cached record");
                }
            }
        }
        if update.changed_layer() {
            debug!(
                record = %task.record_id,
                from = %update.layer_before,
                to = %update.layer_after,
                weight = update.weight,
                "Record changed layer"
            );
        }
        Ok((written, update))
    }

    /// Summarize with whichever related records still exist; returns their ids
    /// alongside the summary.
    async fn summarize(
        &self,
        record: &MemoryRecord,
        related: &[MemoryId],
    ) -> anyhow::Result<(Summary, Vec<MemoryId>)> {
        let mut turns = Vec::with_capacity(related.len());
        for id in related {
            if let Some(turn) = self.store.get_record(id).await? {
                turns.push(turn);
            }
        }
        let summary = self.summarizer.summarize(record, &turns).await?;
        Ok((summary, turns.into_iter().map(|turn| turn.id).collect()))
    }

    async fn persist(
        &self,
        record: &MemoryRecord,
        summary: Summary,
        related: &[MemoryId],
    ) -> RecallResult<MemoryId> {
        let mut summary_record = MemoryRecord::content_addressed(summary.text, Role::Summary)
            .weight(record.weight)
            .meta("keywords", json!(summary.keywords))
            .meta("source", json!(record.id));
        if let Some(group) = &record.group_id {
            summary_record = summary_record.group(group.clone());
        }
        let summary_id = summary_record.id.clone();

        let mut batch = PersistBatch::new()
            .record(summary_record)
            .annotate(record.id.as_str(), "summary_id", json!(summary_id))
            .association(Association::new(
                record.id.as_str(),
                summary_id.as_str(),
                AssociationKind::SummarizedBy,
                1.0,
            ));
        for id in related {
            batch = batch.association(Association::new(
                id.as_str(),
                summary_id.as_str(),
                AssociationKind::SummarizedBy,
                1.0,
            ));
            if record.role == Role::Assistant {
                batch = batch.association(Association::new(
                    id.as_str(),
                    record.id.as_str(),
                    AssociationKind::DialoguePair,
                    1.0,
                ));
            }
        }

        self.store.persist_batch(batch).await?;
        Ok(summary_id)
    }

    fn publish(&self, report: &TaskReport) {
        let mut metadata = json!({
            "task_id": report.task_id.0,
            "summary_id": report.summary_id,
            "failed_stages": report.failures().map(|(stage, _)| stage.as_str()).collect::<Vec<_>>(),
        });
        if let Some(update) = &report.weight {
            metadata["previous"] = json!(update.previous);
            metadata["weight"] = json!(update.weight);
            metadata["layer_before"] = json!(update.layer_before.as_str());
            metadata["layer_after"] = json!(update.layer_after.as_str());
            metadata["eviction_candidate"] = json!(update.eviction_candidate);
        }
        self.bus.publish(
            &CacheEvent::new(CacheEventKind::Maintenance, self.source.as_str())
                .key(report.record_id.as_str())
                .metadata(metadata),
        );
    }
}
