/// The database collaborator boundary.
///
/// The relational store that holds records and associations lives outside
/// this crate; [`MemoryStore`] is the interface the cache, the maintenance
/// pipeline and the memory core talk to. [`InMemoryStore`] is a complete
/// implementation for tests, embedded use, and as a reference for adapters.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{RecallError, RecallResult};
use crate::persistence::write_atomic;
use crate::types::{Association, AssociationKind, MemoryId, MemoryRecord, Role};

/// Default page size for [`RecordFilter`].
pub const DEFAULT_PAGE: usize = 100;

/// Ordering of a query page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Heaviest first
    #[default]
    Weight,
    /// Most recently accessed first
    Recency,
}

/// A bounded, sorted page request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub sort: SortOrder,
    pub limit: usize,
    /// Matching records skipped before the page starts
    #[serde(default)]
    pub offset: usize,
    pub min_weight: Option<f64>,
    pub group: Option<String>,
    pub role: Option<Role>,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self {
            sort: SortOrder::Weight,
            limit: DEFAULT_PAGE,
            offset: 0,
            min_weight: None,
            group: None,
            role: None,
        }
    }
}

impl RecordFilter {
    /// Heaviest records first.
    pub fn by_weight(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Most recently accessed first.
    pub fn by_recency(limit: usize) -> Self {
        Self {
            sort: SortOrder::Recency,
            limit,
            ..Self::default()
        }
    }

    /// Start the page after `offset` matching records.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn min_weight(mut self, weight: f64) -> Self {
        self.min_weight = Some(weight);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Whether a record passes the filter (ignores sort and limit).
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        self.min_weight.is_none_or(|min| record.weight >= min)
            && self
                .group
                .as_ref()
                .is_none_or(|group| record.group_id.as_ref() == Some(group))
            && self.role.is_none_or(|role| record.role == role)
    }

    /// Sort, skip `offset`, and truncate a set of matching records.
    pub fn page(&self, mut records: Vec<MemoryRecord>) -> Vec<MemoryRecord> {
        match self.sort {
            SortOrder::Weight => records.sort_by(|a, b| {
                b.weight
                    .total_cmp(&a.weight)
                    .then(a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            }),
            SortOrder::Recency => records.sort_by(|a, b| {
                b.last_accessed_at
                    .cmp(&a.last_accessed_at)
                    .then_with(|| a.id.cmp(&b.id))
            }),
        }
        records
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

/// One metadata entry merged into an existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub record_id: MemoryId,
    pub key: String,
    pub value: JsonValue,
}

/// Records, metadata and edges written together by the maintenance pipeline.
///
/// Annotations touch only the named metadata key, so weight and access time
/// written concurrently by other paths survive the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistBatch {
    pub records: Vec<MemoryRecord>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    pub associations: Vec<Association>,
}

impl PersistBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(mut self, record: MemoryRecord) -> Self {
        self.records.push(record);
        self
    }

    /// Merge `key = value` into the metadata of an existing record.
    pub fn annotate(mut self, record_id: impl Into<MemoryId>, key: impl Into<String>, value: JsonValue) -> Self {
        self.annotations.push(Annotation {
            record_id: record_id.into(),
            key: key.into(),
            value,
        });
        self
    }

    pub fn association(mut self, association: Association) -> Self {
        self.associations.push(association);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.annotations.is_empty() && self.associations.is_empty()
    }
}

/// A weight written by [`MemoryStore::update_weight`].
#[derive(Debug, Clone, PartialEq)]
pub struct WeightWrite {
    /// The record as it was read
    pub before: MemoryRecord,
    /// The record as written
    pub after: MemoryRecord,
}

/// Computes a new weight from the current record.
pub type Reweigh<'a> = &'a (dyn Fn(&MemoryRecord) -> f64 + Send + Sync);

/// Persistent storage for records and associations.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Fetch one record.
    async fn get_record(&self, id: &str) -> RecallResult<Option<MemoryRecord>>;

    /// Insert or replace a record.
    async fn upsert_record(&self, record: MemoryRecord) -> RecallResult<()>;

    /// Write a new weight and access time. `NotFound` if the record is absent.
    async fn record_access(
        &self,
        id: &str,
        weight: f64,
        at: DateTime<Utc>,
    ) -> RecallResult<MemoryRecord>;

    /// Recompute a weight from the record's current state and write it,
    /// touching the access time when `touched_at` is given. `NotFound` if the
    /// record is absent.
    ///
    /// The default reads, then writes through [`record_access`](Self::record_access),
    /// so a write landing in between is lost; stores that can lock a row
    /// should override it.
    async fn update_weight(
        &self,
        id: &str,
        reweigh: Reweigh<'_>,
        touched_at: Option<DateTime<Utc>>,
    ) -> RecallResult<WeightWrite> {
        let before = self
            .get_record(id)
            .await?
            .ok_or_else(|| RecallError::NotFound { key: id.to_string() })?;
        let weight = reweigh(&before);
        let at = touched_at.unwrap_or(before.last_accessed_at);
        let after = self.record_access(id, weight, at).await?;
        Ok(WeightWrite { before, after })
    }

    /// Create an edge. Returns false if an edge with the same identity exists
    /// (its strength is updated).
    async fn create_association(&self, association: Association) -> RecallResult<bool>;

    /// A bounded, sorted page of records.
    async fn query(&self, filter: &RecordFilter) -> RecallResult<Vec<MemoryRecord>>;

    /// Remove a record and its edges. Returns whether it existed.
    async fn delete_record(&self, id: &str) -> RecallResult<bool>;

    /// Edges touching `id` in either direction.
    async fn associations_of(&self, id: &str) -> RecallResult<Vec<Association>>;

    /// Number of records.
    async fn count(&self) -> RecallResult<usize>;

    /// Write a batch. The default writes sequentially and stops at the first
    /// error, so a partial batch may remain; stores with transactions should
    /// override it.
    async fn persist_batch(&self, batch: PersistBatch) -> RecallResult<()> {
        for record in batch.records {
            self.upsert_record(record).await?;
        }
        for annotation in batch.annotations {
            let mut record = self
                .get_record(&annotation.record_id)
                .await?
                .ok_or(RecallError::NotFound {
                    key: annotation.record_id,
                })?;
            record.metadata.insert(annotation.key, annotation.value);
            self.upsert_record(record).await?;
        }
        for association in batch.associations {
            self.create_association(association).await?;
        }
        Ok(())
    }
}

type EdgeKey = (MemoryId, MemoryId, AssociationKind);

fn edge_key(association: &Association) -> EdgeKey {
    (
        association.from.clone(),
        association.to.clone(),
        association.kind,
    )
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    records: Vec<MemoryRecord>,
    associations: Vec<Association>,
}

/// DashMap-backed store.
///
/// Batches are validated in full before anything is applied, so a rejected
/// batch leaves no trace.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<MemoryId, MemoryRecord>,
    associations: DashMap<EdgeKey, Association>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_endpoints(&self, association: &Association, pending: &[MemoryRecord]) -> RecallResult<()> {
        for id in [&association.from, &association.to] {
            if !self.records.contains_key(id) && !pending.iter().any(|r| &r.id == id) {
                return Err(RecallError::NotFound { key: id.clone() });
            }
        }
        Ok(())
    }

    fn put_edge(&self, association: Association) -> bool {
        let key = edge_key(&association);
        match self.associations.get_mut(&key) {
            Some(mut existing) => {
                existing.strength = association.strength;
                false
            }
            None => {
                self.associations.insert(key, association);
                true
            }
        }
    }

    /// Write every record and edge to a JSON file (temp file, then rename).
    pub async fn save(&self, path: &Path) -> RecallResult<()> {
        let mut snapshot = Snapshot {
            records: self.records.iter().map(|e| e.value().clone()).collect(),
            associations: self.associations.iter().map(|e| e.value().clone()).collect(),
        };
        snapshot.records.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
            .associations
            .sort_by(|a, b| edge_key(a).cmp(&edge_key(b)));
        write_atomic(path, &serde_json::to_vec(&snapshot)?).await?;

        info!(
            path = %path.display(),
            records = snapshot.records.len(),
            associations = snapshot.associations.len(),
            "Saved memory store"
        );
        Ok(())
    }

    /// Load a store written by [`save`](Self::save).
    pub async fn load(path: &Path) -> RecallResult<Self> {
        let bytes = fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        let store = Self::new();
        for record in snapshot.records {
            store.records.insert(record.id.clone(), record);
        }
        for association in snapshot.associations {
            store.associations.insert(edge_key(&association), association);
        }
        info!(path = %path.display(), records = store.records.len(), "Loaded memory store");
        Ok(store)
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get_record(&self, id: &str) -> RecallResult<Option<MemoryRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn upsert_record(&self, record: MemoryRecord) -> RecallResult<()> {
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn record_access(
        &self,
        id: &str,
        weight: f64,
        at: DateTime<Utc>,
    ) -> RecallResult<MemoryRecord> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| RecallError::NotFound { key: id.to_string() })?;
        record.set_weight(weight);
        record.touch(at);
        Ok(record.clone())
    }

    async fn update_weight(
        &self,
        id: &str,
        reweigh: Reweigh<'_>,
        touched_at: Option<DateTime<Utc>>,
    ) -> RecallResult<WeightWrite> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| RecallError::NotFound { key: id.to_string() })?;
        let before = record.clone();
        record.set_weight(reweigh(&before));
        if let Some(at) = touched_at {
            record.touch(at);
        }
        Ok(WeightWrite {
            before,
            after: record.clone(),
        })
    }

    async fn create_association(&self, association: Association) -> RecallResult<bool> {
        self.ensure_endpoints(&association, &[])?;
        Ok(self.put_edge(association))
    }

    async fn query(&self, filter: &RecordFilter) -> RecallResult<Vec<MemoryRecord>> {
        let matching = self
            .records
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(filter.page(matching))
    }

    async fn delete_record(&self, id: &str) -> RecallResult<bool> {
        let existed = self.records.remove(id).is_some();
        self.associations
            .retain(|(from, to, _), _| from != id && to != id);
        Ok(existed)
    }

    async fn associations_of(&self, id: &str) -> RecallResult<Vec<Association>> {
        let mut edges: Vec<Association> = self
            .associations
            .iter()
            .filter(|entry| entry.from == id || entry.to == id)
            .map(|entry| entry.value().clone())
            .collect();
        edges.sort_by(|a, b| edge_key(a).cmp(&edge_key(b)));
        Ok(edges)
    }

    async fn count(&self) -> RecallResult<usize> {
        Ok(self.records.len())
    }

    async fn persist_batch(&self, batch: PersistBatch) -> RecallResult<()> {
        for association in &batch.associations {
            self.ensure_endpoints(association, &batch.records)?;
        }
        for annotation in &batch.annotations {
            let id = &annotation.record_id;
            if !self.records.contains_key(id) && !batch.records.iter().any(|r| &r.id == id) {
                return Err(RecallError::NotFound { key: id.clone() });
            }
        }
        debug!(
            records = batch.records.len(),
            annotations = batch.annotations.len(),
            associations = batch.associations.len(),
            "Applying batch"
        );
        for record in batch.records {
            self.records.insert(record.id.clone(), record);
        }
        for annotation in batch.annotations {
            if let Some(mut record) = self.records.get_mut(&annotation.record_id) {
                record.metadata.insert(annotation.key, annotation.value);
            }
        }
        for association in batch.associations {
            self.put_edge(association);
        }
        Ok(())
    }
}
