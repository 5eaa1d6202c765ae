//! Keyed similarity index.
//!
//! [`VectorIndex`] maps string keys to fixed-dimension vectors and answers
//! top-k queries ordered by `exp(-euclidean_distance)`. The actual storage is
//! an [`AnnBackend`]: [`FlatBackend`] for exact search or [`GraphBackend`]
//! for HNSW-style approximate search.
//!
//! Ties in similarity are broken by insertion order. Every key carries a
//! sequence number assigned on first insertion; it survives swap-removes,
//! compaction and checkpoints.
//!
//! # Example
//!
//! ```ignore
//! use koru_recall::vector::{IndexConfig, Vector, VectorIndex};
//!
//! let index = VectorIndex::new(IndexConfig::flat(3))?;
//! index.add("turn-1", &Vector::new(vec![0.1, 0.2, 0.3], "mini-lm"))?;
//!
//! let query = Vector::new(vec![0.1, 0.2, 0.25], "mini-lm");
//! for hit in index.search(&query, 5, 0.5)? {
//!     println!("{}: {:.3}", hit.key, hit.similarity);
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, trace};

use super::backend::{AnnBackend, IndexKind, Removal};
use super::checkpoint::{self, FORMAT_VERSION, IndexBlob};
use super::flat::FlatBackend;
use super::graph::{GraphBackend, GraphConfig};
use super::types::{SearchHit, Vector, similarity_from_distance};
use crate::error::{RecallError, RecallResult};

/// Index configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Fixed vector dimensionality
    pub dimension: usize,
    /// Backend kind
    pub kind: IndexKind,
    /// Graph parameters, used when `kind` is `Graph`
    pub graph: GraphConfig,
    /// Base path for `save` / `load`
    pub checkpoint_path: PathBuf,
    /// Compaction kicks in once this share of slots is tombstoned
    pub compact_tombstone_ratio: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            kind: IndexKind::Flat,
            graph: GraphConfig::default(),
            checkpoint_path: default_checkpoint_path(),
            compact_tombstone_ratio: 0.2,
        }
    }
}

impl IndexConfig {
    /// Exact index of the given dimension.
    pub fn flat(dimension: usize) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }

    /// Graph index of the given dimension.
    pub fn graph(dimension: usize) -> Self {
        Self {
            dimension,
            kind: IndexKind::Graph,
            ..Self::default()
        }
    }

    /// Set the checkpoint base path.
    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = path.into();
        self
    }

    /// Check ranges.
    pub fn validate(&self) -> RecallResult<()> {
        if self.dimension == 0 {
            return Err(RecallError::InvalidConfig(
                "index dimension must be positive".into(),
            ));
        }
        if !(self.compact_tombstone_ratio > 0.0 && self.compact_tombstone_ratio <= 1.0) {
            return Err(RecallError::InvalidConfig(format!(
                "compact_tombstone_ratio must be in (0, 1], got {}",
                self.compact_tombstone_ratio
            )));
        }
        if self.graph.m < 2 || self.graph.ef_construction == 0 || self.graph.ef_search == 0 {
            return Err(RecallError::InvalidConfig(
                "graph needs m >= 2 and positive ef values".into(),
            ));
        }
        Ok(())
    }
}

/// `<data dir>/koru-recall/vectors`, or `./koru-recall/vectors`.
pub fn default_checkpoint_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("koru-recall")
        .join("vectors")
}

/// Outcome of a checkpoint load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    /// Base path that was read
    pub source: PathBuf,
    /// Whether a checkpoint existed there
    pub found: bool,
    /// Vectors now in the index
    pub restored: usize,
    /// Keys that had to be reconstructed as `unknown_{i}`
    pub reconstructed_keys: usize,
}

#[derive(Debug, Clone)]
struct Slot {
    key: String,
    model: String,
    seq: u64,
}

struct IndexState {
    backend: Box<dyn AnnBackend>,
    /// position -> slot; None for tombstones
    slots: Vec<Option<Slot>>,
    positions: HashMap<String, usize>,
    next_seq: u64,
}

impl IndexState {
    fn new(config: &IndexConfig) -> Self {
        let backend: Box<dyn AnnBackend> = match config.kind {
            IndexKind::Flat => Box::new(FlatBackend::new(config.dimension)),
            IndexKind::Graph => Box::new(GraphBackend::new(config.dimension, config.graph)),
        };
        Self {
            backend,
            slots: Vec::new(),
            positions: HashMap::new(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, key: &str, data: &[f32], model: &str, seq: Option<u64>) {
        let previous_seq = self.remove(key);
        let seq = seq.or(previous_seq).unwrap_or(self.next_seq);
        self.next_seq = self.next_seq.max(seq + 1);

        let position = self.backend.push(data);
        let slot = Slot {
            key: key.to_string(),
            model: model.to_string(),
            seq,
        };
        if position == self.slots.len() {
            self.slots.push(Some(slot));
        } else {
            self.slots[position] = Some(slot);
        }
        self.positions.insert(key.to_string(), position);
    }

    /// Remove a key, returning its sequence number.
    fn remove(&mut self, key: &str) -> Option<u64> {
        let position = self.positions.remove(key)?;
        let seq = self.slots[position].as_ref().map(|slot| slot.seq);

        match self.backend.remove(position) {
            Removal::SwapRemoved { moved_from } => {
                self.slots.swap_remove(position);
                if moved_from.is_some() {
                    if let Some(Some(moved)) = self.slots.get(position) {
                        self.positions.insert(moved.key.clone(), position);
                    }
                }
            }
            Removal::Tombstoned => self.slots[position] = None,
        }
        seq
    }

    fn compact(&mut self) -> usize {
        let dropped = self.backend.tombstones();
        if dropped == 0 {
            return 0;
        }
        let mapping = self.backend.rebuild();
        let mut slots = vec![None; self.backend.slots()];
        for (old, new) in mapping.into_iter().enumerate() {
            if let (Some(new), Some(slot)) = (new, self.slots[old].take()) {
                slots[new] = Some(slot);
            }
        }
        self.slots = slots;
        self.positions = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(position, slot)| slot.as_ref().map(|s| (s.key.clone(), position)))
            .collect();
        dropped
    }

    fn blob(&self) -> (IndexBlob, Vec<String>) {
        let mut vectors = Vec::with_capacity(self.positions.len());
        let mut models = Vec::with_capacity(self.positions.len());
        let mut seqs = Vec::with_capacity(self.positions.len());
        let mut keys = Vec::with_capacity(self.positions.len());

        for (position, slot) in self.slots.iter().enumerate() {
            let (Some(slot), Some(vector)) = (slot, self.backend.vector(position)) else {
                continue;
            };
            vectors.push(vector.to_vec());
            models.push(slot.model.clone());
            seqs.push(slot.seq);
            keys.push(slot.key.clone());
        }

        let blob = IndexBlob {
            format: FORMAT_VERSION,
            kind: self.backend.kind(),
            dimension: self.backend.dimension(),
            vectors,
            models,
            seqs,
        };
        (blob, keys)
    }
}

/// Thread-safe keyed vector index.
pub struct VectorIndex {
    config: IndexConfig,
    state: RwLock<IndexState>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.config.dimension)
            .field("kind", &self.config.kind)
            .field("len", &self.len())
            .finish()
    }
}

impl VectorIndex {
    /// Create an empty index.
    pub fn new(config: IndexConfig) -> RecallResult<Self> {
        config.validate()?;
        let state = IndexState::new(&config);
        Ok(Self {
            config,
            state: RwLock::new(state),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_dimension(&self, actual: usize) -> RecallResult<()> {
        if actual != self.config.dimension {
            return Err(RecallError::DimensionMismatch {
                expected: self.config.dimension,
                actual,
            });
        }
        Ok(())
    }

    /// The index configuration.
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Vector dimensionality.
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Backend kind.
    pub fn index_kind(&self) -> IndexKind {
        self.config.kind
    }

    /// Add or replace the vector for `key`.
    pub fn add(&self, key: &str, vector: &Vector) -> RecallResult<()> {
        self.check_dimension(vector.dimensions())?;
        self.write()
            .insert(key, vector.as_slice(), vector.model(), None);
        trace!(key, "Indexed vector");
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.write().remove(key).is_some();
        if removed {
            trace!(key, "Removed vector");
        }
        removed
    }

    /// Top `k` keys by similarity, at least `min_similarity`.
    ///
    /// Results are in descending similarity; equal similarities keep
    /// insertion order.
    pub fn search(
        &self,
        query: &Vector,
        k: usize,
        min_similarity: f32,
    ) -> RecallResult<Vec<SearchHit>> {
        self.check_dimension(query.dimensions())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let state = self.read();
        let mut scored: Vec<(f32, u64, &str)> = state
            .backend
            .candidates(query.as_slice(), k)
            .into_iter()
            .filter_map(|(position, distance)| {
                let slot = state.slots.get(position)?.as_ref()?;
                let similarity = similarity_from_distance(distance);
                (similarity >= min_similarity).then_some((similarity, slot.seq, slot.key.as_str()))
            })
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);
        Ok(scored
            .into_iter()
            .map(|(similarity, _, key)| SearchHit::new(key, similarity))
            .collect())
    }

    /// Vector stored under `key`.
    pub fn get(&self, key: &str) -> Option<Vector> {
        let state = self.read();
        let position = *state.positions.get(key)?;
        let slot = state.slots.get(position)?.as_ref()?;
        let data = state.backend.vector(position)?;
        Some(Vector::new(data.to_vec(), slot.model.clone()))
    }

    /// Whether `key` is indexed.
    pub fn contains(&self, key: &str) -> bool {
        self.read().positions.contains_key(key)
    }

    /// Live keys in position order.
    pub fn keys(&self) -> Vec<String> {
        self.read()
            .slots
            .iter()
            .flatten()
            .map(|slot| slot.key.clone())
            .collect()
    }

    /// Number of live vectors.
    pub fn len(&self) -> usize {
        self.read().positions.len()
    }

    /// Whether no vectors are indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Share of backend slots that are tombstones.
    pub fn tombstone_ratio(&self) -> f64 {
        let state = self.read();
        let slots = state.backend.slots();
        if slots == 0 {
            0.0
        } else {
            state.backend.tombstones() as f64 / slots as f64
        }
    }

    /// Whether the tombstone ratio calls for [`compact`](Self::compact).
    pub fn needs_compaction(&self) -> bool {
        self.tombstone_ratio() > self.config.compact_tombstone_ratio
    }

    /// Rebuild the backend without tombstones. Returns how many were dropped.
    ///
    /// Holds the write lock for the whole rebuild; run it from maintenance,
    /// not from the request path.
    pub fn compact(&self) -> usize {
        let dropped = self.write().compact();
        if dropped > 0 {
            info!(dropped, "Compacted vector index");
        }
        dropped
    }

    /// Remove every vector.
    pub fn clear(&self) {
        let mut state = self.write();
        state.backend.clear();
        state.slots.clear();
        state.positions.clear();
    }

    /// Save to the configured checkpoint path.
    pub async fn save(&self) -> RecallResult<()> {
        self.save_to(&self.config.checkpoint_path).await
    }

    /// Save to an explicit base path.
    pub async fn save_to(&self, base: &Path) -> RecallResult<()> {
        // Snapshot under the lock, write without it.
        let (blob, keys) = self.read().blob();
        checkpoint::write(base, &blob, &keys).await?;
        info!(path = %base.display(), vectors = keys.len(), "Saved vector index");
        Ok(())
    }

    /// Load from the configured checkpoint path.
    pub async fn load(&self) -> RecallResult<LoadReport> {
        let base = self.config.checkpoint_path.clone();
        self.load_from(&base).await
    }

    /// Replace the index contents with the checkpoint at `base`.
    ///
    /// A missing checkpoint leaves the index untouched. A checkpoint of a
    /// different backend kind is rebuilt into this index's backend.
    pub async fn load_from(&self, base: &Path) -> RecallResult<LoadReport> {
        let Some(checkpoint) = checkpoint::read(base).await? else {
            debug!(path = %base.display(), "No vector checkpoint found");
            return Ok(LoadReport {
                source: base.to_path_buf(),
                found: false,
                restored: self.len(),
                reconstructed_keys: 0,
            });
        };

        self.check_dimension(checkpoint.blob.dimension)?;
        if checkpoint.blob.kind != self.config.kind {
            debug!(
                from = %checkpoint.blob.kind,
                to = %self.config.kind,
                "Rebuilding checkpoint into a different backend"
            );
        }

        let mut state = IndexState::new(&self.config);
        let blob = &checkpoint.blob;
        for (i, key) in checkpoint.keys.iter().enumerate() {
            state.insert(key, &blob.vectors[i], &blob.models[i], Some(blob.seqs[i]));
        }
        let restored = state.positions.len();
        *self.write() = state;

        info!(
            path = %base.display(),
            restored,
            reconstructed = checkpoint.reconstructed_keys,
            "Loaded vector index"
        );
        Ok(LoadReport {
            source: base.to_path_buf(),
            found: true,
            restored,
            reconstructed_keys: checkpoint.reconstructed_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn v(data: &[f32]) -> Vector {
        Vector::new(data.to_vec(), "test")
    }

    fn flat(dim: usize) -> VectorIndex {
        VectorIndex::new(IndexConfig::flat(dim)).unwrap()
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let index = flat(3);
        let err = index.add("a", &v(&[1.0, 2.0])).unwrap_err();
        assert!(matches!(
            err,
            RecallError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert!(index.is_empty());
        assert!(index.search(&v(&[1.0]), 3, 0.0).is_err());
    }

    #[test]
    fn test_search_ordering_and_threshold() {
        let index = flat(2);
        index.add("far", &v(&[3.0, 4.0])).unwrap();
        index.add("near", &v(&[0.1, 0.0])).unwrap();
        index.add("exact", &v(&[0.0, 0.0])).unwrap();

        let hits = index.search(&v(&[0.0, 0.0]), 10, 0.0).unwrap();
        let keys: Vec<&str> = hits.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["exact", "near", "far"]);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert!((hits[2].similarity - (-5.0f32).exp()).abs() < 1e-6);

        let hits = index.search(&v(&[0.0, 0.0]), 10, 0.5).unwrap();
        assert_eq!(hits.len(), 2);

        let hits = index.search(&v(&[0.0, 0.0]), 1, 0.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(index.search(&v(&[0.0, 0.0]), 0, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let index = flat(1);
        index.add("b", &v(&[1.0])).unwrap();
        index.add("a", &v(&[-1.0])).unwrap();
        index.add("c", &v(&[1.0])).unwrap();
        // Swap-remove moves "c" into position 0; its order must not change.
        index.remove("b");
        index.add("b", &v(&[1.0])).unwrap();

        let hits = index.search(&v(&[0.0]), 3, 0.0).unwrap();
        let keys: Vec<&str> = hits.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_replace_keeps_one_entry() {
        let index = flat(2);
        index.add("k", &v(&[1.0, 1.0])).unwrap();
        index.add("k", &v(&[2.0, 2.0])).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("k").unwrap().as_slice(), &[2.0, 2.0]);
    }

    #[test]
    fn test_remove_swaps_positions() {
        let index = flat(1);
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            index.add(key, &v(&[i as f32])).unwrap();
        }
        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert_eq!(index.len(), 3);
        assert_eq!(index.get("d").unwrap().as_slice(), &[3.0]);
        assert_eq!(index.get("b").unwrap().as_slice(), &[1.0]);
        assert!(!index.contains("a"));

        let hits = index.search(&v(&[0.0]), 10, 0.0).unwrap();
        assert!(hits.iter().all(|h| h.key != "a"));
    }

    #[test]
    fn test_graph_tombstones_and_compact() {
        let index = VectorIndex::new(IndexConfig::graph(2)).unwrap();
        for i in 0..20 {
            index.add(&format!("k{i}"), &v(&[i as f32, 0.0])).unwrap();
        }
        for i in 0..10 {
            assert!(index.remove(&format!("k{i}")));
        }
        assert_eq!(index.len(), 10);
        assert!((index.tombstone_ratio() - 0.5).abs() < 1e-9);
        assert!(index.needs_compaction());

        let hits = index.search(&v(&[0.0, 0.0]), 20, 0.0).unwrap();
        assert_eq!(hits.len(), 10);
        assert_eq!(hits[0].key, "k10");

        assert_eq!(index.compact(), 10);
        assert_eq!(index.tombstone_ratio(), 0.0);
        assert_eq!(index.len(), 10);
        assert_eq!(index.get("k15").unwrap().as_slice(), &[15.0, 0.0]);
        let hits = index.search(&v(&[15.0, 0.0]), 1, 0.0).unwrap();
        assert_eq!(hits[0].key, "k15");
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("vectors");
        let index = flat(2);
        index.add("x", &v(&[1.0, 0.0])).unwrap();
        index.add("y", &v(&[0.0, 1.0])).unwrap();
        index.save_to(&base).await.unwrap();

        let restored = flat(2);
        let report = restored.load_from(&base).await.unwrap();
        assert!(report.found);
        assert_eq!(report.restored, 2);
        assert_eq!(report.reconstructed_keys, 0);
        assert_eq!(restored.keys(), index.keys());

        let hits = restored.search(&v(&[1.0, 0.0]), 1, 0.0).unwrap();
        assert_eq!(hits[0].key, "x");
    }

    #[tokio::test]
    async fn test_load_wrong_dimension() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("vectors");
        let index = flat(2);
        index.add("x", &v(&[1.0, 0.0])).unwrap();
        index.save_to(&base).await.unwrap();

        let other = flat(3);
        assert!(matches!(
            other.load_from(&base).await,
            Err(RecallError::DimensionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let index = flat(2);
        let report = index.load_from(&dir.path().join("none")).await.unwrap();
        assert!(!report.found);
        assert_eq!(report.restored, 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(IndexConfig::flat(0).validate().is_err());
        let mut config = IndexConfig::graph(8);
        config.compact_tombstone_ratio = 0.0;
        assert!(VectorIndex::new(config).is_err());
        assert!(IndexConfig::default().validate().is_ok());
    }
}
