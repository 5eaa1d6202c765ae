//! Storage backends behind [`VectorIndex`](super::VectorIndex).
//!
//! A backend only knows positions and raw vectors; the index owns the
//! key ↔ position mapping. Backends are mutated exclusively through the
//! index's write lock, so they carry no locks of their own.

use serde::{Deserialize, Serialize};

/// Which backend an index uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Exact brute-force search, O(1) swap-remove
    Flat,
    /// HNSW-style graph, tombstoned removal plus periodic rebuild
    Graph,
}

impl IndexKind {
    /// Name written into checkpoint sidecars.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Flat => "flat",
            IndexKind::Graph => "graph",
        }
    }

    /// Parse a sidecar name. Unknown names fall back to None.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "flat" | "IndexFlatL2" | "exact" => Some(IndexKind::Flat),
            "graph" | "hnsw" | "IndexHNSWFlat" => Some(IndexKind::Graph),
            _ => None,
        }
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a removal did to the position space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The last slot moved into the removed position.
    ///
    /// `moved_from` is the old position of the moved entry, None when the
    /// removed position was already the last one.
    SwapRemoved { moved_from: Option<usize> },
    /// The slot stays occupied but is excluded from results until rebuild.
    Tombstoned,
}

/// A position-addressed vector store with nearest-neighbour lookup.
pub trait AnnBackend: Send + Sync {
    /// Backend kind.
    fn kind(&self) -> IndexKind;

    /// Fixed dimensionality.
    fn dimension(&self) -> usize;

    /// Append a vector of the right dimension, returning its position.
    fn push(&mut self, vector: &[f32]) -> usize;

    /// Remove the vector at `position`.
    fn remove(&mut self, position: usize) -> Removal;

    /// Unordered `(position, distance)` candidates.
    ///
    /// Contains the `k` nearest live entries for exact backends and an
    /// approximation of them for graph backends. Removed entries never appear.
    fn candidates(&self, query: &[f32], k: usize) -> Vec<(usize, f32)>;

    /// Vector stored at a live position.
    fn vector(&self, position: usize) -> Option<&[f32]>;

    /// Number of positions, tombstones included.
    fn slots(&self) -> usize;

    /// Number of tombstoned positions.
    fn tombstones(&self) -> usize {
        0
    }

    /// Drop tombstones and renumber positions.
    ///
    /// Returns `old position → new position` for every old position.
    fn rebuild(&mut self) -> Vec<Option<usize>>;

    /// Remove everything.
    fn clear(&mut self);
}
