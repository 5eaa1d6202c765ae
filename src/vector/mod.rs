//! Vector storage and similarity search for dialogue embeddings.
//!
//! - [`VectorIndex`]: keyed top-k search with `exp(-distance)` similarity
//! - [`FlatBackend`]: exact search with O(1) removal
//! - [`GraphBackend`]: HNSW-style approximate search with tombstones
//! - [`checkpoint`]: the `.index` / `.meta.json` on-disk format
//!
//! # Example
//!
//! ```ignore
//! use koru_recall::vector::{IndexConfig, Vector, VectorIndex};
//!
//! let index = VectorIndex::new(IndexConfig::graph(384).checkpoint_path("/var/lib/agent/vectors"))?;
//! index.load().await?;
//!
//! index.add("turn-42", &embedding)?;
//! let hits = index.search(&query, 10, 0.2)?;
//!
//! index.save().await?;
//! ```

mod backend;
pub mod checkpoint;
mod flat;
mod graph;
mod index;
mod types;

pub use backend::{AnnBackend, IndexKind, Removal};
pub use flat::FlatBackend;
pub use graph::{GraphBackend, GraphConfig};
pub use index::{IndexConfig, LoadReport, VectorIndex, default_checkpoint_path};
pub use types::{SearchHit, Vector, VectorEntry, similarity_from_distance};
