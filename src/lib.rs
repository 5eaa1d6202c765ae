//! # koru-recall
//!
//! Long-term memory for conversational agents: dialogue turns are stored as
//! weighted records with embeddings, recalled by vector similarity, and kept
//! in a tiered cache whose placement follows each record's decaying weight.
//!
//! ## Quick Start
//!
//! ```ignore
//! use koru_recall::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     koru_recall::logging::init_tracing("koru_recall=info");
//!
//!     let config = RecallConfig::from_json_file("recall.json")?;
//!     let core = MemoryCore::open(config, Arc::new(InMemoryStore::new())).await?;
//!
//!     let turn = MemoryRecord::new("My build runs on the staging runner", Role::User);
//!     core.remember(turn, embed("My build runs on the staging runner"), Remember::default())
//!         .await?;
//!
//!     for hit in core.recall(&embed("where does the build run?"), 5, 0.2).await? {
//!         println!("{:.3} {}", hit.similarity, hit.record.content);
//!     }
//!
//!     core.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Vector index** (`vector`) - keyed top-k search, exact or graph backend,
//!    with a checksummed checkpoint
//! 2. **Weight engine** (`weight`) - pure decay/reinforcement function that maps
//!    a record to its next weight and layer
//! 3. **Tiered cache** (`cache`) - hot/warm/cold/persistent levels with
//!    flush-down eviction and write-behind spill
//! 4. **Event bus** (`events`) - synchronous fan-out of every cache mutation
//! 5. **Maintenance** (`maintenance`) - bounded worker pool running the
//!    score/summarize/persist/publish pipeline, plus a periodic reconcile pass
//! 6. **Store boundary** (`store`) - the database collaborator trait and an
//!    in-memory implementation
//!
//! [`MemoryCore`] wires them together; every component can also be used on
//! its own.
//!
//! ## Thread Safety
//!
//! All components are `Send + Sync` and meant to be shared behind `Arc`.
//! Cache reads share a read lock; the index and the event bus use their own
//! locks, so listeners never run under a cache or index lock they could
//! deadlock on.

pub mod cache;
pub mod config;
mod core;
mod error;
pub mod events;
pub mod logging;
pub mod maintenance;
mod persistence;
pub mod store;
mod types;
pub mod vector;
pub mod weight;

pub use crate::core::{CoreStats, MemoryCore, Recalled, Remember};
pub use cache::{Cache, CacheConfig, CacheLevel, CacheStats, EntryMetadata, TieredCache};
pub use config::RecallConfig;
pub use error::{RecallError, RecallResult};
pub use events::{CacheEvent, CacheEventBus, CacheEventKind, CacheListener, EventCounter, ListenerId};
pub use maintenance::{MaintenanceScheduler, MaintenanceTask, Submission, TaskReport};
pub use store::{Annotation, InMemoryStore, MemoryStore, PersistBatch, RecordFilter, WeightWrite};
pub use types::{
    Association, AssociationKind, DEFAULT_WEIGHT, MAX_WEIGHT, MIN_WEIGHT, MemoryId, MemoryRecord,
    Role,
};
pub use vector::{IndexConfig, SearchHit, Vector, VectorIndex};
pub use weight::{Layer, SharedWeightConfig, WeightConfig, WeightContext, WeightEngine, WeightUpdate};

pub use chrono::{DateTime, Utc};
pub use serde_json::{Value as JsonValue, json};

pub mod prelude {
    pub use crate::cache::{Cache, CacheLevel, EntryMetadata, TieredCache};
    pub use crate::config::RecallConfig;
    pub use crate::core::{MemoryCore, Recalled, Remember};
    pub use crate::error::{RecallError, RecallResult};
    pub use crate::events::{CacheEvent, CacheEventBus, CacheEventKind};
    pub use crate::store::{InMemoryStore, MemoryStore};
    pub use crate::types::{MemoryRecord, Role};
    pub use crate::vector::{Vector, VectorIndex};
    pub use crate::weight::{WeightContext, WeightEngine};
    pub use chrono::{DateTime, Utc};
    pub use serde_json::{Value as JsonValue, json};
}
