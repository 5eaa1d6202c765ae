//! Cache levels and their capacities.

use serde::{Deserialize, Serialize};

use crate::weight::Layer;

/// Where an entry lives.
///
/// `Hot`, `Warm` and `Cold` form the tier ladder; `Persistent` holds pinned
/// entries; `External` marks values served by a store- or index-backed cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    Hot,
    Warm,
    Cold,
    Persistent,
    External,
}

impl CacheLevel {
    /// The levels a [`TieredCache`](super::TieredCache) stores entries in.
    pub const STORED: [CacheLevel; 4] = [
        CacheLevel::Hot,
        CacheLevel::Warm,
        CacheLevel::Cold,
        CacheLevel::Persistent,
    ];

    /// Ladder level for an importance layer.
    pub fn for_layer(layer: Layer) -> CacheLevel {
        match layer {
            Layer::Core | Layer::Archive => CacheLevel::Hot,
            Layer::LongTerm => CacheLevel::Warm,
            Layer::ShortTerm => CacheLevel::Cold,
        }
    }

    /// Ladder level for a weight.
    pub fn for_weight(weight: f64) -> CacheLevel {
        Self::for_layer(Layer::classify(weight))
    }

    /// Position on the ladder, higher is hotter. None off the ladder.
    pub fn rank(&self) -> Option<u8> {
        match self {
            CacheLevel::Cold => Some(0),
            CacheLevel::Warm => Some(1),
            CacheLevel::Hot => Some(2),
            CacheLevel::Persistent | CacheLevel::External => None,
        }
    }

    /// One step hotter.
    pub fn up(&self) -> Option<CacheLevel> {
        match self {
            CacheLevel::Cold => Some(CacheLevel::Warm),
            CacheLevel::Warm => Some(CacheLevel::Hot),
            _ => None,
        }
    }

    /// One step colder. None below `Cold` (the next step is eviction).
    pub fn down(&self) -> Option<CacheLevel> {
        match self {
            CacheLevel::Hot => Some(CacheLevel::Warm),
            CacheLevel::Warm => Some(CacheLevel::Cold),
            _ => None,
        }
    }

    pub(crate) fn slot(&self) -> Option<usize> {
        match self {
            CacheLevel::Hot => Some(0),
            CacheLevel::Warm => Some(1),
            CacheLevel::Cold => Some(2),
            CacheLevel::Persistent => Some(3),
            CacheLevel::External => None,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::Hot => "hot",
            CacheLevel::Warm => "warm",
            CacheLevel::Cold => "cold",
            CacheLevel::Persistent => "persistent",
            CacheLevel::External => "external",
        }
    }
}

impl std::fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounds for one level. An insert that would break either bound evicts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelCapacity {
    pub max_items: usize,
    pub max_bytes: usize,
}

impl LevelCapacity {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            max_items,
            max_bytes,
        }
    }

    /// Whether one more entry of `size` fits next to `items` / `bytes`.
    pub fn fits(&self, items: usize, bytes: usize, size: usize) -> bool {
        items < self.max_items && bytes.saturating_add(size) <= self.max_bytes
    }
}
