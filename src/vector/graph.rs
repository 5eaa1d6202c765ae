//! HNSW (Hierarchical Navigable Small World) backend.
//!
//! A multi-layer proximity graph: every node lives on layer 0, and on each
//! higher layer with geometrically decreasing probability. Search descends
//! greedily from the top layer and widens into a beam on layer 0.
//!
//! Removal only tombstones a node. Tombstoned nodes keep routing queries but
//! never appear in results; [`GraphBackend::rebuild`] drops them for good.
//!
//! # Example
//!
//! ```ignore
//! use koru_recall::vector::{GraphBackend, GraphConfig};
//!
//! let mut graph = GraphBackend::new(384, GraphConfig::default());
//! let position = graph.push(&embedding);
//! let nearest = graph.candidates(&query, 10);
//! ```

use rand::SeedableRng;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use super::backend::{AnnBackend, IndexKind, Removal};
use super::types::euclidean;

/// Upper bound on layers; level sampling never goes past it.
const MAX_LEVELS: usize = 16;

/// Configuration for the graph backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum number of connections per node above layer 0 (default: 16)
    pub m: usize,
    /// Size of dynamic candidate list during construction (default: 200)
    pub ef_construction: usize,
    /// Size of dynamic candidate list during search (default: 50)
    pub ef_search: usize,
    /// Seed for level sampling, so rebuilt graphs are reproducible
    pub seed: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            seed: 42,
        }
    }
}

impl GraphConfig {
    /// Create a new config with custom M.
    pub fn with_m(m: usize) -> Self {
        Self {
            m,
            ..Self::default()
        }
    }

    /// Set ef_construction.
    pub fn ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    /// Set ef_search.
    pub fn ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    fn level_factor(&self) -> f64 {
        1.0 / (self.m.max(2) as f64).ln()
    }
}

/// Search candidate for the priority queues.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    distance: f32,
    position: usize,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.position.cmp(&other.position))
    }
}

/// HNSW graph over positions.
pub struct GraphBackend {
    dimension: usize,
    config: GraphConfig,
    data: Vec<f32>,
    /// node -> layer -> neighbor positions
    links: Vec<Vec<Vec<usize>>>,
    deleted: Vec<bool>,
    tombstones: usize,
    entry_point: Option<usize>,
    max_level: usize,
    rng: StdRng,
}

impl std::fmt::Debug for GraphBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBackend")
            .field("config", &self.config)
            .field("dimension", &self.dimension)
            .field("nodes", &self.links.len())
            .field("tombstones", &self.tombstones)
            .field("max_level", &self.max_level)
            .field("entry_point", &self.entry_point)
            .finish()
    }
}

impl GraphBackend {
    /// Create an empty graph.
    pub fn new(dimension: usize, config: GraphConfig) -> Self {
        Self {
            dimension,
            config,
            data: Vec::new(),
            links: Vec::new(),
            deleted: Vec::new(),
            tombstones: 0,
            entry_point: None,
            max_level: 0,
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    /// The graph's configuration.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    fn row(&self, position: usize) -> &[f32] {
        let start = position * self.dimension;
        &self.data[start..start + self.dimension]
    }

    fn distance_to(&self, query: &[f32], position: usize) -> f32 {
        euclidean(query, self.row(position))
    }

    fn neighbors(&self, position: usize, layer: usize) -> &[usize] {
        self.links[position]
            .get(layer)
            .map_or(&[], |list| list.as_slice())
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m * 2
        } else {
            self.config.m
        }
    }

    /// Assign a random layer to a new node: `floor(-ln(U) * mL)`.
    fn random_level(&mut self) -> usize {
        let uniform = Uniform::from(f64::EPSILON..1.0);
        let r: f64 = uniform.sample(&mut self.rng);
        let level = (-r.ln() * self.config.level_factor()).floor() as usize;
        level.min(MAX_LEVELS - 1)
    }

    /// Beam search on one layer. Returns up to `ef` nodes, closest first.
    fn search_layer(&self, entry: usize, query: &[f32], ef: usize, layer: usize) -> Vec<Scored> {
        let ef = ef.max(1);
        let mut visited = HashSet::new();
        let mut candidates = BinaryHeap::new();
        let mut best = BinaryHeap::new();

        let start = Scored {
            distance: self.distance_to(query, entry),
            position: entry,
        };
        visited.insert(entry);
        candidates.push(Reverse(start));
        best.push(start);

        while let Some(Reverse(current)) = candidates.pop() {
            let worst = best.peek().map_or(f32::INFINITY, |s: &Scored| s.distance);
            if current.distance > worst && best.len() >= ef {
                break;
            }

            for &neighbor in self.neighbors(current.position, layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let distance = self.distance_to(query, neighbor);
                let worst = best.peek().map_or(f32::INFINITY, |s: &Scored| s.distance);
                if best.len() < ef || distance < worst {
                    let scored = Scored {
                        distance,
                        position: neighbor,
                    };
                    candidates.push(Reverse(scored));
                    best.push(scored);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        best.into_sorted_vec()
    }

    /// Keep only the closest `max` neighbors of `position` on `layer`.
    fn prune(&mut self, position: usize, layer: usize) {
        let max = self.max_connections(layer);
        if self.links[position][layer].len() <= max {
            return;
        }
        let mut scored: Vec<Scored> = self.links[position][layer]
            .iter()
            .map(|&neighbor| Scored {
                distance: euclidean(self.row(position), self.row(neighbor)),
                position: neighbor,
            })
            .collect();
        scored.sort();
        scored.truncate(max);
        self.links[position][layer] = scored.into_iter().map(|s| s.position).collect();
    }

    fn insert(&mut self, vector: &[f32]) -> usize {
        let position = self.links.len();
        let level = self.random_level();
        self.data.extend_from_slice(vector);
        self.links.push(vec![Vec::new(); level + 1]);
        self.deleted.push(false);

        let Some(mut entry) = self.entry_point else {
            self.entry_point = Some(position);
            self.max_level = level;
            return position;
        };

        // Greedy phase through the layers above the new node.
        for layer in ((level + 1)..=self.max_level).rev() {
            if let Some(closest) = self.search_layer(entry, vector, 1, layer).first() {
                entry = closest.position;
            }
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(entry, vector, self.config.ef_construction, layer);
            let selected: Vec<usize> = found
                .iter()
                .take(self.config.m.max(1))
                .map(|s| s.position)
                .collect();

            for &neighbor in &selected {
                self.links[position][layer].push(neighbor);
                self.links[neighbor][layer].push(position);
                self.prune(neighbor, layer);
            }
            if let Some(closest) = found.first() {
                entry = closest.position;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(position);
        }
        position
    }
}

impl AnnBackend for GraphBackend {
    fn kind(&self) -> IndexKind {
        IndexKind::Graph
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn push(&mut self, vector: &[f32]) -> usize {
        self.insert(vector)
    }

    fn remove(&mut self, position: usize) -> Removal {
        if let Some(deleted) = self.deleted.get_mut(position) {
            if !*deleted {
                *deleted = true;
                self.tombstones += 1;
            }
        }
        Removal::Tombstoned
    }

    fn candidates(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let Some(mut entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 || self.tombstones == self.links.len() {
            return Vec::new();
        }

        for layer in (1..=self.max_level).rev() {
            if let Some(closest) = self.search_layer(entry, query, 1, layer).first() {
                entry = closest.position;
            }
        }

        // Widen the beam so tombstones don't crowd out live results.
        let ef = (self.config.ef_search.max(k) + self.tombstones).min(self.links.len());
        self.search_layer(entry, query, ef, 0)
            .into_iter()
            .filter(|s| !self.deleted[s.position])
            .map(|s| (s.position, s.distance))
            .collect()
    }

    fn vector(&self, position: usize) -> Option<&[f32]> {
        match self.deleted.get(position) {
            Some(false) => Some(self.row(position)),
            _ => None,
        }
    }

    fn slots(&self) -> usize {
        self.links.len()
    }

    fn tombstones(&self) -> usize {
        self.tombstones
    }

    fn rebuild(&mut self) -> Vec<Option<usize>> {
        let old_len = self.links.len();
        let live: Vec<(usize, Vec<f32>)> = (0..old_len)
            .filter(|&p| !self.deleted[p])
            .map(|p| (p, self.row(p).to_vec()))
            .collect();

        self.clear();
        let mut mapping = vec![None; old_len];
        for (old, vector) in live {
            mapping[old] = Some(self.insert(&vector));
        }
        mapping
    }

    fn clear(&mut self) {
        self.data.clear();
        self.links.clear();
        self.deleted.clear();
        self.tombstones = 0;
        self.entry_point = None;
        self.max_level = 0;
        self.rng = StdRng::seed_from_u64(self.config.seed);
    }
}
