//! Vector types and distance math.
//!
//! Similarities handed to callers are derived from Euclidean distance with
//! `exp(-distance)`, which maps every distance into `(0, 1]` and keeps
//! thresholds comparable across models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An embedding vector plus the model that produced it.
///
/// # Example
///
/// ```ignore
/// let v1 = Vector::new(vec![0.1, 0.2, 0.3], "text-embedding-3-small");
/// let v2 = Vector::new(vec![0.2, 0.3, 0.4], "text-embedding-3-small");
/// let distance = v1.euclidean_distance(&v2);
/// ```
#[derive(Debug, Clone)]
pub struct Vector {
    /// The vector data (f32 for memory efficiency vs f64)
    data: Arc<[f32]>,
    /// The embedding model used to generate this vector
    model: String,
}

impl Serialize for Vector {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Vector", 3)?;
        state.serialize_field("data", &self.data.as_ref())?;
        state.serialize_field("model", &self.model)?;
        state.serialize_field("dimensions", &self.dimensions())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Vector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct VectorData {
            data: Vec<f32>,
            model: String,
        }

        let helper = VectorData::deserialize(deserializer)?;
        Ok(Vector::new(helper.data, helper.model))
    }
}

impl Vector {
    /// Create a vector. Dimensionality is checked by the index, not here.
    pub fn new(data: Vec<f32>, model: impl Into<String>) -> Self {
        Self {
            data: Arc::from(data.into_boxed_slice()),
            model: model.into(),
        }
    }

    /// Get the vector data as a slice.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Get the number of dimensions.
    pub fn dimensions(&self) -> usize {
        self.data.len()
    }

    /// Get the embedding model identifier.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Euclidean distance, or None if dimensions don't match.
    pub fn euclidean_distance(&self, other: &Vector) -> Option<f32> {
        if self.dimensions() != other.dimensions() {
            return None;
        }
        Some(euclidean(&self.data, &other.data))
    }

    /// `exp(-distance)` similarity, or None if dimensions don't match.
    pub fn similarity(&self, other: &Vector) -> Option<f32> {
        self.euclidean_distance(other).map(similarity_from_distance)
    }
}

impl PartialEq for Vector {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data && self.model == other.model
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vector(dims={}, model={})",
            self.dimensions(),
            self.model
        )
    }
}

/// Euclidean distance between equal-length slices.
pub(crate) fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum::<f32>()
        .sqrt()
}

/// Map a distance onto `(0, 1]`.
pub fn similarity_from_distance(distance: f32) -> f32 {
    (-distance.max(0.0)).exp()
}

/// A vector bound to the record it embeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    /// Owning record id
    pub memory_id: String,
    /// The embedding
    pub vector: Vector,
}

impl VectorEntry {
    /// Bind a vector to a record id.
    pub fn new(memory_id: impl Into<String>, vector: Vector) -> Self {
        Self {
            memory_id: memory_id.into(),
            vector,
        }
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Key of the matched vector
    pub key: String,
    /// `exp(-distance)`, higher is closer
    pub similarity: f32,
}

impl SearchHit {
    /// Create a search hit.
    pub fn new(key: impl Into<String>, similarity: f32) -> Self {
        Self {
            key: key.into(),
            similarity,
        }
    }
}
