//! Exact (brute-force) backend.
//!
//! Vectors live in one contiguous buffer. Search compares the query against
//! every entry, removal swaps the last entry into the hole. Suitable for the
//! tens of thousands of turns a single agent accumulates.

use super::backend::{AnnBackend, IndexKind, Removal};
use super::types::euclidean;

/// Exact L2 backend.
#[derive(Debug, Clone)]
pub struct FlatBackend {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatBackend {
    /// Create an empty backend.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    fn row(&self, position: usize) -> &[f32] {
        let start = position * self.dimension;
        &self.data[start..start + self.dimension]
    }

    fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }
}

impl AnnBackend for FlatBackend {
    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn push(&mut self, vector: &[f32]) -> usize {
        let position = self.len();
        self.data.extend_from_slice(vector);
        position
    }

    fn remove(&mut self, position: usize) -> Removal {
        let len = self.len();
        if position >= len {
            return Removal::SwapRemoved { moved_from: None };
        }
        let last = len - 1;
        if position != last {
            let (head, tail) = self.data.split_at_mut(last * self.dimension);
            let start = position * self.dimension;
            head[start..start + self.dimension].copy_from_slice(&tail[..self.dimension]);
        }
        self.data.truncate(last * self.dimension);
        Removal::SwapRemoved {
            moved_from: (position != last).then_some(last),
        }
    }

    fn candidates(&self, query: &[f32], _k: usize) -> Vec<(usize, f32)> {
        // Every entry is returned; the index applies ties and truncation.
        (0..self.len())
            .map(|position| (position, euclidean(query, self.row(position))))
            .collect()
    }

    fn vector(&self, position: usize) -> Option<&[f32]> {
        (position < self.len()).then(|| self.row(position))
    }

    fn slots(&self) -> usize {
        self.len()
    }

    fn rebuild(&mut self) -> Vec<Option<usize>> {
        (0..self.len()).map(Some).collect()
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_candidates() {
        let mut flat = FlatBackend::new(2);
        assert_eq!(flat.push(&[0.0, 0.0]), 0);
        assert_eq!(flat.push(&[3.0, 4.0]), 1);

        let mut candidates = flat.candidates(&[0.0, 0.0], 1);
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1));
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], (0, 0.0));
        assert!((candidates[1].1 - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_swap_remove_moves_last() {
        let mut flat = FlatBackend::new(1);
        flat.push(&[1.0]);
        flat.push(&[2.0]);
        flat.push(&[3.0]);

        assert_eq!(flat.remove(0), Removal::SwapRemoved { moved_from: Some(2) });
        assert_eq!(flat.slots(), 2);
        assert_eq!(flat.vector(0), Some(&[3.0][..]));
        assert_eq!(flat.vector(1), Some(&[2.0][..]));

        assert_eq!(flat.remove(1), Removal::SwapRemoved { moved_from: None });
        assert_eq!(flat.slots(), 1);
        assert!(flat.vector(1).is_none());
    }

    #[test]
    fn test_clear() {
        let mut flat = FlatBackend::new(3);
        flat.push(&[1.0, 2.0, 3.0]);
        flat.clear();
        assert_eq!(flat.slots(), 0);
        assert!(flat.candidates(&[0.0, 0.0, 0.0], 5).is_empty());
    }
}
