use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::{IndexError, Result};
use crate::numerics::Similarity;

/// Concurrent ordinal-indexed storage of full-precision vectors.
///
/// The builder writes vectors as inserts arrive; exact scorers read them
/// concurrently. Vectors are immutable once inserted and handed out as
/// `Arc<[f32]>` clones, so readers never hold the map lock while scoring.
pub struct VectorStore {
    dimension: usize,
    slots: RwLock<HashMap<u32, Arc<[f32]>>>,
}

impl VectorStore {
    pub fn new(dimension: usize) -> Self {
        VectorStore {
            dimension,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Stores the vector for `ordinal`.
    ///
    /// # Errors
    /// `InvalidArgument` on a dimension mismatch, `InvariantViolation` if the
    /// ordinal already holds a vector.
    pub fn insert(&self, ordinal: u32, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(IndexError::invalid(format!(
                "vector has dimension {}, store expects {}",
                vector.len(),
                self.dimension
            )));
        }
        let mut slots = self.slots.write();
        if slots.contains_key(&ordinal) {
            return Err(IndexError::invariant(format!(
                "ordinal {ordinal} already has a vector"
            )));
        }
        slots.insert(ordinal, Arc::from(vector));
        Ok(())
    }

    /// The vector stored for `ordinal`, if any.
    pub fn get(&self, ordinal: u32) -> Option<Arc<[f32]>> {
        self.slots.read().get(&ordinal).cloned()
    }

    /// Drops the vector for `ordinal` (cleanup compaction).
    pub fn remove(&self, ordinal: u32) {
        self.slots.write().remove(&ordinal);
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Every stored ordinal, ascending.
    pub fn ordinals(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self.slots.read().keys().copied().collect();
        out.sort_unstable();
        out
    }

    /// Exact score between two stored vectors, or `None` if either is absent.
    pub fn score_between(&self, a: u32, b: u32, similarity: Similarity) -> Option<f32> {
        let (va, vb) = {
            let slots = self.slots.read();
            (slots.get(&a).cloned()?, slots.get(&b).cloned()?)
        };
        Some(similarity.score(&va, &vb))
    }

    /// Element-wise mean of every stored vector; `None` when empty. The
    /// medoid search starts from this.
    pub fn centroid(&self) -> Option<Vec<f32>> {
        let slots = self.slots.read();
        if slots.is_empty() {
            return None;
        }
        let mut mean = vec![0.0f64; self.dimension];
        for v in slots.values() {
            for (m, &x) in mean.iter_mut().zip(v.iter()) {
                *m += x as f64;
            }
        }
        let inv = 1.0 / slots.len() as f64;
        Some(mean.into_iter().map(|m| (m * inv) as f32).collect())
    }
}
