use serde::{Deserialize, Serialize};

use crate::numerics::VectorLike;

/// The similarity measure an index is built and searched under.
///
/// Every scorer in the crate reports scores in `[0, 1]` with higher meaning
/// more similar, regardless of the underlying measure. The mappings from raw
/// accumulations are fixed so that exact scorers, scalar table-lookup scorers
/// and the fused edge-scoring path all land on the same scale:
///
/// - dot product `d` → `(1 + d) / 2`
/// - squared Euclidean distance `d` → `1 / (1 + d)`
/// - cosine `c` → `(1 + c) / 2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Similarity {
    /// Inner product. Scores above 0.5 mean positive correlation; callers
    /// working with normalized embeddings usually want this or `Cosine`.
    Dot,
    /// Euclidean (L2) distance, accumulated squared.
    Euclidean,
    /// Cosine of the angle between the vectors.
    Cosine,
}

impl Similarity {
    /// Exact score of `vector` against `query`, mapped to `[0, 1]`.
    ///
    /// # Panics
    ///
    /// Panics if the two slices have different lengths.
    #[inline]
    pub fn score(&self, query: &[f32], vector: &[f32]) -> f32 {
        match self {
            Similarity::Dot => Self::from_dot(query.dot(vector)),
            Similarity::Euclidean => Self::from_l2_squared(query.l2_squared(vector)),
            Similarity::Cosine => {
                let denom = (query.norm_squared() * vector.norm_squared()).sqrt();
                if denom == 0.0 {
                    // a zero vector is equidistant from everything
                    return 0.5;
                }
                Self::from_cosine(query.dot(vector) / denom)
            }
        }
    }

    /// Maps a raw dot product onto the unit score scale.
    #[inline]
    pub fn from_dot(d: f32) -> f32 {
        (1.0 + d) / 2.0
    }

    /// Maps an accumulated squared L2 distance onto the unit score scale.
    #[inline]
    pub fn from_l2_squared(d: f32) -> f32 {
        1.0 / (1.0 + d)
    }

    /// Maps a cosine value in `[-1, 1]` onto the unit score scale.
    #[inline]
    pub fn from_cosine(c: f32) -> f32 {
        (1.0 + c) / 2.0
    }

    /// Whether the raw accumulation is a distance (lower is better) rather
    /// than a similarity (higher is better). Table-based scorers use this to
    /// orient their per-subspace extrema.
    #[inline]
    pub fn raw_is_distance(&self) -> bool {
        matches!(self, Similarity::Euclidean)
    }
}
