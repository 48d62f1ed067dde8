//! Numerical kernels for vector computations.
//!
//! This module provides the dense f32 kernels (dot product, squared L2,
//! normalization) every scorer in the crate bottoms out in, plus the
//! [`Similarity`] enum that maps raw accumulations onto comparable scores.

mod f32slice;
mod similarity;

pub use f32slice::VectorLike;
pub use similarity::Similarity;
