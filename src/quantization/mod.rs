//! Product quantization: codebook training, encoding, and query-time tables.
//!
//! A product quantizer splits the vector space into contiguous subspaces and
//! replaces each subvector with the index of its nearest per-subspace
//! centroid, one byte per subspace. At query time a small table of partial
//! scores per (subspace, centroid) pair turns approximate scoring into a
//! handful of lookups, and a 16-bit quantized form of the same table drives
//! the fused edge-scoring path.
//!
//! # Submodules
//!
//! - [`kmeans`]: Lloyd's algorithm with k-means++ seeding
//! - the quantizer itself, its query tables, and the compressed code store

pub mod kmeans;

mod compressed;
mod product;
mod tables;

pub use compressed::*;
pub use product::*;
pub use tables::*;
