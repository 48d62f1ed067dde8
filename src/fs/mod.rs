//! Dataset I/O: loading vector collections from disk.
//!
//! Build pipelines and benchmarks usually start from NumPy matrices; this
//! module turns a `.npy` file of shape `(count, dimension)` into the
//! `Vec<Vec<f32>>` the builder and quantizer trainers consume.

mod npy_load;

pub use npy_load::*;
