//! Visited-node tracking structures for graph traversal.
//!
//! Searches mark every scored node so it is never expanded or scored twice.
//! Two implementations with different space-time tradeoffs are provided: a
//! dense bitmap for graphs whose ordinal range is known and compact, and a
//! paged bitmap for sparse or unknown ordinal ranges.

mod dense;
mod paged;
mod visitor_set;

pub use dense::*;
pub use paged::*;
pub use visitor_set::*;
