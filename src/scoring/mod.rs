//! Score-function abstractions consumed by the search engine.
//!
//! Four related contracts, all reporting scores in `[0, 1]` (higher = more
//! similar):
//!
//! - [`ExactScoreFunction`]: full-precision scoring, always loads the vector
//! - [`ApproximateScoreFunction`]: cheap scoring, optionally able to score a
//!   node's entire out-edge list in one pass (fused ADC)
//! - [`Reranker`]: the exact stage of a two-stage search
//! - [`SearchScoreProvider`]: the (approximate, reranker) pair a view builds
//!   for one query
//!
//! The hot loop never dispatches through a box: the concrete scorers are
//! small enums ([`ApproximateScorer`], [`ExactScorer`]) whose variants cover
//! every scoring strategy the crate ships.

mod functions;
mod scorers;
mod store;

pub use functions::*;
pub use scorers::*;
pub use store::*;
