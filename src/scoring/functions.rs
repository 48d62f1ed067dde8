/// Full-precision scoring of stored nodes against the query this function
/// was built for. Implementations always load the node's complete vector.
///
/// Scorers take `&mut self` because they own reusable scratch buffers;
/// a scorer belongs to exactly one search at a time.
///
/// # Panics
///
/// Scoring an ordinal that is not present in the underlying storage is an
/// invariant violation and panics; searches only score ordinals they
/// obtained from the graph itself.
pub trait ExactScoreFunction {
    fn similarity_to(&mut self, ordinal: u32) -> f32;
}

/// Cheap (usually quantized) scoring of stored nodes against the query.
///
/// Implementations backed by fused-ADC storage additionally score a node's
/// entire out-edge list in one pass over the quantized tables; they
/// advertise this with [`supports_edge_loading`](Self::supports_edge_loading)
/// and the searcher switches its expansion step accordingly.
pub trait ApproximateScoreFunction {
    fn similarity_to(&mut self, ordinal: u32) -> f32;

    /// Whether [`edge_scores`](Self::edge_scores) is the preferred expansion
    /// path. Only true for fused-ADC scorers.
    fn supports_edge_loading(&self) -> bool {
        false
    }

    /// Scores the first `degree` out-edges of `origin` into `out`, in edge
    /// order.
    ///
    /// The default implementation panics: callers must consult
    /// [`supports_edge_loading`](Self::supports_edge_loading) first.
    fn edge_scores(&mut self, origin: u32, degree: usize, out: &mut Vec<f32>) {
        let _ = (origin, degree, out);
        unimplemented!("this scorer does not support edge loading");
    }
}

/// The exact stage of a two-stage search: recomputes true similarities for
/// the approximate top candidates before the final top-K cut.
pub trait Reranker {
    fn rerank_similarity_to(&mut self, ordinal: u32) -> f32;
}
