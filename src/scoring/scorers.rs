use std::sync::Arc;

use crate::disk::View;
use crate::numerics::Similarity;
use crate::quantization::{CompressedVectors, QuantizedTables, QueryTables};
use crate::scoring::{ApproximateScoreFunction, ExactScoreFunction, Reranker, VectorStore};

/// Full-precision scorer over the build-side [`VectorStore`].
pub struct StoreExact {
    query: Vec<f32>,
    similarity: Similarity,
    store: Arc<VectorStore>,
}

/// Full-precision scorer over an on-disk view's inline or separated vectors.
pub struct DiskExact {
    query: Vec<f32>,
    similarity: Similarity,
    view: View,
    buf: Vec<f32>,
}

/// The exact scorers the crate ships, dispatched by tag.
pub enum ExactScorer {
    Store(StoreExact),
    Disk(DiskExact),
}

impl ExactScorer {
    /// Exact scoring against vectors held in memory by the builder.
    pub fn over_store(query: &[f32], similarity: Similarity, store: Arc<VectorStore>) -> Self {
        ExactScorer::Store(StoreExact {
            query: query.to_vec(),
            similarity,
            store,
        })
    }

    /// Exact scoring against full-precision vectors stored in an index file.
    pub fn over_view(query: &[f32], similarity: Similarity, view: View) -> Self {
        ExactScorer::Disk(DiskExact {
            query: query.to_vec(),
            similarity,
            view,
            buf: Vec::new(),
        })
    }

    #[inline]
    pub fn similarity_to(&mut self, ordinal: u32) -> f32 {
        match self {
            ExactScorer::Store(s) => {
                let vector = s
                    .store
                    .get(ordinal)
                    .expect("scored ordinal missing from vector store");
                s.similarity.score(&s.query, &vector)
            }
            ExactScorer::Disk(s) => {
                s.view
                    .vector_into(ordinal, &mut s.buf)
                    .expect("scored ordinal missing from index file");
                s.similarity.score(&s.query, &s.buf)
            }
        }
    }
}

impl ExactScoreFunction for ExactScorer {
    fn similarity_to(&mut self, ordinal: u32) -> f32 {
        ExactScorer::similarity_to(self, ordinal)
    }
}

impl Reranker for ExactScorer {
    fn rerank_similarity_to(&mut self, ordinal: u32) -> f32 {
        ExactScorer::similarity_to(self, ordinal)
    }
}

/// Scalar ADC: per-ordinal table lookups over stored PQ codes.
pub struct PqScorer {
    tables: QueryTables,
    codes: Arc<CompressedVectors>,
}

impl PqScorer {
    pub fn new(tables: QueryTables, codes: Arc<CompressedVectors>) -> Self {
        PqScorer { tables, codes }
    }
}

/// Fused ADC: scores whole out-edge lists from transposed neighbor blocks.
///
/// Single ordinals (in practice only the search's entry seed) fall back to
/// full-precision scoring through the same view; everything scored during
/// expansion flows through the quantized tables.
pub struct FusedScorer {
    quantized: QuantizedTables,
    view: View,
    fallback: DiskExact,
}

impl FusedScorer {
    pub fn new(quantized: QuantizedTables, view: View, query: &[f32], similarity: Similarity) -> Self {
        let fallback = DiskExact {
            query: query.to_vec(),
            similarity,
            view: view.clone(),
            buf: Vec::new(),
        };
        FusedScorer {
            quantized,
            view,
            fallback,
        }
    }
}

/// The approximate scorers the crate ships, dispatched by tag.
///
/// `Exact` wraps a full-precision scorer for callers that skip quantization
/// entirely (the builder's internal searches, small indexes).
pub enum ApproximateScorer {
    Pq(PqScorer),
    Fused(FusedScorer),
    Exact(ExactScorer),
}

impl ApproximateScorer {
    #[inline]
    pub fn similarity_to(&mut self, ordinal: u32) -> f32 {
        match self {
            ApproximateScorer::Pq(s) => {
                let code = s
                    .codes
                    .code(ordinal)
                    .expect("scored ordinal missing from compressed vectors");
                s.tables.score(code)
            }
            ApproximateScorer::Fused(s) => {
                s.fallback.view
                    .vector_into(ordinal, &mut s.fallback.buf)
                    .expect("scored ordinal missing from index file");
                s.fallback.similarity.score(&s.fallback.query, &s.fallback.buf)
            }
            ApproximateScorer::Exact(s) => s.similarity_to(ordinal),
        }
    }

    pub fn supports_edge_loading(&self) -> bool {
        matches!(self, ApproximateScorer::Fused(_))
    }

    /// Scores the first `degree` out-edges of `origin` into `out`.
    ///
    /// # Panics
    ///
    /// Panics for scorers that do not support edge loading.
    pub fn edge_scores(&mut self, origin: u32, degree: usize, out: &mut Vec<f32>) {
        match self {
            ApproximateScorer::Fused(s) => {
                let row_width = s.view.max_degree();
                let block = s
                    .view
                    .fused_block(origin)
                    .expect("expanded ordinal missing a fused block");
                s.quantized.edge_scores(block, row_width, degree, out);
            }
            _ => unimplemented!("this scorer does not support edge loading"),
        }
    }
}

impl ApproximateScoreFunction for ApproximateScorer {
    fn similarity_to(&mut self, ordinal: u32) -> f32 {
        ApproximateScorer::similarity_to(self, ordinal)
    }

    fn supports_edge_loading(&self) -> bool {
        ApproximateScorer::supports_edge_loading(self)
    }

    fn edge_scores(&mut self, origin: u32, degree: usize, out: &mut Vec<f32>) {
        ApproximateScorer::edge_scores(self, origin, degree, out)
    }
}

/// The (approximate, reranker) pair driving one search.
///
/// With a reranker present the searcher runs two-stage: approximate scores
/// steer the traversal, and the top survivors are rescored exactly before
/// the final cut. Without one, approximate scores are final.
pub struct SearchScoreProvider {
    pub approx: ApproximateScorer,
    pub reranker: Option<ExactScorer>,
}

impl SearchScoreProvider {
    pub fn new(approx: ApproximateScorer, reranker: Option<ExactScorer>) -> Self {
        SearchScoreProvider { approx, reranker }
    }

    /// A provider whose "approximate" stage is already exact; reranking
    /// would be a no-op so none is installed.
    pub fn exact_only(exact: ExactScorer) -> Self {
        SearchScoreProvider {
            approx: ApproximateScorer::Exact(exact),
            reranker: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_scorer_matches_direct_similarity() {
        let store = Arc::new(VectorStore::new(2));
        store.insert(0, &[1.0, 0.0]).unwrap();
        store.insert(1, &[0.0, 1.0]).unwrap();

        let mut scorer = ExactScorer::over_store(&[1.0, 0.0], Similarity::Cosine, store);
        let self_score = scorer.similarity_to(0);
        let orthogonal = scorer.similarity_to(1);
        assert!((self_score - 1.0).abs() < 1e-6);
        assert!((orthogonal - 0.5).abs() < 1e-6);
    }

    #[test]
    fn pq_scorer_tracks_the_query_tables() {
        use crate::quantization::{PqTrainParams, ProductQuantizer};
        use rand::prelude::*;

        let mut rng = StdRng::seed_from_u64(31);
        let data: Vec<Vec<f32>> = (0..300)
            .map(|_| (0..8).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect();
        let pq = Arc::new(
            ProductQuantizer::train(
                &data,
                PqTrainParams {
                    subspaces: 4,
                    clusters: 16,
                    ..PqTrainParams::default()
                },
            )
            .unwrap(),
        );
        let codes = Arc::new(CompressedVectors::encode_all(Arc::clone(&pq), &data).unwrap());

        let query = data[0].clone();
        let tables = pq.query_tables(&query, Similarity::Euclidean).unwrap();
        let expected: Vec<f32> = (0..5u32)
            .map(|i| tables.score(codes.code(i).unwrap()))
            .collect();

        let tables = pq.query_tables(&query, Similarity::Euclidean).unwrap();
        let mut scorer = ApproximateScorer::Pq(PqScorer::new(tables, codes));
        assert!(!scorer.supports_edge_loading());
        for (i, &want) in expected.iter().enumerate() {
            assert_eq!(scorer.similarity_to(i as u32), want);
        }
    }

    #[test]
    #[should_panic]
    fn scoring_a_missing_ordinal_panics() {
        let store = Arc::new(VectorStore::new(2));
        let mut scorer = ExactScorer::over_store(&[0.0, 0.0], Similarity::Dot, store);
        scorer.similarity_to(7);
    }
}
