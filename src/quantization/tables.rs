use std::sync::Arc;

use crate::error::{IndexError, Result};
use crate::numerics::{Similarity, VectorLike};
use crate::quantization::ProductQuantizer;

/// Per-query partial-score tables.
///
/// For each (subspace, centroid) pair this holds the score fragment between
/// the matching slice of the query and that centroid: a dot product for
/// `Dot`/`Cosine`, a squared L2 distance for `Euclidean`. Scoring a code is
/// then one lookup per subspace plus the final mapping onto `[0, 1]`.
///
/// Cosine additionally consults the quantizer's cached centroid magnitudes
/// (query-independent) to reconstruct the denominator.
pub struct QueryTables {
    quantizer: Arc<ProductQuantizer>,
    similarity: Similarity,
    /// `subspaces * clusters` fragments, row-major by subspace.
    partials: Vec<f32>,
    /// Per-subspace minimum fragment, the quantization offsets.
    sub_min: Vec<f32>,
    /// Σ sub_min and Σ sub_max: the reachable raw-sum bounds.
    total_min: f32,
    total_max: f32,
    /// `||q||^2`, used by cosine only.
    query_norm_sq: f32,
}

impl QueryTables {
    pub(crate) fn build(
        quantizer: &Arc<ProductQuantizer>,
        query: &[f32],
        similarity: Similarity,
    ) -> Result<Self> {
        Self::build_from(Arc::clone(quantizer), query, similarity)
    }

    /// Computes the tables for `query`. The query is centered first when the
    /// quantizer was trained with a global centroid.
    pub fn build_from(
        quantizer: Arc<ProductQuantizer>,
        query: &[f32],
        similarity: Similarity,
    ) -> Result<Self> {
        if query.len() != quantizer.dimension() {
            return Err(IndexError::invalid(format!(
                "query dimension {} != index dimension {}",
                query.len(),
                quantizer.dimension()
            )));
        }

        let mut scratch: Vec<f32>;
        let centered: &[f32] = match quantizer.global_centroid() {
            Some(gc) => {
                scratch = query.iter().zip(gc).map(|(&x, &m)| x - m).collect();
                &scratch
            }
            None => query,
        };

        let subs = quantizer.subspace_count();
        let clusters = quantizer.clusters();
        let mut partials = Vec::with_capacity(subs * clusters);
        let mut sub_min = Vec::with_capacity(subs);
        let mut total_min = 0.0f32;
        let mut total_max = 0.0f32;

        for (s, sub) in quantizer.subspaces().iter().enumerate() {
            let q_slice = &centered[sub.offset..sub.offset + sub.len];
            let mut lo = f32::INFINITY;
            let mut hi = f32::NEG_INFINITY;
            for c in 0..clusters {
                let centroid = quantizer.centroid(s, c);
                let fragment = match similarity {
                    Similarity::Dot | Similarity::Cosine => q_slice.dot(centroid),
                    Similarity::Euclidean => q_slice.l2_squared(centroid),
                };
                lo = lo.min(fragment);
                hi = hi.max(fragment);
                partials.push(fragment);
            }
            sub_min.push(lo);
            total_min += lo;
            total_max += hi;
        }

        Ok(QueryTables {
            query_norm_sq: centered.norm_squared(),
            quantizer,
            similarity,
            partials,
            sub_min,
            total_min,
            total_max,
        })
    }

    pub fn similarity(&self) -> Similarity {
        self.similarity
    }

    /// The best raw sum any code could reach: Σ of per-subspace extrema in
    /// the favorable direction. Used as a pruning bound by callers that
    /// combine shards.
    pub fn best_raw_bound(&self) -> f32 {
        if self.similarity.raw_is_distance() {
            self.total_min
        } else {
            self.total_max
        }
    }

    /// Raw fragment sum for a code (no mapping). The scalar-ADC accumulation
    /// the fused path must agree with up to 16-bit rounding.
    #[inline]
    pub fn raw_sum(&self, code: &[u8]) -> f32 {
        debug_assert_eq!(code.len(), self.sub_min.len());
        let clusters = self.quantizer.clusters();
        let mut sum = 0.0f32;
        for (s, &c) in code.iter().enumerate() {
            sum += self.partials[s * clusters + c as usize];
        }
        sum
    }

    /// Approximate score of a code, mapped onto `[0, 1]`.
    #[inline]
    pub fn score(&self, code: &[u8]) -> f32 {
        let raw = self.raw_sum(code);
        match self.similarity {
            Similarity::Dot => Similarity::from_dot(raw),
            Similarity::Euclidean => Similarity::from_l2_squared(raw),
            Similarity::Cosine => {
                let mut mag = 0.0f32;
                for (s, &c) in code.iter().enumerate() {
                    mag += self.quantizer.magnitude(s, c as usize);
                }
                let denom = (self.query_norm_sq * mag).sqrt();
                if denom == 0.0 {
                    return 0.5;
                }
                Similarity::from_cosine(raw / denom)
            }
        }
    }

    /// Derives the 16-bit linear quantization of these tables for the fused
    /// edge-scoring path.
    ///
    /// Entry `(s, c)` stores `round((partial[s][c] - sub_min[s]) / delta)`
    /// with a single global `delta = (total_max - total_min) / 65535`;
    /// a summed row of lookups therefore dequantizes in one step as
    /// `delta * acc + total_min`.
    ///
    /// Cosine cannot ride this path (its denominator needs a second table
    /// per edge) and reports `InvalidArgument`.
    pub fn quantized(&self) -> Result<QuantizedTables> {
        if self.similarity == Similarity::Cosine {
            return Err(IndexError::invalid(
                "fused edge scoring does not support cosine similarity",
            ));
        }

        let span = self.total_max - self.total_min;
        let delta = if span > 0.0 { span / 65535.0 } else { 1.0 };
        let clusters = self.quantizer.clusters();

        let table: Vec<u16> = self
            .partials
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let s = i / clusters;
                let q = ((p - self.sub_min[s]) / delta).round();
                q.clamp(0.0, 65535.0) as u16
            })
            .collect();

        Ok(QuantizedTables {
            similarity: self.similarity,
            clusters,
            subspaces: self.sub_min.len(),
            delta,
            offset: self.total_min,
            table,
        })
    }
}

/// The u16-quantized form of [`QueryTables`], sized to stay cache-resident
/// while scoring whole edge lists.
pub struct QuantizedTables {
    similarity: Similarity,
    clusters: usize,
    subspaces: usize,
    delta: f32,
    offset: f32,
    table: Vec<u16>,
}

impl QuantizedTables {
    pub fn subspaces(&self) -> usize {
        self.subspaces
    }

    /// Scores every out-edge of a node from its transposed code block.
    ///
    /// `block` is `subspaces` rows of `row_width` code bytes; column `e` of
    /// row `s` is the subspace-`s` code of the node's `e`-th neighbor. Only
    /// the first `degree` columns are meaningful. Scores land in `out`,
    /// mapped onto `[0, 1]`.
    pub fn edge_scores(&self, block: &[u8], row_width: usize, degree: usize, out: &mut Vec<f32>) {
        debug_assert!(degree <= row_width);
        debug_assert!(block.len() >= self.subspaces * row_width);

        out.clear();
        out.resize(degree, 0.0);

        let mut acc = vec![0u32; degree];
        for s in 0..self.subspaces {
            let row = &block[s * row_width..s * row_width + degree];
            let lut = &self.table[s * self.clusters..(s + 1) * self.clusters];
            for (a, &code) in acc.iter_mut().zip(row) {
                *a += lut[code as usize] as u32;
            }
        }

        for (o, &a) in out.iter_mut().zip(&acc) {
            let raw = self.delta * a as f32 + self.offset;
            *o = match self.similarity {
                Similarity::Dot => Similarity::from_dot(raw),
                Similarity::Euclidean => Similarity::from_l2_squared(raw),
                // rejected at construction
                Similarity::Cosine => unreachable!("cosine has no quantized tables"),
            };
        }
    }

    /// Scores a single code through the quantized tables; the fused and
    /// scalar paths agree up to `delta` rounding.
    pub fn score_code(&self, code: &[u8]) -> f32 {
        let mut acc = 0u32;
        for (s, &c) in code.iter().enumerate() {
            acc += self.table[s * self.clusters + c as usize] as u32;
        }
        let raw = self.delta * acc as f32 + self.offset;
        match self.similarity {
            Similarity::Dot => Similarity::from_dot(raw),
            Similarity::Euclidean => Similarity::from_l2_squared(raw),
            Similarity::Cosine => unreachable!("cosine has no quantized tables"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::PqTrainParams;
    use rand::prelude::*;

    fn trained(dim: usize, subs: usize, clusters: usize, seed: u64) -> (Arc<ProductQuantizer>, Vec<Vec<f32>>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let samples: Vec<Vec<f32>> = (0..800)
            .map(|_| (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect();
        let pq = ProductQuantizer::train(
            &samples,
            PqTrainParams {
                subspaces: subs,
                clusters,
                ..PqTrainParams::default()
            },
        )
        .unwrap();
        (Arc::new(pq), samples)
    }

    #[test]
    fn table_score_matches_decode_then_exact_score() {
        let (pq, samples) = trained(16, 4, 32, 11);
        let query = &samples[0];

        for similarity in [Similarity::Dot, Similarity::Euclidean, Similarity::Cosine] {
            let tables = QueryTables::build_from(Arc::clone(&pq), query, similarity).unwrap();
            for v in samples.iter().skip(1).take(30) {
                let code = pq.encode(v).unwrap();
                let via_tables = tables.score(&code);
                let via_decode = similarity.score(query, &pq.decode(&code).unwrap());
                assert!(
                    (via_tables - via_decode).abs() < 1e-4,
                    "{similarity:?}: tables {via_tables} decode {via_decode}"
                );
            }
        }
    }

    #[test]
    fn quantized_tables_agree_with_scalar_up_to_rounding() {
        let (pq, samples) = trained(32, 16, 32, 12);
        let query = &samples[3];

        for similarity in [Similarity::Dot, Similarity::Euclidean] {
            let tables = QueryTables::build_from(Arc::clone(&pq), query, similarity).unwrap();
            let quantized = tables.quantized().unwrap();

            for v in samples.iter().take(100) {
                let code = pq.encode(v).unwrap();
                let exact = tables.score(&code);
                let coarse = quantized.score_code(&code);
                // 16 subspaces of up-to-half-a-delta rounding each
                assert!(
                    (exact - coarse).abs() < 1e-2,
                    "{similarity:?}: scalar {exact} fused {coarse}"
                );
            }
        }
    }

    #[test]
    fn edge_scores_match_per_code_scoring() {
        let (pq, samples) = trained(16, 8, 16, 13);
        let query = &samples[0];
        let tables =
            QueryTables::build_from(Arc::clone(&pq), query, Similarity::Euclidean).unwrap();
        let quantized = tables.quantized().unwrap();

        // build a transposed block of 5 neighbors padded to row width 8
        let degree = 5;
        let row_width = 8;
        let codes: Vec<Vec<u8>> = samples[1..=degree].iter().map(|v| pq.encode(v).unwrap()).collect();
        let mut block = vec![0u8; pq.subspace_count() * row_width];
        for (e, code) in codes.iter().enumerate() {
            for (s, &byte) in code.iter().enumerate() {
                block[s * row_width + e] = byte;
            }
        }

        let mut out = Vec::new();
        quantized.edge_scores(&block, row_width, degree, &mut out);
        assert_eq!(out.len(), degree);
        for (e, code) in codes.iter().enumerate() {
            let single = quantized.score_code(code);
            assert!(
                (out[e] - single).abs() < 1e-6,
                "edge {e}: block {} single {single}",
                out[e]
            );
        }
    }

    #[test]
    fn cosine_refuses_quantization() {
        let (pq, samples) = trained(8, 4, 8, 14);
        let tables =
            QueryTables::build_from(Arc::clone(&pq), &samples[0], Similarity::Cosine).unwrap();
        assert!(matches!(
            tables.quantized(),
            Err(IndexError::InvalidArgument(_))
        ));
    }

    #[test]
    fn best_raw_bound_bounds_every_code() {
        let (pq, samples) = trained(12, 4, 16, 15);
        let query = &samples[0];

        let tables = QueryTables::build_from(Arc::clone(&pq), query, Similarity::Euclidean).unwrap();
        for v in samples.iter().take(50) {
            let raw = tables.raw_sum(&pq.encode(v).unwrap());
            assert!(raw >= tables.best_raw_bound() - 1e-5);
        }

        let tables = QueryTables::build_from(Arc::clone(&pq), query, Similarity::Dot).unwrap();
        for v in samples.iter().take(50) {
            let raw = tables.raw_sum(&pq.encode(v).unwrap());
            assert!(raw <= tables.best_raw_bound() + 1e-5);
        }
    }

    #[test]
    fn query_dimension_mismatch_is_rejected() {
        let (pq, _) = trained(8, 4, 8, 16);
        assert!(QueryTables::build_from(pq, &[1.0, 2.0], Similarity::Dot).is_err());
    }

    #[test]
    fn scalar_and_fused_rankings_agree() {
        let vectors = crate::test_util::random_unit_vectors(500, 32, 8);
        let pq = Arc::new(
            ProductQuantizer::train(
                &vectors,
                PqTrainParams {
                    subspaces: 16,
                    clusters: 32,
                    center_globally: false,
                    max_iters: 10,
                    seed: 0xADC,
                },
            )
            .unwrap(),
        );
        let query = crate::test_util::random_unit_vectors(1, 32, 9).pop().unwrap();

        let tables = pq.query_tables(&query, Similarity::Euclidean).unwrap();
        let quantized = tables.quantized().unwrap();

        let rank = |score: &dyn Fn(&[u8]) -> f32| -> Vec<u32> {
            let mut scored: Vec<(u32, f32)> = vectors
                .iter()
                .enumerate()
                .map(|(i, v)| (i as u32, score(&pq.encode(v).unwrap())))
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            scored.into_iter().map(|(i, _)| i).collect()
        };

        let scalar: Vec<u32> = rank(&|code| tables.score(code));
        let fused: Vec<u32> = rank(&|code| quantized.score_code(code));

        // 16-bit rounding may shuffle the tail, never the head
        assert_eq!(&scalar[..10], &fused[..10], "top-10 must match exactly");

        let scalar_top50: hashbrown::HashSet<u32> = scalar[..50].iter().copied().collect();
        let fused_top50: hashbrown::HashSet<u32> = fused[..50].iter().copied().collect();
        let disagreement = scalar_top50.symmetric_difference(&fused_top50).count();
        assert!(
            disagreement <= 5,
            "top-50 symmetric difference is {disagreement}"
        );
    }
}
