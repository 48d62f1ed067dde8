use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::numerics::{Similarity, VectorLike};
use crate::quantization::kmeans::{self, KMeansParams};
use crate::quantization::tables::QueryTables;

/// One contiguous slice of the vector space owned by a single codebook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subspace {
    /// First dimension covered by this subspace.
    pub offset: usize,
    /// Number of dimensions covered.
    pub len: usize,
}

/// Training parameters for [`ProductQuantizer::train`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PqTrainParams {
    /// Number of subspaces (codebooks). One code byte per subspace.
    pub subspaces: usize,
    /// Centroids per codebook; at most 256 so a code fits in a byte.
    pub clusters: usize,
    /// Subtract the sample centroid from every vector before training and
    /// encoding. Usually improves Euclidean quantization.
    pub center_globally: bool,
    /// Lloyd iteration cap per codebook.
    pub max_iters: usize,
    /// Seed; codebook `s` trains with `seed + s` so subspaces decorrelate.
    pub seed: u64,
}

impl Default for PqTrainParams {
    fn default() -> Self {
        PqTrainParams {
            subspaces: 16,
            clusters: 256,
            center_globally: false,
            max_iters: 15,
            seed: 0x5eed,
        }
    }
}

/// A trained product quantizer: per-subspace codebooks, the subspace layout,
/// and an optional global centroid.
///
/// Immutable once trained; shared by scorers behind an `Arc`.
pub struct ProductQuantizer {
    dimension: usize,
    clusters: usize,
    subspaces: Vec<Subspace>,
    /// Codebooks concatenated: subspace `s` occupies
    /// `starts[s] .. starts[s] + clusters * subspaces[s].len`, row-major by
    /// centroid.
    codebooks: Vec<f32>,
    starts: Vec<usize>,
    global_centroid: Option<Vec<f32>>,
    /// Squared magnitude of each centroid (`subspaces * clusters`), the
    /// query-independent half of cosine scoring.
    magnitudes: Vec<f32>,
}

impl ProductQuantizer {
    /// Trains codebooks on `samples` (a few thousand vectors are plenty).
    pub fn train(samples: &[Vec<f32>], params: PqTrainParams) -> Result<Self> {
        let Some(first) = samples.first() else {
            return Err(IndexError::invalid("cannot train a quantizer on zero samples"));
        };
        let dimension = first.len();
        if dimension == 0 {
            return Err(IndexError::invalid("cannot train on zero-dimensional vectors"));
        }
        if samples.iter().any(|s| s.len() != dimension) {
            return Err(IndexError::invalid("training samples disagree on dimension"));
        }
        if params.subspaces == 0 || params.subspaces > dimension {
            return Err(IndexError::invalid(format!(
                "subspace count {} must be in 1..={dimension}",
                params.subspaces
            )));
        }
        if params.clusters == 0 || params.clusters > 256 {
            return Err(IndexError::invalid(format!(
                "cluster count {} must be in 1..=256",
                params.clusters
            )));
        }

        let global_centroid = if params.center_globally {
            let mut mean = vec![0.0f64; dimension];
            for s in samples {
                for (m, &x) in mean.iter_mut().zip(s) {
                    *m += x as f64;
                }
            }
            let inv = 1.0 / samples.len() as f64;
            Some(mean.into_iter().map(|m| (m * inv) as f32).collect::<Vec<f32>>())
        } else {
            None
        };

        let subspaces = partition(dimension, params.subspaces);

        let mut codebooks = Vec::new();
        let mut starts = Vec::with_capacity(subspaces.len());
        for (s, sub) in subspaces.iter().enumerate() {
            // gather this subspace's slice of every (centered) sample
            let mut flat = Vec::with_capacity(samples.len() * sub.len);
            for sample in samples {
                let slice = &sample[sub.offset..sub.offset + sub.len];
                match &global_centroid {
                    Some(gc) => flat.extend(
                        slice
                            .iter()
                            .zip(&gc[sub.offset..sub.offset + sub.len])
                            .map(|(&x, &m)| x - m),
                    ),
                    None => flat.extend_from_slice(slice),
                }
            }

            let clusters = params.clusters.min(samples.len());
            let km = kmeans::train(
                &flat,
                sub.len,
                clusters,
                KMeansParams {
                    max_iters: params.max_iters,
                    seed: params.seed + s as u64,
                    ..KMeansParams::default()
                },
            )?;

            starts.push(codebooks.len());
            codebooks.extend_from_slice(&km.centroids);
            // pad starved codebooks up to the requested cluster count by
            // repeating the last centroid, so code bytes always decode
            for _ in clusters..params.clusters {
                let last = codebooks.len() - sub.len;
                codebooks.extend_from_within(last..last + sub.len);
            }
        }

        Ok(Self::assemble(
            dimension,
            params.clusters,
            subspaces,
            codebooks,
            starts,
            global_centroid,
        ))
    }

    /// Reconstructs a quantizer from stored parts (the on-disk reader path).
    pub fn from_parts(
        dimension: usize,
        clusters: usize,
        subspaces: Vec<Subspace>,
        codebooks: Vec<f32>,
        global_centroid: Option<Vec<f32>>,
    ) -> Result<Self> {
        let covered: usize = subspaces.iter().map(|s| s.len).sum();
        if covered != dimension {
            return Err(IndexError::format(format!(
                "subspace lengths sum to {covered}, expected dimension {dimension}"
            )));
        }
        let expected: usize = subspaces.iter().map(|s| s.len * clusters).sum();
        if codebooks.len() != expected {
            return Err(IndexError::format(format!(
                "codebook tensor holds {} floats, expected {expected}",
                codebooks.len()
            )));
        }
        if let Some(gc) = &global_centroid
            && gc.len() != dimension
        {
            return Err(IndexError::format("global centroid dimension mismatch"));
        }

        let mut starts = Vec::with_capacity(subspaces.len());
        let mut at = 0;
        for sub in &subspaces {
            starts.push(at);
            at += clusters * sub.len;
        }

        Ok(Self::assemble(
            dimension,
            clusters,
            subspaces,
            codebooks,
            starts,
            global_centroid,
        ))
    }

    fn assemble(
        dimension: usize,
        clusters: usize,
        subspaces: Vec<Subspace>,
        codebooks: Vec<f32>,
        starts: Vec<usize>,
        global_centroid: Option<Vec<f32>>,
    ) -> Self {
        let mut pq = ProductQuantizer {
            dimension,
            clusters,
            subspaces,
            codebooks,
            starts,
            global_centroid,
            magnitudes: Vec::new(),
        };
        let magnitudes: Vec<f32> = (0..pq.subspaces.len())
            .flat_map(|s| (0..clusters).map(move |c| (s, c)))
            .map(|(s, c)| pq.centroid(s, c).norm_squared())
            .collect();
        pq.magnitudes = magnitudes;
        pq
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of subspaces, i.e. bytes per encoded vector.
    pub fn subspace_count(&self) -> usize {
        self.subspaces.len()
    }

    pub fn clusters(&self) -> usize {
        self.clusters
    }

    pub fn subspaces(&self) -> &[Subspace] {
        &self.subspaces
    }

    pub fn global_centroid(&self) -> Option<&[f32]> {
        self.global_centroid.as_deref()
    }

    /// Centroid `c` of subspace `s`.
    pub fn centroid(&self, s: usize, c: usize) -> &[f32] {
        let len = self.subspaces[s].len;
        let start = self.starts[s] + c * len;
        &self.codebooks[start..start + len]
    }

    /// Flat codebook tensor, for serialization.
    pub fn codebook_tensor(&self) -> &[f32] {
        &self.codebooks
    }

    /// Cached `||centroid||^2` for `(s, c)`, the cosine denominator pieces.
    pub fn magnitude(&self, s: usize, c: usize) -> f32 {
        self.magnitudes[s * self.clusters + c]
    }

    /// Encodes one vector into `out` (one byte per subspace).
    pub fn encode_into(&self, vector: &[f32], out: &mut [u8]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(IndexError::invalid(format!(
                "cannot encode a {}-dimensional vector with a {}-dimensional quantizer",
                vector.len(),
                self.dimension
            )));
        }
        if out.len() != self.subspaces.len() {
            return Err(IndexError::invalid("output buffer length != subspace count"));
        }

        let mut scratch: Vec<f32>;
        let centered: &[f32] = match &self.global_centroid {
            Some(gc) => {
                scratch = vector.iter().zip(gc).map(|(&x, &m)| x - m).collect();
                &scratch
            }
            None => vector,
        };

        for (s, sub) in self.subspaces.iter().enumerate() {
            let slice = &centered[sub.offset..sub.offset + sub.len];
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for c in 0..self.clusters {
                let d = slice.l2_squared(self.centroid(s, c));
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            out[s] = best as u8;
        }
        Ok(())
    }

    /// Encodes one vector, allocating the code.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.subspaces.len()];
        self.encode_into(vector, &mut out)?;
        Ok(out)
    }

    /// Reconstructs the centroid concatenation a code decodes to (plus the
    /// global centroid when one was trained).
    pub fn decode(&self, code: &[u8]) -> Result<Vec<f32>> {
        if code.len() != self.subspaces.len() {
            return Err(IndexError::invalid("code length != subspace count"));
        }
        let mut out = vec![0.0f32; self.dimension];
        for (s, sub) in self.subspaces.iter().enumerate() {
            let c = code[s] as usize;
            if c >= self.clusters {
                return Err(IndexError::invalid(format!(
                    "code byte {c} out of range for {} clusters",
                    self.clusters
                )));
            }
            out[sub.offset..sub.offset + sub.len].copy_from_slice(self.centroid(s, c));
        }
        if let Some(gc) = &self.global_centroid {
            for (o, &m) in out.iter_mut().zip(gc) {
                *o += m;
            }
        }
        Ok(out)
    }

    /// Precomputes the per-query partial-score tables for `query` under
    /// `similarity`. See [`QueryTables`].
    pub fn query_tables(
        self: &std::sync::Arc<Self>,
        query: &[f32],
        similarity: Similarity,
    ) -> Result<QueryTables> {
        QueryTables::build(self, query, similarity)
    }
}

/// Splits `dimension` into `count` contiguous subspaces as equally as
/// possible, spreading the remainder across the first subspaces.
fn partition(dimension: usize, count: usize) -> Vec<Subspace> {
    let base = dimension / count;
    let remainder = dimension % count;
    let mut out = Vec::with_capacity(count);
    let mut offset = 0;
    for s in 0..count {
        let len = base + usize::from(s < remainder);
        out.push(Subspace { offset, len });
        offset += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn random_samples(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect()
    }

    #[test]
    fn partition_spreads_the_remainder_forward() {
        let subs = partition(10, 4);
        assert_eq!(
            subs,
            vec![
                Subspace { offset: 0, len: 3 },
                Subspace { offset: 3, len: 3 },
                Subspace { offset: 6, len: 2 },
                Subspace { offset: 8, len: 2 },
            ]
        );
        assert_eq!(subs.iter().map(|s| s.len).sum::<usize>(), 10);
    }

    #[test]
    fn encode_emits_one_byte_per_subspace() {
        let samples = random_samples(300, 12, 1);
        let pq = ProductQuantizer::train(
            &samples,
            PqTrainParams {
                subspaces: 4,
                clusters: 16,
                ..PqTrainParams::default()
            },
        )
        .unwrap();

        let code = pq.encode(&samples[0]).unwrap();
        assert_eq!(code.len(), 4);
        assert!(code.iter().all(|&c| (c as usize) < 16));
    }

    #[test]
    fn encoding_is_idempotent_and_deterministic() {
        let samples = random_samples(500, 8, 2);
        let params = PqTrainParams {
            subspaces: 4,
            clusters: 32,
            ..PqTrainParams::default()
        };
        let a = ProductQuantizer::train(&samples, params).unwrap();
        let b = ProductQuantizer::train(&samples, params).unwrap();

        for v in samples.iter().take(20) {
            assert_eq!(a.encode(v).unwrap(), b.encode(v).unwrap());
            assert_eq!(a.encode(v).unwrap(), a.encode(v).unwrap());
        }
    }

    #[test]
    fn decode_returns_the_chosen_centroids() {
        let samples = random_samples(400, 6, 3);
        let pq = ProductQuantizer::train(
            &samples,
            PqTrainParams {
                subspaces: 3,
                clusters: 8,
                ..PqTrainParams::default()
            },
        )
        .unwrap();

        let code = pq.encode(&samples[7]).unwrap();
        let decoded = pq.decode(&code).unwrap();
        for (s, sub) in pq.subspaces().iter().enumerate() {
            assert_eq!(
                &decoded[sub.offset..sub.offset + sub.len],
                pq.centroid(s, code[s] as usize)
            );
        }
    }

    #[test]
    fn global_centering_round_trips_through_decode() {
        let mut samples = random_samples(300, 4, 4);
        // shift everything far from the origin so centering matters
        for s in &mut samples {
            for x in s.iter_mut() {
                *x += 100.0;
            }
        }
        let pq = ProductQuantizer::train(
            &samples,
            PqTrainParams {
                subspaces: 2,
                clusters: 16,
                center_globally: true,
                ..PqTrainParams::default()
            },
        )
        .unwrap();

        let code = pq.encode(&samples[0]).unwrap();
        let decoded = pq.decode(&code).unwrap();
        // reconstruction must land near the original, i.e. the centroid was
        // added back
        for (&d, &x) in decoded.iter().zip(&samples[0]) {
            assert!((d - x).abs() < 10.0, "decoded {d} vs original {x}");
        }
    }

    #[test]
    fn quantization_error_shrinks_with_more_clusters() {
        let samples = random_samples(600, 8, 5);
        let err = |clusters: usize| -> f32 {
            let pq = ProductQuantizer::train(
                &samples,
                PqTrainParams {
                    subspaces: 4,
                    clusters,
                    ..PqTrainParams::default()
                },
            )
            .unwrap();
            samples
                .iter()
                .map(|v| {
                    let d = pq.decode(&pq.encode(v).unwrap()).unwrap();
                    v.as_slice().l2_squared(&d)
                })
                .sum::<f32>()
        };

        assert!(err(32) < err(2));
    }

    #[test]
    fn from_parts_round_trips_a_trained_quantizer() {
        let samples = random_samples(300, 10, 6);
        let pq = ProductQuantizer::train(
            &samples,
            PqTrainParams {
                subspaces: 5,
                clusters: 8,
                ..PqTrainParams::default()
            },
        )
        .unwrap();

        let rebuilt = ProductQuantizer::from_parts(
            pq.dimension(),
            pq.clusters(),
            pq.subspaces().to_vec(),
            pq.codebook_tensor().to_vec(),
            pq.global_centroid().map(|g| g.to_vec()),
        )
        .unwrap();

        for v in samples.iter().take(10) {
            assert_eq!(pq.encode(v).unwrap(), rebuilt.encode(v).unwrap());
        }
    }

    #[test]
    fn rejects_bad_parameters() {
        let samples = random_samples(100, 8, 7);
        for params in [
            PqTrainParams {
                subspaces: 0,
                ..PqTrainParams::default()
            },
            PqTrainParams {
                subspaces: 9,
                ..PqTrainParams::default()
            },
            PqTrainParams {
                subspaces: 4,
                clusters: 0,
                ..PqTrainParams::default()
            },
            PqTrainParams {
                subspaces: 4,
                clusters: 300,
                ..PqTrainParams::default()
            },
        ] {
            assert!(ProductQuantizer::train(&samples, params).is_err());
        }
        assert!(ProductQuantizer::train(&[], PqTrainParams::default()).is_err());
    }

    #[test]
    fn large_codebook_training_is_reproducible() {
        // byte-wide codebooks over a real-sized sample: two trainings from
        // the same seed must agree code for code
        let samples = crate::test_util::random_unit_vectors(2500, 16, 7);
        let params = PqTrainParams {
            subspaces: 4,
            clusters: 256,
            center_globally: false,
            max_iters: 6,
            seed: 0xFEED,
        };

        let a = ProductQuantizer::train(&samples, params).unwrap();
        let b = ProductQuantizer::train(&samples, params).unwrap();

        let code_a = a.encode(&samples[0]).unwrap();
        let code_b = b.encode(&samples[0]).unwrap();
        assert_eq!(code_a.len(), 4);
        assert_eq!(code_a, code_b, "same seed, same sample, different code");

        // encoding is idempotent, and decode returns exactly the selected
        // centroids
        assert_eq!(a.encode(&samples[0]).unwrap(), code_a);
        let decoded = a.decode(&code_a).unwrap();
        for (s, sub) in a.subspaces().iter().enumerate() {
            assert_eq!(
                &decoded[sub.offset..sub.offset + sub.len],
                a.centroid(s, code_a[s] as usize)
            );
        }
    }

    #[test]
    fn dimension_mismatch_is_rejected_at_encode_time() {
        let samples = random_samples(100, 8, 8);
        let pq = ProductQuantizer::train(
            &samples,
            PqTrainParams {
                subspaces: 2,
                clusters: 4,
                ..PqTrainParams::default()
            },
        )
        .unwrap();
        assert!(matches!(
            pq.encode(&[1.0, 2.0]),
            Err(IndexError::InvalidArgument(_))
        ));
    }
}
