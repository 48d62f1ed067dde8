use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{IndexError, Result};
use crate::quantization::ProductQuantizer;

/// Codes per storage chunk. With a 16-subspace quantizer one chunk is 1 MiB,
/// big enough to amortize allocation and small enough to keep growth cheap.
const CHUNK_VECTORS: usize = 1 << 16;

/// Dense ordinal-indexed storage of PQ codes, chunked so growth never
/// reallocates existing codes.
///
/// Immutable once built; shared with scorers behind an `Arc`. Ordinals map
/// directly to positions, so this is meant for contiguously numbered
/// collections (a post-cleanup graph, or an on-disk index).
pub struct CompressedVectors {
    quantizer: Arc<ProductQuantizer>,
    code_len: usize,
    chunks: Vec<Box<[u8]>>,
    count: usize,
}

impl CompressedVectors {
    /// Encodes every vector through `quantizer`, in parallel.
    pub fn encode_all(quantizer: Arc<ProductQuantizer>, vectors: &[Vec<f32>]) -> Result<Self> {
        let code_len = quantizer.subspace_count();

        let codes: Vec<Vec<u8>> = vectors
            .par_iter()
            .map(|v| quantizer.encode(v))
            .collect::<Result<_>>()?;

        let mut chunks = Vec::with_capacity(vectors.len().div_ceil(CHUNK_VECTORS));
        for group in codes.chunks(CHUNK_VECTORS) {
            let mut chunk = Vec::with_capacity(group.len() * code_len);
            for code in group {
                chunk.extend_from_slice(code);
            }
            chunks.push(chunk.into_boxed_slice());
        }

        Ok(CompressedVectors {
            quantizer,
            code_len,
            chunks,
            count: vectors.len(),
        })
    }

    /// Wraps pre-encoded codes (the on-disk reader path).
    pub fn from_codes(quantizer: Arc<ProductQuantizer>, codes: Vec<u8>, count: usize) -> Result<Self> {
        let code_len = quantizer.subspace_count();
        if codes.len() != count * code_len {
            return Err(IndexError::format(format!(
                "code buffer holds {} bytes, expected {count} x {code_len}",
                codes.len()
            )));
        }
        // single chunk; the buffer already exists, splitting it buys nothing
        let chunks = if codes.is_empty() {
            Vec::new()
        } else {
            vec![codes.into_boxed_slice()]
        };
        Ok(CompressedVectors {
            quantizer,
            code_len,
            chunks,
            count,
        })
    }

    /// The code of ordinal `i`, if present.
    #[inline]
    pub fn code(&self, ordinal: u32) -> Option<&[u8]> {
        let i = ordinal as usize;
        if i >= self.count {
            return None;
        }
        // from_codes stores everything in one chunk; encode_all stores
        // CHUNK_VECTORS codes per chunk. Derive the geometry from chunk 0.
        let per_chunk = self.chunks[0].len() / self.code_len;
        let (chunk, slot) = (i / per_chunk, i % per_chunk);
        let start = slot * self.code_len;
        Some(&self.chunks[chunk][start..start + self.code_len])
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn quantizer(&self) -> &Arc<ProductQuantizer> {
        &self.quantizer
    }

    /// Bytes per stored code.
    pub fn code_len(&self) -> usize {
        self.code_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::PqTrainParams;
    use rand::prelude::*;

    fn samples(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect()
    }

    #[test]
    fn stores_and_returns_every_code() {
        let data = samples(500, 8, 21);
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

        let cv = CompressedVectors::encode_all(Arc::clone(&pq), &data).unwrap();
        assert_eq!(cv.count(), 500);
        assert_eq!(cv.code_len(), 4);

        for (i, v) in data.iter().enumerate() {
            assert_eq!(cv.code(i as u32).unwrap(), pq.encode(v).unwrap().as_slice());
        }
        assert!(cv.code(500).is_none());
    }

    #[test]
    fn from_codes_round_trips() {
        let data = samples(40, 6, 22);
        let pq = Arc::new(
            ProductQuantizer::train(
                &data,
                PqTrainParams {
                    subspaces: 3,
                    clusters: 8,
                    ..PqTrainParams::default()
                },
            )
            .unwrap(),
        );
        let cv = CompressedVectors::encode_all(Arc::clone(&pq), &data).unwrap();

        let mut flat = Vec::new();
        for i in 0..cv.count() {
            flat.extend_from_slice(cv.code(i as u32).unwrap());
        }
        let rebuilt = CompressedVectors::from_codes(Arc::clone(&pq), flat, cv.count()).unwrap();
        for i in 0..cv.count() as u32 {
            assert_eq!(cv.code(i), rebuilt.code(i));
        }
    }

    #[test]
    fn from_codes_validates_length() {
        let data = samples(10, 4, 23);
        let pq = Arc::new(
            ProductQuantizer::train(
                &data,
                PqTrainParams {
                    subspaces: 2,
                    clusters: 4,
                    ..PqTrainParams::default()
                },
            )
            .unwrap(),
        );
        assert!(CompressedVectors::from_codes(pq, vec![0u8; 7], 10).is_err());
    }

    #[test]
    fn empty_collection_is_fine() {
        let data = samples(10, 4, 24);
        let pq = Arc::new(
            ProductQuantizer::train(
                &data,
                PqTrainParams {
                    subspaces: 2,
                    clusters: 4,
                    ..PqTrainParams::default()
                },
            )
            .unwrap(),
        );
        let cv = CompressedVectors::encode_all(pq, &[]).unwrap();
        assert_eq!(cv.count(), 0);
        assert!(cv.code(0).is_none());
    }
}
