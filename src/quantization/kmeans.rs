//! Lloyd's k-means with k-means++ seeding.
//!
//! Operates on a flat row-major `&[f32]` buffer (`count * dim`), the layout
//! the product quantizer hands over per subspace. Training is deterministic
//! for a fixed seed.

use rand::prelude::*;

use crate::error::{IndexError, Result};
use crate::numerics::VectorLike;

/// Tuning knobs for a single k-means run.
#[derive(Debug, Clone, Copy)]
pub struct KMeansParams {
    /// Hard cap on Lloyd iterations.
    pub max_iters: usize,
    /// Stop early when the relative inertia improvement drops below this.
    pub tolerance: f32,
    /// Seed for k-means++ and empty-cluster reseeding.
    pub seed: u64,
}

impl Default for KMeansParams {
    fn default() -> Self {
        KMeansParams {
            max_iters: 15,
            tolerance: 1e-4,
            seed: 0x5eed,
        }
    }
}

/// The result of a k-means run: `k` centroids over `dim`-dimensional points.
pub struct KMeans {
    /// Row-major `k * dim` centroid buffer.
    pub centroids: Vec<f32>,
    pub dim: usize,
    pub k: usize,
    /// Sum of squared distances from each training point to its centroid at
    /// the final iteration.
    pub inertia: f32,
}

impl KMeans {
    /// The centroid of cluster `c`.
    pub fn centroid(&self, c: usize) -> &[f32] {
        &self.centroids[c * self.dim..(c + 1) * self.dim]
    }

    /// Index of the centroid nearest to `point` by squared L2.
    pub fn nearest(&self, point: &[f32]) -> usize {
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for c in 0..self.k {
            let d = point.l2_squared(self.centroid(c));
            if d < best_dist {
                best_dist = d;
                best = c;
            }
        }
        best
    }
}

/// Runs k-means over `count` points of dimension `dim` stored row-major in
/// `data`.
///
/// Seeding is k-means++: the first centroid is sampled uniformly, each
/// subsequent one proportionally to its squared distance from the nearest
/// centroid chosen so far. Lloyd iterations then alternate assignment and
/// centroid updates until `max_iters` or until the inertia stops improving
/// by more than `tolerance` relatively. A cluster that ends an iteration
/// empty is reseeded from the point farthest from its centroid.
pub fn train(data: &[f32], dim: usize, k: usize, params: KMeansParams) -> Result<KMeans> {
    if dim == 0 || k == 0 {
        return Err(IndexError::invalid("k-means requires dim > 0 and k > 0"));
    }
    let count = data.len() / dim;
    if count * dim != data.len() {
        return Err(IndexError::invalid(format!(
            "training buffer length {} is not a multiple of dim {dim}",
            data.len()
        )));
    }
    if count < k {
        return Err(IndexError::invalid(format!(
            "cannot fit {k} clusters to {count} points"
        )));
    }

    let point = |i: usize| &data[i * dim..(i + 1) * dim];
    let mut rng = StdRng::seed_from_u64(params.seed);

    let mut centroids = seed_plus_plus(data, dim, count, k, &mut rng);
    let mut assignments = vec![0usize; count];
    let mut previous_inertia = f32::INFINITY;
    let mut inertia = f32::INFINITY;

    for _ in 0..params.max_iters {
        // assignment step
        inertia = 0.0;
        for i in 0..count {
            let p = point(i);
            let mut best = 0;
            let mut best_dist = f32::INFINITY;
            for c in 0..k {
                let d = p.l2_squared(&centroids[c * dim..(c + 1) * dim]);
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            assignments[i] = best;
            inertia += best_dist;
        }

        // update step
        let mut sums = vec![0.0f64; k * dim];
        let mut counts = vec![0usize; k];
        for i in 0..count {
            let c = assignments[i];
            counts[c] += 1;
            for (acc, &x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(point(i)) {
                *acc += x as f64;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // reseed a starved cluster from the globally farthest point
                let far = farthest_point(data, dim, count, &centroids, &assignments);
                centroids[c * dim..(c + 1) * dim].copy_from_slice(point(far));
                assignments[far] = c;
                continue;
            }
            let inv = 1.0 / counts[c] as f64;
            for (dst, &acc) in centroids[c * dim..(c + 1) * dim]
                .iter_mut()
                .zip(&sums[c * dim..(c + 1) * dim])
            {
                *dst = (acc * inv) as f32;
            }
        }

        // convergence: relative inertia delta below tolerance
        if previous_inertia.is_finite() {
            let delta = (previous_inertia - inertia).abs();
            if delta <= params.tolerance * previous_inertia.max(1e-12) {
                previous_inertia = inertia;
                break;
            }
        }
        previous_inertia = inertia;
    }

    Ok(KMeans {
        centroids,
        dim,
        k,
        inertia,
    })
}

fn seed_plus_plus(
    data: &[f32],
    dim: usize,
    count: usize,
    k: usize,
    rng: &mut StdRng,
) -> Vec<f32> {
    let point = |i: usize| &data[i * dim..(i + 1) * dim];
    let mut centroids = Vec::with_capacity(k * dim);

    let first = rng.random_range(0..count);
    centroids.extend_from_slice(point(first));

    // running distance-to-nearest-centroid per point, refreshed incrementally
    let mut dists: Vec<f32> = (0..count)
        .map(|i| point(i).l2_squared(point(first)))
        .collect();

    while centroids.len() < k * dim {
        let total: f64 = dists.iter().map(|&d| d as f64).sum();
        let picked = if total <= 0.0 {
            // all remaining points coincide with a centroid; any will do
            rng.random_range(0..count)
        } else {
            let threshold = rng.random::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut picked = count - 1;
            for (i, &d) in dists.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    picked = i;
                    break;
                }
            }
            picked
        };

        let start = centroids.len();
        centroids.extend_from_slice(point(picked));
        let newest = &centroids[start..start + dim];
        let newest = newest.to_vec();
        for (i, d) in dists.iter_mut().enumerate() {
            let nd = point(i).l2_squared(&newest);
            if nd < *d {
                *d = nd;
            }
        }
    }

    centroids
}

fn farthest_point(
    data: &[f32],
    dim: usize,
    count: usize,
    centroids: &[f32],
    assignments: &[usize],
) -> usize {
    let point = |i: usize| &data[i * dim..(i + 1) * dim];
    let mut far = 0;
    let mut far_dist = -1.0f32;
    for i in 0..count {
        let c = assignments[i];
        let d = point(i).l2_squared(&centroids[c * dim..(c + 1) * dim]);
        if d > far_dist {
            far_dist = d;
            far = i;
        }
    }
    far
}
