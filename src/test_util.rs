//! Shared helpers for the in-module test suites.

use std::collections::VecDeque;
use std::sync::Once;

use rand::prelude::*;
use rand_distr::StandardNormal;

use crate::graph::{GraphBuilder, OnHeapGraph};
use crate::numerics::{Similarity, VectorLike};

static TRACING: Once = Once::new();

/// Installs an env-filtered subscriber once per test run, so
/// `RUST_LOG=quiver=debug cargo test` narrates builds and searches.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// `count` random points on the unit sphere in `dim` dimensions.
pub fn random_unit_vectors(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let v: Vec<f32> = (0..dim)
                .map(|_| rng.sample::<f32, _>(StandardNormal))
                .collect();
            v.normalized()
        })
        .collect()
}

/// Brute-force top-k ordinals for `query`, best first.
pub fn brute_force_top_k(
    vectors: &[Vec<f32>],
    query: &[f32],
    similarity: Similarity,
    k: usize,
) -> Vec<u32> {
    let mut scored: Vec<(u32, f32)> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| (i as u32, similarity.score(query, v)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.into_iter().take(k).map(|(i, _)| i).collect()
}

/// Fraction of `truth` recovered in `found`.
pub fn recall(found: &[u32], truth: &[u32]) -> f64 {
    let hits = found.iter().filter(|o| truth.contains(o)).count();
    hits as f64 / truth.len() as f64
}

/// Asserts the structural invariants a cleaned-up graph must satisfy:
/// bounded degree, no self-loops, no duplicate edges, descending score
/// order, only live endpoints, and undirected reachability of every live
/// node from the entry point.
pub fn assert_graph_invariants(builder: &GraphBuilder) {
    let graph: &OnHeapGraph = builder.graph();
    let ordinals = graph.ordinals();
    let m = graph.max_degree();

    let mut undirected: std::collections::HashMap<u32, Vec<u32>> =
        std::collections::HashMap::new();
    for &o in &ordinals {
        let node = graph.node(o).expect("listed ordinal must resolve");
        let neighbors = node.neighbors();
        let edges = neighbors.as_slice();

        assert!(
            edges.len() <= m,
            "node {o} has degree {} over the cap {m}",
            edges.len()
        );
        let mut seen = std::collections::HashSet::new();
        for e in edges {
            assert_ne!(e.ordinal, o, "node {o} points at itself");
            assert!(seen.insert(e.ordinal), "node {o} has duplicate edge {}", e.ordinal);
            assert!(
                graph.is_live(e.ordinal),
                "node {o} points at non-live {}",
                e.ordinal
            );
            undirected.entry(o).or_default().push(e.ordinal);
            undirected.entry(e.ordinal).or_default().push(o);
        }
        for w in edges.windows(2) {
            assert!(
                w[0] >= w[1],
                "node {o} edges out of order: {:?} before {:?}",
                w[0],
                w[1]
            );
        }
    }

    if ordinals.is_empty() {
        return;
    }
    let entry = graph.entry_point().expect("non-empty graph needs an entry");
    assert!(graph.is_live(entry), "entry {entry} is not live");

    // undirected reachability from the entry covers every live node
    let mut reached = std::collections::HashSet::from([entry]);
    let mut queue = VecDeque::from([entry]);
    while let Some(at) = queue.pop_front() {
        for &n in undirected.get(&at).into_iter().flatten() {
            if reached.insert(n) {
                queue.push_back(n);
            }
        }
    }
    for &o in &ordinals {
        assert!(reached.contains(&o), "node {o} unreachable from entry {entry}");
    }
}
