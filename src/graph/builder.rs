use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{IndexError, Result};
use crate::graph::{OnHeapGraph, robust_prune};
use crate::numerics::Similarity;
use crate::scoring::{ExactScorer, SearchScoreProvider, VectorStore};
use crate::search::{GraphSearcher, SearchParams};
use crate::sets::candidates::ScoredNode;

/// Seed for cleanup's random edge splicing; xor'd with the node ordinal so
/// repair is deterministic per node.
const SPLICE_SEED: u64 = 0xC1EA_4B1D;

/// Construction parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BuilderParams {
    /// Steady-state out-degree cap `M`.
    pub max_degree: usize,
    /// Beam width of the internal candidate searches.
    pub beam_width: usize,
    /// Diversity relaxation for [`robust_prune`]; 1.2–1.4 is typical.
    pub alpha: f32,
    /// Fractional backlink slack before a neighbor set is re-pruned.
    pub overflow: f32,
}

impl Default for BuilderParams {
    fn default() -> Self {
        BuilderParams {
            max_degree: 32,
            beam_width: 100,
            alpha: 1.2,
            overflow: 0.25,
        }
    }
}

/// Concurrent incremental graph construction.
///
/// Any number of threads may call [`insert`](Self::insert) simultaneously.
/// The only cross-thread coordination is the in-progress ordered set (so
/// overlapping inserts discover each other and link up) and the atomic entry
/// point; every neighbor set is serialized by its own lock.
///
/// [`cleanup`](Self::cleanup) must run with no inserts in flight; it removes
/// soft-deleted nodes, restores degree and connectivity invariants, and
/// relocates the entry point to the approximate medoid.
pub struct GraphBuilder {
    graph: Arc<OnHeapGraph>,
    store: Arc<VectorStore>,
    similarity: Similarity,
    params: BuilderParams,
    in_progress: Mutex<BTreeSet<u32>>,
    in_flight: AtomicUsize,
}

/// Decrements the in-flight counter even when an insert errors out.
struct FlightGuard<'a>(&'a AtomicUsize);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl GraphBuilder {
    pub fn new(
        store: Arc<VectorStore>,
        similarity: Similarity,
        params: BuilderParams,
    ) -> Result<Self> {
        if params.beam_width == 0 {
            return Err(IndexError::invalid("beam width must be positive"));
        }
        if params.alpha < 1.0 {
            return Err(IndexError::invalid("alpha must be at least 1.0"));
        }
        let graph = Arc::new(OnHeapGraph::new(params.max_degree, params.overflow)?);
        Ok(GraphBuilder {
            graph,
            store,
            similarity,
            params,
            in_progress: Mutex::new(BTreeSet::new()),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn graph(&self) -> &Arc<OnHeapGraph> {
        &self.graph
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn similarity(&self) -> Similarity {
        self.similarity
    }

    /// Inserts a vector under `ordinal` and wires it into the graph.
    ///
    /// # Returns
    /// An estimate of the heap bytes the insert added (vector plus edges).
    pub fn insert(&self, ordinal: u32, vector: &[f32]) -> Result<usize> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = FlightGuard(&self.in_flight);
        let result = self.insert_inner(ordinal, vector);
        if result.is_err() {
            // an insert that failed half-way must not linger as in-progress
            self.in_progress.lock().remove(&ordinal);
        }
        result
    }

    fn insert_inner(&self, ordinal: u32, vector: &[f32]) -> Result<usize> {
        self.store.insert(ordinal, vector)?;
        // publish the placeholder first: concurrent writers may link to this
        // node before its own edges exist
        let node = match self.graph.publish(ordinal) {
            Ok(node) => node,
            Err(e) => {
                self.store.remove(ordinal);
                return Err(e);
            }
        };

        let concurrent: Vec<u32> = {
            let mut in_progress = self.in_progress.lock();
            in_progress.insert(ordinal);
            in_progress.iter().copied().filter(|&o| o != ordinal).collect()
        };

        // natural candidates: what a search for this vector finds in the
        // graph as built so far
        let mut candidates: Vec<ScoredNode> = Vec::new();
        if let Some(entry) = self.graph.entry_point()
            && entry != ordinal
        {
            let mut searcher = GraphSearcher::new();
            let mut view = self.graph.view();
            let mut provider = SearchScoreProvider::exact_only(ExactScorer::over_store(
                vector,
                self.similarity,
                Arc::clone(&self.store),
            ));
            let params = SearchParams::new(self.params.beam_width, self.params.beam_width);
            let not_self = |o: u32| o != ordinal;
            let found = searcher.search(&mut view, &mut provider, &params, Some(&not_self))?;
            candidates = found.results;
        }

        // concurrent candidates: overlapping inserts, scored directly
        for o in concurrent {
            if o == ordinal || self.graph.is_deleted(o) {
                continue;
            }
            if let Some(score) = self.store.score_between(ordinal, o, self.similarity) {
                candidates.push(ScoredNode::new(o, score));
            }
        }
        candidates.retain(|c| c.ordinal != ordinal);

        let selected = robust_prune(
            candidates,
            self.params.max_degree,
            self.params.alpha,
            |a, b| self.store.score_between(a, b, self.similarity).unwrap_or(0.0),
        );

        node.neighbors_mut().replace_all(selected.clone());

        // backlink: become a neighbor of each chosen neighbor, pruning any
        // set that has used up its overflow slack
        let mut backlinks = 0usize;
        for edge in &selected {
            let Some(peer) = self.graph.node(edge.ordinal) else {
                continue;
            };
            let mut set = peer.neighbors_mut();
            if set.insert_sorted(ScoredNode::new(ordinal, edge.score)) {
                backlinks += 1;
            }
            if set.is_overflowing() {
                let pruned = robust_prune(
                    set.to_vec(),
                    self.params.max_degree,
                    self.params.alpha,
                    |a, b| self.store.score_between(a, b, self.similarity).unwrap_or(0.0),
                );
                set.replace_all(pruned);
            }
        }

        self.in_progress.lock().remove(&ordinal);
        self.graph.try_set_entry(ordinal);

        Ok(vector.len() * size_of::<f32>() + (selected.len() + backlinks) * size_of::<ScoredNode>())
    }

    /// Soft-deletes `ordinal`; edges are untouched until [`cleanup`](Self::cleanup).
    pub fn mark_deleted(&self, ordinal: u32) -> Result<()> {
        self.graph.mark_deleted(ordinal)
    }

    /// Bulk build: inserts `vectors` under ordinals `0..n` from the rayon
    /// pool, then runs [`cleanup`](Self::cleanup).
    pub fn build_from(&self, vectors: &[Vec<f32>]) -> Result<()> {
        vectors
            .par_iter()
            .enumerate()
            .try_for_each(|(i, v)| self.insert(i as u32, v).map(|_| ()))?;
        self.cleanup()
    }

    /// Removes deleted nodes, restores the degree / connectivity invariants,
    /// and relocates the entry point to the approximate medoid.
    ///
    /// # Errors
    /// `InvariantViolation` when any insert is in flight.
    pub fn cleanup(&self) -> Result<()> {
        if self.in_flight.load(Ordering::Acquire) != 0 || !self.in_progress.lock().is_empty() {
            return Err(IndexError::invariant(
                "cleanup may not run concurrently with inserts",
            ));
        }

        let deleted = self.graph.deletion_set().snapshot();
        let deleted_set: hashbrown::HashSet<u32> = deleted.iter().copied().collect();
        let live = self.graph.live_ordinals();
        let m = self.params.max_degree;
        let min_connections = 1 + m / 2;

        // drop edges into deleted nodes; splice random live edges back into
        // nodes left under-connected
        let mut weakened: Vec<u32> = Vec::new();
        for &o in &live {
            let Some(node) = self.graph.node(o) else {
                continue;
            };
            let mut set = node.neighbors_mut();
            let removed = set.retain_ordinals(|n| !deleted_set.contains(&n));
            if removed > 0 {
                weakened.push(o);
            }
            if set.len() < min_connections && live.len() > 1 {
                let mut rng = StdRng::seed_from_u64(SPLICE_SEED ^ o as u64);
                let mut budget = 2 * m;
                while set.len() < m && budget > 0 {
                    budget -= 1;
                    let candidate = live[rng.random_range(0..live.len())];
                    if candidate == o || set.contains(candidate) {
                        continue;
                    }
                    if let Some(score) = self.store.score_between(o, candidate, self.similarity) {
                        set.insert_sorted(ScoredNode::new(candidate, score));
                    }
                }
            }
        }
        debug!(weakened = weakened.len(), "deleted edges dropped");

        // trim every set back to at most M, diversity-first
        for &o in &live {
            let Some(node) = self.graph.node(o) else {
                continue;
            };
            let current = node.neighbors().to_vec();
            if current.len() > m {
                let pruned = robust_prune(current, m, self.params.alpha, |a, b| {
                    self.store.score_between(a, b, self.similarity).unwrap_or(0.0)
                });
                node.neighbors_mut().replace_all(pruned);
            }
        }

        // repair searches need a live entry point
        match self.graph.entry_point() {
            Some(e) if !deleted_set.contains(&e) => {}
            _ => {
                if let Some(&first) = live.first() {
                    self.graph.set_entry(first);
                }
            }
        }

        // re-wire nodes that lost edges: search for them and merge what the
        // graph now thinks their neighborhoods are
        for &o in &weakened {
            let Some(vector) = self.store.get(o) else {
                continue;
            };
            let Some(node) = self.graph.node(o) else {
                continue;
            };
            let mut searcher = GraphSearcher::new();
            let mut view = self.graph.view();
            let mut provider = SearchScoreProvider::exact_only(ExactScorer::over_store(
                &vector,
                self.similarity,
                Arc::clone(&self.store),
            ));
            let params = SearchParams::new(self.params.beam_width, self.params.beam_width);
            let not_self = |c: u32| c != o;
            let Ok(found) = searcher.search(&mut view, &mut provider, &params, Some(&not_self))
            else {
                continue;
            };

            let mut candidates = node.neighbors().to_vec();
            candidates.extend(found.results);
            let rewired = robust_prune(candidates, m, self.params.alpha, |a, b| {
                self.store.score_between(a, b, self.similarity).unwrap_or(0.0)
            });
            node.neighbors_mut().replace_all(rewired);
        }

        // compact before relocating: the medoid centroid must average live
        // vectors only
        for &d in &deleted {
            self.graph.remove_node(d);
            self.store.remove(d);
        }
        self.graph.deletion_set().clear();

        self.relocate_entry_to_medoid();

        info!(
            removed = deleted.len(),
            size = self.graph.size(),
            "cleanup complete"
        );
        Ok(())
    }

    /// Moves the entry point to the node nearest the centroid of all live
    /// vectors. Silently does nothing on an empty graph.
    fn relocate_entry_to_medoid(&self) {
        let Some(centroid) = self.store.centroid() else {
            return;
        };
        if self.graph.entry_point().is_none() {
            return;
        }

        let mut searcher = GraphSearcher::new();
        let mut view = self.graph.view();
        let mut provider = SearchScoreProvider::exact_only(ExactScorer::over_store(
            &centroid,
            self.similarity,
            Arc::clone(&self.store),
        ));
        let params = SearchParams::new(1, self.params.beam_width);
        if let Ok(found) = searcher.search(&mut view, &mut provider, &params, None)
            && let Some(best) = found.results.first()
        {
            debug!(medoid = best.ordinal, "entry point relocated");
            self.graph.set_entry(best.ordinal);
        }
    }

    /// Consumes the builder, handing the caller the finished graph.
    ///
    /// # Errors
    /// `InvariantViolation` if inserts are still in flight or views of the
    /// graph are still alive.
    pub fn finish(self) -> Result<OnHeapGraph> {
        if self.in_flight.load(Ordering::Acquire) != 0 {
            return Err(IndexError::invariant("finish() with inserts in flight"));
        }
        Arc::try_unwrap(self.graph)
            .map_err(|_| IndexError::invariant("finish() while graph views are alive"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphView;

    fn grid_vectors(n: usize) -> Vec<Vec<f32>> {
        // a deterministic 2-d point cloud without duplicates
        (0..n)
            .map(|i| vec![(i % 10) as f32, (i / 10) as f32 * 1.5])
            .collect()
    }

    fn builder_over(dim: usize, params: BuilderParams) -> GraphBuilder {
        let store = Arc::new(VectorStore::new(dim));
        GraphBuilder::new(store, Similarity::Euclidean, params).unwrap()
    }

    #[test]
    fn first_insert_becomes_the_entry_point() {
        let b = builder_over(2, BuilderParams::default());
        b.insert(7, &[1.0, 2.0]).unwrap();
        assert_eq!(b.graph().entry_point(), Some(7));
        assert_eq!(b.graph().size(), 1);
    }

    #[test]
    fn inserts_wire_both_directions() {
        let b = builder_over(2, BuilderParams {
            max_degree: 4,
            beam_width: 8,
            alpha: 1.0,
            overflow: 0.25,
        });
        b.insert(0, &[0.0, 0.0]).unwrap();
        b.insert(1, &[1.0, 0.0]).unwrap();

        let mut out = Vec::new();
        b.graph().neighbors_into(0, &mut out).unwrap();
        assert_eq!(out, vec![1]);
        b.graph().neighbors_into(1, &mut out).unwrap();
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn duplicate_ordinal_is_rejected_and_leaves_no_residue() {
        let b = builder_over(2, BuilderParams::default());
        b.insert(3, &[0.0, 0.0]).unwrap();
        assert!(b.insert(3, &[1.0, 1.0]).is_err());
        // the failed insert must not block cleanup
        b.cleanup().unwrap();
    }

    #[test]
    fn bulk_build_produces_a_searchable_graph() {
        let vectors = grid_vectors(60);
        let b = builder_over(2, BuilderParams {
            max_degree: 6,
            beam_width: 24,
            alpha: 1.2,
            overflow: 0.25,
        });
        b.build_from(&vectors).unwrap();
        assert_eq!(b.graph().size(), 60);

        // nearest neighbor of an on-grid query is the node itself
        let mut searcher = GraphSearcher::new();
        let mut view = b.graph().view();
        let mut provider = SearchScoreProvider::exact_only(ExactScorer::over_store(
            &vectors[17],
            Similarity::Euclidean,
            Arc::clone(b.store()),
        ));
        let found = searcher
            .search(&mut view, &mut provider, &SearchParams::new(1, 16), None)
            .unwrap();
        assert_eq!(found.results[0].ordinal, 17);
    }

    #[test]
    fn cleanup_enforces_the_degree_cap() {
        let vectors = grid_vectors(50);
        let b = builder_over(2, BuilderParams {
            max_degree: 4,
            beam_width: 16,
            alpha: 1.2,
            overflow: 0.5,
        });
        b.build_from(&vectors).unwrap();

        for o in b.graph().ordinals() {
            let node = b.graph().node(o).unwrap();
            assert!(
                node.neighbors().len() <= 4,
                "node {o} has degree {}",
                node.neighbors().len()
            );
        }
    }

    #[test]
    fn cleanup_removes_deleted_nodes_everywhere() {
        let vectors = grid_vectors(40);
        let b = builder_over(2, BuilderParams {
            max_degree: 4,
            beam_width: 16,
            alpha: 1.2,
            overflow: 0.25,
        });
        b.build_from(&vectors).unwrap();

        for d in [5u32, 17, 23] {
            b.mark_deleted(d).unwrap();
        }
        b.cleanup().unwrap();

        assert_eq!(b.graph().size(), 37);
        let mut out = Vec::new();
        for o in b.graph().ordinals() {
            assert!(![5, 17, 23].contains(&o));
            b.graph().neighbors_into(o, &mut out).unwrap();
            for n in &out {
                assert!(![5, 17, 23].contains(n), "node {o} still points at {n}");
            }
        }
        let entry = b.graph().entry_point().unwrap();
        assert!(![5, 17, 23].contains(&entry));
    }

    #[test]
    fn cleanup_relocates_the_entry_toward_the_middle() {
        // a line of points: the medoid must not be an endpoint
        let vectors: Vec<Vec<f32>> = (0..30).map(|i| vec![i as f32]).collect();
        let b = builder_over(1, BuilderParams {
            max_degree: 4,
            beam_width: 16,
            alpha: 1.2,
            overflow: 0.25,
        });
        b.build_from(&vectors).unwrap();

        let entry = b.graph().entry_point().unwrap();
        assert!((10..20).contains(&entry), "entry {entry} not central");
    }

    #[test]
    fn finish_hands_over_the_graph() {
        let b = builder_over(2, BuilderParams::default());
        b.insert(0, &[0.0, 0.0]).unwrap();
        let graph = b.finish().unwrap();
        assert_eq!(graph.size(), 1);
    }

    #[test]
    fn searching_mid_build_sees_a_consistent_snapshot() {
        // inserts from several threads while a reader keeps searching
        let vectors = grid_vectors(80);
        let b = Arc::new(builder_over(2, BuilderParams {
            max_degree: 6,
            beam_width: 16,
            alpha: 1.2,
            overflow: 0.25,
        }));

        let writer = {
            let b = Arc::clone(&b);
            let vectors = vectors.clone();
            std::thread::spawn(move || {
                for (i, v) in vectors.iter().enumerate() {
                    b.insert(i as u32, v).unwrap();
                }
            })
        };

        let reader = {
            let b = Arc::clone(&b);
            std::thread::spawn(move || {
                let mut searcher = GraphSearcher::new();
                for _ in 0..50 {
                    let mut view = b.graph().view();
                    if view.entry_point().is_none() {
                        continue;
                    }
                    let mut provider = SearchScoreProvider::exact_only(ExactScorer::over_store(
                        &[4.0, 4.0],
                        Similarity::Euclidean,
                        Arc::clone(b.store()),
                    ));
                    let found = searcher
                        .search(&mut view, &mut provider, &SearchParams::new(3, 8), None)
                        .unwrap();
                    // whatever was found must have been present
                    for s in &found.results {
                        assert!(b.graph().contains(s.ordinal));
                    }
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        b.cleanup().unwrap();
        assert_eq!(b.graph().size(), 80);
    }

    // A six-point graph small enough to reason through by hand: the unit
    // square around the origin plus a far pair, under dot-product scoring.

    fn tiny_vectors() -> Vec<Vec<f32>> {
        vec![
            vec![0.0, 0.0],
            vec![0.0, 1.0],
            vec![1.0, 0.0],
            vec![1.0, 1.0],
            vec![10.0, 10.0],
            vec![10.0, 11.0],
        ]
    }

    fn build_tiny() -> GraphBuilder {
        let store = Arc::new(VectorStore::new(2));
        let builder = GraphBuilder::new(
            store,
            Similarity::Dot,
            BuilderParams {
                max_degree: 2,
                beam_width: 4,
                alpha: 1.0,
                overflow: 0.25,
            },
        )
        .unwrap();
        for (i, v) in tiny_vectors().iter().enumerate() {
            builder.insert(i as u32, v).unwrap();
        }
        builder.cleanup().unwrap();
        builder
    }

    #[test]
    fn tiny_graph_top_two_for_the_origin_query() {
        crate::test_util::init_tracing();
        let builder = build_tiny();
        crate::test_util::assert_graph_invariants(&builder);

        let mut searcher = GraphSearcher::new();
        let mut view = builder.graph().view();
        let mut provider = SearchScoreProvider::exact_only(ExactScorer::over_store(
            &[0.0, 0.0],
            Similarity::Dot,
            Arc::clone(builder.store()),
        ));

        let found = searcher
            .search(&mut view, &mut provider, &SearchParams::new(2, 3), None)
            .unwrap();

        // every dot product against the origin is zero, so all six nodes tie
        // and the deterministic tie-break decides: lowest ordinals win
        let ordinals: Vec<u32> = found.results.iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals.len(), 2);
        assert_eq!(ordinals[0], 0);
        assert!(
            ordinals[1] == 1 || ordinals[1] == 2,
            "runner-up should be one of the unit-axis points, got {}",
            ordinals[1]
        );

        assert!(found.visited >= 3, "visited only {}", found.visited);
        assert!(found.visited <= 6, "visited {} of 6 nodes", found.visited);
    }

    #[test]
    fn tiny_graph_searches_are_bitwise_repeatable() {
        let builder = build_tiny();
        let mut searcher = GraphSearcher::new();
        let mut view = builder.graph().view();

        let run = |searcher: &mut GraphSearcher, view: &mut crate::graph::OnHeapView| {
            let mut provider = SearchScoreProvider::exact_only(ExactScorer::over_store(
                &[0.5, 0.5],
                Similarity::Dot,
                Arc::clone(builder.store()),
            ));
            searcher
                .search(view, &mut provider, &SearchParams::new(3, 4), None)
                .unwrap()
        };

        let a = run(&mut searcher, &mut view);
        let b = run(&mut searcher, &mut view);
        assert_eq!(a.results, b.results);
        assert_eq!(a.visited, b.visited);
        assert_eq!(a.rerank_floor, b.rerank_floor);
    }

    #[test]
    fn tiny_graph_results_come_back_best_first() {
        // whatever the beam kept must be a best-ordered prefix of itself
        let builder = build_tiny();
        let mut searcher = GraphSearcher::new();
        let mut view = builder.graph().view();
        let query = [5.0f32, 5.0];
        let mut provider = SearchScoreProvider::exact_only(ExactScorer::over_store(
            &query,
            Similarity::Dot,
            Arc::clone(builder.store()),
        ));

        let found = searcher
            .search(&mut view, &mut provider, &SearchParams::new(4, 6), None)
            .unwrap();

        let scores: Vec<f32> = found.results.iter().map(|s| s.score).collect();
        for w in scores.windows(2) {
            assert!(w[0] >= w[1], "results not best-first: {scores:?}");
        }
    }

    // Soft deletion and cleanup over a random point cloud.

    fn built_unit_sphere(count: usize, seed: u64) -> (GraphBuilder, Vec<Vec<f32>>) {
        let vectors = crate::test_util::random_unit_vectors(count, 3, seed);
        let store = Arc::new(VectorStore::new(3));
        let builder = GraphBuilder::new(
            store,
            Similarity::Euclidean,
            BuilderParams {
                max_degree: 8,
                beam_width: 32,
                alpha: 1.2,
                overflow: 0.25,
            },
        )
        .unwrap();
        builder.build_from(&vectors).unwrap();
        (builder, vectors)
    }

    #[test]
    fn fresh_build_satisfies_every_invariant() {
        crate::test_util::init_tracing();
        let (builder, _) = built_unit_sphere(100, 42);
        crate::test_util::assert_graph_invariants(&builder);
    }

    #[test]
    fn delete_then_cleanup_scrubs_the_victims() {
        let (builder, _) = built_unit_sphere(100, 43);
        let victims = [5u32, 17, 42];

        for &v in &victims {
            builder.mark_deleted(v).unwrap();
        }
        builder.cleanup().unwrap();

        assert_eq!(builder.graph().size(), 97);
        for &v in &victims {
            assert!(!builder.graph().contains(v), "ordinal {v} still present");
            assert!(builder.store().get(v).is_none(), "vector {v} still stored");
        }

        let mut edges = Vec::new();
        for o in builder.graph().ordinals() {
            builder.graph().neighbors_into(o, &mut edges).unwrap();
            for n in &edges {
                assert!(!victims.contains(n), "node {o} still points at deleted {n}");
            }
        }

        let entry = builder.graph().entry_point().unwrap();
        assert!(!victims.contains(&entry));

        crate::test_util::assert_graph_invariants(&builder);
    }

    #[test]
    fn deleted_nodes_stop_appearing_in_results_immediately() {
        let (builder, vectors) = built_unit_sphere(100, 44);

        // find the nearest node to a probe, delete it, search again before
        // any cleanup: the soft-deleted winner must vanish from results
        let probe = &vectors[60];
        let search = |builder: &GraphBuilder| {
            let mut searcher = GraphSearcher::new();
            let mut view = builder.graph().view();
            let mut provider = SearchScoreProvider::exact_only(ExactScorer::over_store(
                probe,
                Similarity::Euclidean,
                Arc::clone(builder.store()),
            ));
            searcher
                .search(&mut view, &mut provider, &SearchParams::new(5, 24), None)
                .unwrap()
        };

        let before = search(&builder);
        let winner = before.results[0].ordinal;
        builder.mark_deleted(winner).unwrap();

        let after = search(&builder);
        assert!(after.results.iter().all(|s| s.ordinal != winner));
    }

    #[test]
    fn cleanup_refuses_to_run_under_concurrent_inserts() {
        let vectors = crate::test_util::random_unit_vectors(200, 3, 45);
        let store = Arc::new(VectorStore::new(3));
        let builder = Arc::new(
            GraphBuilder::new(
                store,
                Similarity::Euclidean,
                BuilderParams {
                    max_degree: 8,
                    beam_width: 32,
                    alpha: 1.2,
                    overflow: 0.25,
                },
            )
            .unwrap(),
        );

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let inserter = {
            let builder = Arc::clone(&builder);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for (i, v) in vectors.iter().enumerate() {
                    builder.insert(i as u32, v).unwrap();
                }
                done.store(true, std::sync::atomic::Ordering::Release);
            })
        };

        // hammer cleanup for the whole insert run; every call must either
        // refuse with InvariantViolation or succeed in a quiet window
        let mut refused = 0;
        while !done.load(std::sync::atomic::Ordering::Acquire) {
            match builder.cleanup() {
                Err(IndexError::InvariantViolation(_)) => refused += 1,
                Err(e) => panic!("unexpected error {e}"),
                Ok(()) => {}
            }
        }
        inserter.join().unwrap();

        // 200 inserts back-to-back leave essentially no quiet windows; a run
        // that never collides means the in-flight guard is broken
        assert!(refused > 0, "cleanup never observed an insert in flight");

        builder.cleanup().unwrap();
        crate::test_util::assert_graph_invariants(&builder);
    }

    #[test]
    fn repeated_delete_cleanup_cycles_stay_consistent() {
        let (builder, _) = built_unit_sphere(120, 46);

        let mut expected = 120usize;
        for round in 0..4u32 {
            let victim = round * 7 + 3;
            if builder.graph().contains(victim) {
                builder.mark_deleted(victim).unwrap();
                expected -= 1;
            }
            builder.cleanup().unwrap();
            assert_eq!(builder.graph().size(), expected);
            crate::test_util::assert_graph_invariants(&builder);
        }
    }

    // Multi-threaded insertion safety and recall parity with a sequential
    // build over the same vectors.

    #[test]
    fn four_threads_build_a_sound_graph_with_sequential_recall() {
        crate::test_util::init_tracing();

        const COUNT: usize = 10_000;
        const DIM: usize = 4;
        const THREADS: usize = 4;

        let recall_params = BuilderParams {
            max_degree: 8,
            beam_width: 16,
            alpha: 1.2,
            overflow: 0.25,
        };
        let top_k = |builder: &GraphBuilder, query: &[f32], k: usize| -> Vec<u32> {
            let mut searcher = GraphSearcher::new();
            let mut view = builder.graph().view();
            let mut provider = SearchScoreProvider::exact_only(ExactScorer::over_store(
                query,
                Similarity::Euclidean,
                Arc::clone(builder.store()),
            ));
            searcher
                .search(&mut view, &mut provider, &SearchParams::new(k, 32), None)
                .unwrap()
                .results
                .iter()
                .map(|s| s.ordinal)
                .collect()
        };

        let vectors = crate::test_util::random_unit_vectors(COUNT, DIM, 77);
        let queries = crate::test_util::random_unit_vectors(8, DIM, 78);

        // concurrent build: four threads, disjoint ordinal ranges
        let concurrent = Arc::new(
            GraphBuilder::new(
                Arc::new(VectorStore::new(DIM)),
                Similarity::Euclidean,
                recall_params,
            )
            .unwrap(),
        );
        let chunk = COUNT / THREADS;
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let builder = Arc::clone(&concurrent);
                let vectors = vectors.clone();
                std::thread::spawn(move || {
                    for i in (t * chunk)..((t + 1) * chunk) {
                        builder.insert(i as u32, &vectors[i]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        concurrent.cleanup().unwrap();

        // the node set is exactly the union of what the threads inserted
        assert_eq!(concurrent.graph().size(), COUNT);
        let ordinals = concurrent.graph().ordinals();
        assert_eq!(ordinals.len(), COUNT);
        assert_eq!(ordinals[0], 0);
        assert_eq!(ordinals[COUNT - 1], (COUNT - 1) as u32);

        crate::test_util::assert_graph_invariants(&concurrent);

        // sequential baseline with identical parameters
        let sequential = GraphBuilder::new(
            Arc::new(VectorStore::new(DIM)),
            Similarity::Euclidean,
            recall_params,
        )
        .unwrap();
        for (i, v) in vectors.iter().enumerate() {
            sequential.insert(i as u32, v).unwrap();
        }
        sequential.cleanup().unwrap();

        // recall against brute force, averaged over held-out queries
        let k = 10;
        let mut concurrent_recall = 0.0;
        let mut sequential_recall = 0.0;
        for query in &queries {
            let truth =
                crate::test_util::brute_force_top_k(&vectors, query, Similarity::Euclidean, k);
            concurrent_recall += crate::test_util::recall(&top_k(&concurrent, query, k), &truth);
            sequential_recall += crate::test_util::recall(&top_k(&sequential, query, k), &truth);
        }
        concurrent_recall /= queries.len() as f64;
        sequential_recall /= queries.len() as f64;

        assert!(
            sequential_recall > 0.5,
            "sequential baseline recall collapsed to {sequential_recall}"
        );
        assert!(
            concurrent_recall >= 0.95 * sequential_recall,
            "concurrent recall {concurrent_recall} vs sequential {sequential_recall}"
        );
    }
}
