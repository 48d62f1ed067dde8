use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::graph::GraphView;
use crate::scoring::SearchScoreProvider;
use crate::scoring::Reranker;
use crate::search::{EARLY_STOP_INTERVAL, ScoreWindow};
use crate::sets::candidates::{BoundedResults, FrontierQueue, ScoredNode};
use crate::sets::visited::{PagedVisited, VisitorSet};
use crate::statistics::SearchStats;

/// Knobs for one search.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchParams {
    /// How many results the caller wants. Must satisfy `top_k <= beam_width`.
    pub top_k: usize,
    /// Size of the retained-results set during traversal; wider beams trade
    /// work for recall.
    pub beam_width: usize,
    /// How many approximate survivors get exact rescoring when a reranker is
    /// installed. Defaults to the beam width.
    pub rerank_depth: Option<usize>,
    /// Hard cap on visited (scored) nodes; exceeding it ends the search with
    /// partial results flagged incomplete.
    pub visit_budget: Option<usize>,
    /// Enables the score-distribution early stop.
    pub use_early_stop: bool,
}

impl SearchParams {
    pub fn new(top_k: usize, beam_width: usize) -> Self {
        SearchParams {
            top_k,
            beam_width,
            rerank_depth: None,
            visit_budget: None,
            use_early_stop: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(IndexError::invalid("top_k must be positive"));
        }
        if self.beam_width < self.top_k {
            return Err(IndexError::invalid(format!(
                "beam width {} must be at least top_k {}",
                self.beam_width, self.top_k
            )));
        }
        Ok(())
    }
}

/// The outcome of a search (or of one resumed step of it).
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Up to `top_k` nodes, best-first. Scores are exact when a reranker ran,
    /// approximate otherwise.
    pub results: Vec<ScoredNode>,
    /// Nodes scored and marked visited so far.
    pub visited: usize,
    /// Nodes rescored by the exact stage.
    pub reranked: usize,
    /// The worst *approximate* score that made the final top-K. Callers
    /// combining shards use it to prune approximate work elsewhere.
    pub rerank_floor: f32,
    /// True when the visit budget ran out before the traversal converged.
    pub incomplete: bool,
}

/// The resumable best-first beam searcher.
///
/// A searcher owns its traversal state (frontier, retained results, visited
/// set) as plain data, advanced explicitly by [`search`](Self::search) and
/// [`resume`](Self::resume); nothing suspends. One searcher serves one
/// query at a time but is reusable across queries; buffers and the visited
/// set are recycled.
///
/// Determinism: two searches with identical inputs over identical graph
/// state visit nodes in exactly the same order (best-first, ties to the
/// lower ordinal) and return identical results.
pub struct GraphSearcher {
    frontier: FrontierQueue,
    results: Option<BoundedResults>,
    visited: PagedVisited,
    window: ScoreWindow,
    visited_count: usize,
    stats: SearchStats,
    neighbor_buf: Vec<u32>,
    edge_scores_buf: Vec<f32>,
}

impl GraphSearcher {
    pub fn new() -> Self {
        GraphSearcher {
            frontier: FrontierQueue::new(),
            results: None,
            visited: PagedVisited::new(),
            window: ScoreWindow::new(),
            visited_count: 0,
            stats: SearchStats::new(),
            neighbor_buf: Vec::new(),
            edge_scores_buf: Vec::new(),
        }
    }

    /// Cumulative counters across every search this instance ran.
    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    /// Runs a fresh search for the query `provider` was built around.
    ///
    /// `filter`, when present, suppresses specific ordinals from scoring and
    /// results (they are still traversed *through* via their out-edges'
    /// origins being expanded; a filtered node is simply never admitted).
    pub fn search<V: GraphView>(
        &mut self,
        view: &mut V,
        provider: &mut SearchScoreProvider,
        params: &SearchParams,
        filter: Option<&dyn Fn(u32) -> bool>,
    ) -> Result<SearchResult> {
        params.validate()?;
        self.stats.bump_searches();

        self.frontier.clear();
        self.visited.clear();
        self.window.clear();
        self.visited_count = 0;
        self.results = Some(BoundedResults::new(params.beam_width));

        let Some(entry) = view.entry_point() else {
            // empty graph: nothing to search
            return Ok(SearchResult {
                results: Vec::new(),
                visited: 0,
                reranked: 0,
                rerank_floor: 0.0,
                incomplete: false,
            });
        };

        // seed the entry node into both queues
        let entry_score = provider.approx.similarity_to(entry);
        self.stats.bump_approx_scores(1);
        self.visited.insert(entry);
        self.visited_count = 1;
        self.window.push(entry_score);

        let seed = ScoredNode::new(entry, entry_score);
        self.frontier.push(seed);
        let admissible = view.is_live(entry) && filter.is_none_or(|f| f(entry));
        if admissible {
            self.results.as_mut().unwrap().insert(seed);
        }

        self.advance(view, provider, params, filter)
    }

    /// Continues a previous search: the frontier, visited set and retained
    /// results carry over, so another batch of expansion deepens the same
    /// traversal ("fetch more results" semantics).
    ///
    /// # Errors
    /// `InvariantViolation` if no search has been started on this instance.
    pub fn resume<V: GraphView>(
        &mut self,
        view: &mut V,
        provider: &mut SearchScoreProvider,
        params: &SearchParams,
        filter: Option<&dyn Fn(u32) -> bool>,
    ) -> Result<SearchResult> {
        params.validate()?;
        if self.results.is_none() {
            return Err(IndexError::invariant("resume() before any search()"));
        }
        self.advance(view, provider, params, filter)
    }

    fn advance<V: GraphView>(
        &mut self,
        view: &mut V,
        provider: &mut SearchScoreProvider,
        params: &SearchParams,
        filter: Option<&dyn Fn(u32) -> bool>,
    ) -> Result<SearchResult> {
        let mut incomplete = false;

        while let Some(current) = self.frontier.pop() {
            {
                let results = self.results.as_ref().unwrap();
                // the frontier's best cannot beat the worst retained result:
                // no unexpanded node ever will, since children only score later
                if results.is_full()
                    && current.score < results.worst_score().unwrap()
                {
                    break;
                }
            }

            if let Some(budget) = params.visit_budget
                && self.visited_count >= budget
            {
                // park the candidate so a resumed search picks it back up
                self.frontier.push(current);
                self.stats.bump_budget_exhaustions();
                incomplete = true;
                break;
            }

            view.neighbors_into(current.ordinal, &mut self.neighbor_buf)?;
            self.stats.bump_nodes_expanded();

            if provider.approx.supports_edge_loading() && !self.neighbor_buf.is_empty() {
                // bulk path: one pass over the transposed block scores every
                // out-edge, then the usual admission gates apply per edge
                let degree = self.neighbor_buf.len();
                provider
                    .approx
                    .edge_scores(current.ordinal, degree, &mut self.edge_scores_buf);
                self.stats.bump_approx_scores(degree);
                for i in 0..degree {
                    let neighbor = self.neighbor_buf[i];
                    let score = self.edge_scores_buf[i];
                    self.admit(view, filter, neighbor, score);
                }
            } else {
                for i in 0..self.neighbor_buf.len() {
                    let neighbor = self.neighbor_buf[i];
                    if self.visited.contains(neighbor)
                        || !view.is_live(neighbor)
                        || filter.is_some_and(|f| !f(neighbor))
                    {
                        continue;
                    }
                    let score = provider.approx.similarity_to(neighbor);
                    self.stats.bump_approx_scores(1);
                    self.admit(view, filter, neighbor, score);
                }
            }

            if params.use_early_stop
                && self.visited_count.is_multiple_of(EARLY_STOP_INTERVAL)
                && let Some(floor) = self.current_floor(params.top_k)
                && self.window.should_stop(floor)
            {
                debug!(
                    visited = self.visited_count,
                    floor, "score window says the frontier has gone cold"
                );
                self.stats.bump_early_stops();
                break;
            }
        }

        Ok(self.finish(provider, params, incomplete))
    }

    /// Scores are recorded and the node enters both queues if competitive.
    fn admit<V: GraphView>(
        &mut self,
        view: &V,
        filter: Option<&dyn Fn(u32) -> bool>,
        neighbor: u32,
        score: f32,
    ) {
        if self.visited.contains(neighbor) {
            return;
        }
        self.visited.insert(neighbor);
        self.visited_count += 1;
        self.window.push(score);

        if !view.is_live(neighbor) || filter.is_some_and(|f| !f(neighbor)) {
            return;
        }

        let node = ScoredNode::new(neighbor, score);
        let results = self.results.as_mut().unwrap();
        if results.would_admit(node) {
            results.insert(node);
            self.frontier.push(node);
        }
    }

    /// The worst approximate score currently inside the top-K, if K results
    /// have accumulated.
    fn current_floor(&self, top_k: usize) -> Option<f32> {
        let results = self.results.as_ref()?;
        if results.len() < top_k {
            return None;
        }
        results.iter().nth(top_k - 1).map(|s| s.score)
    }

    fn finish(
        &mut self,
        provider: &mut SearchScoreProvider,
        params: &SearchParams,
        incomplete: bool,
    ) -> SearchResult {
        let results = self.results.as_ref().unwrap();
        let approx_order: Vec<ScoredNode> = results.iter().copied().collect();

        let (final_results, reranked, rerank_floor) = match provider.reranker.as_mut() {
            Some(reranker) => {
                let depth = params
                    .rerank_depth
                    .unwrap_or(params.beam_width)
                    .clamp(params.top_k, approx_order.len().max(params.top_k))
                    .min(approx_order.len());

                let mut rescored: Vec<(ScoredNode, f32)> = approx_order[..depth]
                    .iter()
                    .map(|sn| {
                        let exact = reranker.rerank_similarity_to(sn.ordinal);
                        (ScoredNode::new(sn.ordinal, exact), sn.score)
                    })
                    .collect();
                self.stats.bump_exact_scores(depth);

                rescored.sort_by(|a, b| b.0.cmp(&a.0));
                rescored.truncate(params.top_k);

                let floor = rescored
                    .iter()
                    .map(|(_, approx)| *approx)
                    .fold(f32::INFINITY, f32::min);
                let floor = if floor.is_finite() { floor } else { 0.0 };

                let finals: Vec<ScoredNode> = rescored.into_iter().map(|(sn, _)| sn).collect();
                (finals, depth, floor)
            }
            None => {
                let finals: Vec<ScoredNode> =
                    approx_order.iter().take(params.top_k).copied().collect();
                let floor = finals.last().map(|s| s.score).unwrap_or(0.0);
                (finals, 0, floor)
            }
        };

        SearchResult {
            results: final_results,
            visited: self.visited_count,
            reranked,
            rerank_floor,
            incomplete,
        }
    }
}

impl Default for GraphSearcher {
    fn default() -> Self {
        GraphSearcher::new()
    }
}
