use serde::Serialize;

/// Performance counters for beam search operations.
///
/// Collects metrics about search efficiency: how many searches ran, how many
/// nodes they expanded, how much scoring work each stage did, and how often
/// the termination heuristics cut work short. Counters can be merged across
/// threads for parallel workloads.
#[derive(Debug, Default, Serialize)]
pub struct SearchStats {
    /// Total number of search calls performed
    searches: usize,

    /// Total number of nodes expanded (popped and their edges walked)
    nodes_expanded: usize,

    /// Total number of approximate score evaluations
    approx_scores: usize,

    /// Total number of exact (rerank) score evaluations
    exact_scores: usize,

    /// Number of searches cut short by the score-distribution heuristic
    early_stops: usize,

    /// Number of searches that ran out of their visit budget
    budget_exhaustions: usize,
}

impl SearchStats {
    /// Fresh counters, all zero.
    pub fn new() -> Self {
        SearchStats::default()
    }

    pub fn bump_searches(&mut self) {
        self.searches += 1;
    }

    pub fn searches(&self) -> usize {
        self.searches
    }

    pub fn bump_nodes_expanded(&mut self) {
        self.nodes_expanded += 1;
    }

    pub fn nodes_expanded(&self) -> usize {
        self.nodes_expanded
    }

    pub fn bump_approx_scores(&mut self, amt: usize) {
        self.approx_scores += amt;
    }

    pub fn approx_scores(&self) -> usize {
        self.approx_scores
    }

    pub fn bump_exact_scores(&mut self, amt: usize) {
        self.exact_scores += amt;
    }

    pub fn exact_scores(&self) -> usize {
        self.exact_scores
    }

    pub fn bump_early_stops(&mut self) {
        self.early_stops += 1;
    }

    pub fn early_stops(&self) -> usize {
        self.early_stops
    }

    pub fn bump_budget_exhaustions(&mut self) {
        self.budget_exhaustions += 1;
    }

    pub fn budget_exhaustions(&self) -> usize {
        self.budget_exhaustions
    }

    /// Sums two counter sets, for aggregating per-thread searchers.
    pub fn merge(&self, othr: &Self) -> Self {
        SearchStats {
            searches: self.searches + othr.searches,
            nodes_expanded: self.nodes_expanded + othr.nodes_expanded,
            approx_scores: self.approx_scores + othr.approx_scores,
            exact_scores: self.exact_scores + othr.exact_scores,
            early_stops: self.early_stops + othr.early_stops,
            budget_exhaustions: self.budget_exhaustions + othr.budget_exhaustions,
        }
    }
}
