use crate::sets::candidates::ScoredNode;

/// The Vamana/DiskANN diversity rule.
///
/// Walks `candidates` best-first (each score is the candidate's similarity to
/// the node being wired) and keeps a candidate only when no already-kept edge
/// dominates it: `x` is dropped iff some kept `y` satisfies
/// `similarity(x, y) * alpha > similarity(x, node)`. Stops once `max_degree`
/// edges are kept.
///
/// `alpha = 1.0` reproduces the plain relative-neighborhood rule; values in
/// `1.2..=1.4` retain longer edges and are the usual choice for DiskANN-style
/// graphs, where those long edges keep the graph navigable.
///
/// `similarity(a, b)` is consulted on demand, so the quadratic worst case
/// only materializes for candidates that survive deep into the scan.
///
/// The returned edges are sorted descending by score with duplicates
/// removed, ready for [`crate::graph::NeighborSet::replace_all`].
pub fn robust_prune(
    mut candidates: Vec<ScoredNode>,
    max_degree: usize,
    alpha: f32,
    mut similarity: impl FnMut(u32, u32) -> f32,
) -> Vec<ScoredNode> {
    debug_assert!(alpha >= 1.0, "alpha below 1.0 over-prunes");

    // best-first, ties toward the lower ordinal
    candidates.sort_by(|a, b| b.cmp(a));

    let mut seen = hashbrown::HashSet::with_capacity(candidates.len());
    let mut selected: Vec<ScoredNode> = Vec::with_capacity(max_degree.min(candidates.len()));
    for x in candidates {
        if selected.len() == max_degree {
            break;
        }
        if !seen.insert(x.ordinal) {
            continue;
        }
        let dominated = selected
            .iter()
            .any(|y| similarity(x.ordinal, y.ordinal) * alpha > x.score);
        if !dominated {
            selected.push(x);
        }
    }
    selected
}
