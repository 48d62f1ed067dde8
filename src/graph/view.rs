use std::sync::Arc;

use crate::error::Result;
use crate::graph::OnHeapGraph;

/// The read-only window a search traverses a graph through.
///
/// A view is single-threaded: it may reuse internal buffers between calls,
/// so each searching thread obtains its own. Any number of views may coexist
/// over the same graph, and a view over a graph under concurrent
/// construction observes a consistent snapshot of each neighbor set it
/// reads (never a half-written edge list, never a node that is not present).
pub trait GraphView {
    /// Number of nodes currently reachable through this view.
    fn size(&self) -> usize;

    /// Where searches start, once any node has completed insertion.
    fn entry_point(&self) -> Option<u32>;

    /// Copies `ordinal`'s out-neighbors into `out` (score order).
    fn neighbors_into(&mut self, ordinal: u32, out: &mut Vec<u32>) -> Result<()>;

    /// The liveness predicate: present and not soft-deleted. Searches skip
    /// non-live ordinals without scoring them.
    fn is_live(&self, ordinal: u32) -> bool;
}

/// A view over the in-memory graph.
pub struct OnHeapView {
    graph: Arc<OnHeapGraph>,
}

impl OnHeapGraph {
    /// A fresh single-threaded view of this graph.
    pub fn view(self: &Arc<Self>) -> OnHeapView {
        OnHeapView {
            graph: Arc::clone(self),
        }
    }
}

impl GraphView for OnHeapView {
    fn size(&self) -> usize {
        self.graph.size()
    }

    fn entry_point(&self) -> Option<u32> {
        self.graph.entry_point()
    }

    fn neighbors_into(&mut self, ordinal: u32, out: &mut Vec<u32>) -> Result<()> {
        self.graph.neighbors_into(ordinal, out)
    }

    fn is_live(&self, ordinal: u32) -> bool {
        self.graph.is_live(ordinal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sets::candidates::ScoredNode;

    #[test]
    fn view_tracks_the_graph() {
        let g = Arc::new(OnHeapGraph::new(4, 0.25).unwrap());
        g.publish(0).unwrap();
        g.publish(1).unwrap();
        g.node(0)
            .unwrap()
            .neighbors_mut()
            .insert_sorted(ScoredNode::new(1, 0.9));
        g.try_set_entry(0);

        let mut view = g.view();
        assert_eq!(view.size(), 2);
        assert_eq!(view.entry_point(), Some(0));
        assert!(view.is_live(1));

        let mut out = Vec::new();
        view.neighbors_into(0, &mut out).unwrap();
        assert_eq!(out, vec![1]);

        g.mark_deleted(1).unwrap();
        assert!(!view.is_live(1));
    }

    #[test]
    fn several_views_coexist() {
        let g = Arc::new(OnHeapGraph::new(4, 0.25).unwrap());
        g.publish(0).unwrap();
        let v1 = g.view();
        let v2 = g.view();
        assert_eq!(v1.size(), v2.size());
    }
}
