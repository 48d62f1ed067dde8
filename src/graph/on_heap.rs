use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{IndexError, Result};
use crate::graph::NeighborSet;
use crate::sets::deletion::DeletionSet;

/// Sentinel for "no entry point yet".
const NO_ENTRY: u32 = u32::MAX;

/// One node's mutable state: its neighbor set behind a private lock.
///
/// Nodes are shared as `Arc<NodeEntry>` so a reader can keep traversing a
/// node it already resolved even while the graph map is concurrently
/// extended.
pub struct NodeEntry {
    neighbors: RwLock<NeighborSet>,
}

impl NodeEntry {
    fn new(capacity: usize, overflow: f32) -> Self {
        NodeEntry {
            neighbors: RwLock::new(NeighborSet::new(capacity, overflow)),
        }
    }

    /// Shared access to the edge list.
    pub fn neighbors(&self) -> RwLockReadGuard<'_, NeighborSet> {
        self.neighbors.read()
    }

    /// Exclusive access to the edge list; hold briefly.
    pub fn neighbors_mut(&self) -> RwLockWriteGuard<'_, NeighborSet> {
        self.neighbors.write()
    }
}

/// The in-memory proximity graph: a concurrent arena of ordinal → neighbor
/// set, plus the entry point and the soft-deletion bitmap.
///
/// Nodes hold *ordinals*, never references, so the cyclic adjacency
/// structure needs no ownership gymnastics: the map is the single owner and
/// every edge is a non-owning index into it.
///
/// The map is append-only during building; nodes leave it only through
/// cleanup's compaction. The entry point is set once by the first completed
/// insert (compare-and-set) and only rewritten by cleanup.
pub struct OnHeapGraph {
    nodes: RwLock<HashMap<u32, Arc<NodeEntry>>>,
    entry: AtomicU32,
    deleted: DeletionSet,
    max_degree: usize,
    overflow: f32,
}

impl OnHeapGraph {
    /// An empty graph with out-degree cap `max_degree` and backlink overflow
    /// slack `overflow`.
    pub fn new(max_degree: usize, overflow: f32) -> Result<Self> {
        if max_degree == 0 {
            return Err(IndexError::invalid("max degree must be positive"));
        }
        if !(0.0..=4.0).contains(&overflow) {
            return Err(IndexError::invalid("overflow must be in 0.0..=4.0"));
        }
        Ok(OnHeapGraph {
            nodes: RwLock::new(HashMap::new()),
            entry: AtomicU32::new(NO_ENTRY),
            deleted: DeletionSet::new(),
            max_degree,
            overflow,
        })
    }

    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    pub fn overflow(&self) -> f32 {
        self.overflow
    }

    /// Number of nodes currently in the arena (deleted-but-not-compacted
    /// nodes included).
    pub fn size(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn contains(&self, ordinal: u32) -> bool {
        self.nodes.read().contains_key(&ordinal)
    }

    /// Resolves a node for traversal or mutation.
    pub fn node(&self, ordinal: u32) -> Option<Arc<NodeEntry>> {
        self.nodes.read().get(&ordinal).cloned()
    }

    /// Publishes an empty neighbor set for `ordinal`, making the node
    /// visible to concurrent writers before its edges exist.
    ///
    /// # Errors
    /// `InvariantViolation` if the ordinal is already published.
    pub fn publish(&self, ordinal: u32) -> Result<Arc<NodeEntry>> {
        if ordinal == NO_ENTRY {
            return Err(IndexError::invalid("ordinal u32::MAX is reserved"));
        }
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&ordinal) {
            return Err(IndexError::invariant(format!(
                "ordinal {ordinal} is already published"
            )));
        }
        let entry = Arc::new(NodeEntry::new(self.max_degree, self.overflow));
        nodes.insert(ordinal, Arc::clone(&entry));
        Ok(entry)
    }

    /// Removes a node from the arena (cleanup compaction only).
    pub(crate) fn remove_node(&self, ordinal: u32) {
        self.nodes.write().remove(&ordinal);
    }

    /// The ordinal every search starts from, once one exists.
    pub fn entry_point(&self) -> Option<u32> {
        match self.entry.load(Ordering::Acquire) {
            NO_ENTRY => None,
            e => Some(e),
        }
    }

    /// Installs `ordinal` as the entry point only if none is set yet.
    ///
    /// # Returns
    /// `true` if this call installed it.
    pub fn try_set_entry(&self, ordinal: u32) -> bool {
        self.entry
            .compare_exchange(NO_ENTRY, ordinal, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally moves the entry point (cleanup only).
    pub(crate) fn set_entry(&self, ordinal: u32) {
        self.entry.store(ordinal, Ordering::Release);
    }

    /// Soft-deletes a node: flips its bit, leaves every edge alone.
    pub fn mark_deleted(&self, ordinal: u32) -> Result<()> {
        if !self.contains(ordinal) {
            return Err(IndexError::NotFound(ordinal));
        }
        self.deleted.mark(ordinal);
        Ok(())
    }

    pub fn is_deleted(&self, ordinal: u32) -> bool {
        self.deleted.contains(ordinal)
    }

    /// Present and not soft-deleted.
    pub fn is_live(&self, ordinal: u32) -> bool {
        self.contains(ordinal) && !self.deleted.contains(ordinal)
    }

    pub(crate) fn deletion_set(&self) -> &DeletionSet {
        &self.deleted
    }

    /// Every published ordinal, ascending.
    pub fn ordinals(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self.nodes.read().keys().copied().collect();
        out.sort_unstable();
        out
    }

    /// Every live ordinal, ascending.
    pub fn live_ordinals(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self
            .nodes
            .read()
            .keys()
            .copied()
            .filter(|&o| !self.deleted.contains(o))
            .collect();
        out.sort_unstable();
        out
    }

    /// Copies `ordinal`'s current neighbor ordinals into `out`.
    pub fn neighbors_into(&self, ordinal: u32, out: &mut Vec<u32>) -> Result<()> {
        let node = self.node(ordinal).ok_or(IndexError::NotFound(ordinal))?;
        node.neighbors().ordinals_into(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sets::candidates::ScoredNode;

    #[test]
    fn publish_then_resolve() {
        let g = OnHeapGraph::new(4, 0.25).unwrap();
        assert_eq!(g.size(), 0);

        g.publish(3).unwrap();
        assert!(g.contains(3));
        assert!(g.node(3).unwrap().neighbors().is_empty());
        assert_eq!(g.size(), 1);
    }

    #[test]
    fn double_publish_is_an_invariant_violation() {
        let g = OnHeapGraph::new(4, 0.25).unwrap();
        g.publish(1).unwrap();
        assert!(matches!(
            g.publish(1),
            Err(IndexError::InvariantViolation(_))
        ));
    }

    #[test]
    fn entry_point_sets_exactly_once() {
        let g = OnHeapGraph::new(4, 0.25).unwrap();
        assert_eq!(g.entry_point(), None);

        assert!(g.try_set_entry(5));
        assert!(!g.try_set_entry(9));
        assert_eq!(g.entry_point(), Some(5));

        g.set_entry(9);
        assert_eq!(g.entry_point(), Some(9));
    }

    #[test]
    fn soft_delete_leaves_edges_alone() {
        let g = OnHeapGraph::new(4, 0.25).unwrap();
        g.publish(0).unwrap();
        g.publish(1).unwrap();
        g.node(0)
            .unwrap()
            .neighbors_mut()
            .insert_sorted(ScoredNode::new(1, 0.8));

        g.mark_deleted(1).unwrap();
        assert!(g.is_deleted(1));
        assert!(!g.is_live(1));
        assert!(g.contains(1));

        let mut out = Vec::new();
        g.neighbors_into(0, &mut out).unwrap();
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn deleting_an_absent_ordinal_is_not_found() {
        let g = OnHeapGraph::new(4, 0.25).unwrap();
        assert!(matches!(g.mark_deleted(7), Err(IndexError::NotFound(7))));
    }

    #[test]
    fn live_ordinals_exclude_deleted() {
        let g = OnHeapGraph::new(4, 0.25).unwrap();
        for o in [2u32, 0, 5] {
            g.publish(o).unwrap();
        }
        g.mark_deleted(2).unwrap();
        assert_eq!(g.ordinals(), vec![0, 2, 5]);
        assert_eq!(g.live_ordinals(), vec![0, 5]);
    }

    #[test]
    fn validates_construction_parameters() {
        assert!(OnHeapGraph::new(0, 0.25).is_err());
        assert!(OnHeapGraph::new(8, -0.5).is_err());
    }

    #[test]
    fn concurrent_publishes_all_land() {
        let g = std::sync::Arc::new(OnHeapGraph::new(8, 0.25).unwrap());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let g = std::sync::Arc::clone(&g);
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        g.publish(t * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(g.size(), 2000);
    }
}
