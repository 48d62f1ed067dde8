/// A trait for tracking visited nodes during graph traversal.
///
/// Provides a simple boolean flag interface for marking ordinals as visited
/// and checking their status. Implementations may use different backing
/// structures (dense bitmaps, paged maps) with varying space tradeoffs.
pub trait VisitorSet {
    /// Checks whether an ordinal has been visited.
    fn contains(&self, ordinal: u32) -> bool;

    /// Marks an ordinal as visited.
    fn insert(&mut self, ordinal: u32);

    /// Forgets every visit, keeping allocations where possible.
    fn clear(&mut self);
}
