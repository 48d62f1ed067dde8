use std::vec::IntoIter;

use crate::sets::candidates::ScoredNode;

/// A bounded collection retaining the best-scored unique nodes seen so far.
///
/// Keeps at most `capacity` entries, sorted descending by score (ties toward
/// the lower ordinal). When full, an insertion either evicts the current
/// worst member (if the newcomer beats it) or is rejected.
///
/// # Insertion Semantics
/// - Entries duplicating an already-retained ordinal are ignored
/// - If not full, new unique entries are inserted in sorted position
/// - If full and the newcomer outranks the worst member, the worst is evicted
/// - If full and the newcomer does not outrank the worst, it is rejected
///
/// # Time Complexity
/// - `insert`: O(log k) to locate the slot, O(k) worst case to shift;
///   the duplicate check is O(d) over entries sharing the same score
pub struct BoundedResults {
    // sorted descending: best at index 0, worst at the end
    sorted_members: Vec<ScoredNode>,
    capacity: usize,
}

impl BoundedResults {
    /// Creates an empty `BoundedResults` retaining at most `capacity` nodes.
    ///
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        BoundedResults {
            sorted_members: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Attempts to insert a scored node, maintaining sorted order and the
    /// capacity bound.
    ///
    /// # Returns
    /// `true` if the node was retained, `false` if it was rejected as a
    /// duplicate or for scoring below the current worst of a full set.
    pub fn insert(&mut self, item: ScoredNode) -> bool {
        // 1. find the insertion point: first index whose member ranks below `item`
        let idx = self.sorted_members.partition_point(|m| *m > item);

        // 2. duplicate check - the same ordinal can only reappear inside the
        // equal-score run around idx, so scan it in both directions (bitwise,
        // matching the total order, so NaN runs dedup too)
        let same_score = |m: &ScoredNode| m.score.to_bits() == item.score.to_bits();
        let mut check = idx;
        while check < self.sorted_members.len() && same_score(&self.sorted_members[check]) {
            if self.sorted_members[check].ordinal == item.ordinal {
                return false;
            }
            check += 1;
        }
        let mut check = idx;
        while check > 0 && same_score(&self.sorted_members[check - 1]) {
            check -= 1;
            if self.sorted_members[check].ordinal == item.ordinal {
                return false;
            }
        }

        // 3. size management
        if self.sorted_members.len() < self.capacity {
            self.sorted_members.insert(idx, item);
            true
        } else if idx < self.capacity {
            // full, but the newcomer outranks our current worst (last element)
            self.sorted_members.pop();
            self.sorted_members.insert(idx, item);
            true
        } else {
            false
        }
    }

    /// Whether this node would be admitted (or is guaranteed rejection).
    /// Cheaper than `insert` for pre-screening. Comparison uses the full
    /// (score, ordinal) order, so an equal-scored node with a lower ordinal
    /// still displaces the current worst, which is the tie rule searches
    /// rely on.
    pub fn would_admit(&self, item: ScoredNode) -> bool {
        if self.sorted_members.len() < self.capacity {
            return true;
        }
        item > self.sorted_members[self.sorted_members.len() - 1]
    }

    /// The worst retained member, if any is present.
    pub fn worst(&self) -> Option<ScoredNode> {
        self.sorted_members.last().copied()
    }

    /// The worst retained score, if any member is present.
    pub fn worst_score(&self) -> Option<f32> {
        self.sorted_members.last().map(|m| m.score)
    }

    /// The best retained score, if any member is present.
    pub fn best_score(&self) -> Option<f32> {
        self.sorted_members.first().map(|m| m.score)
    }

    pub fn len(&self) -> usize {
        self.sorted_members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_members.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sorted_members.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates members best-first.
    pub fn iter(&self) -> std::slice::Iter<'_, ScoredNode> {
        self.sorted_members.iter()
    }

    /// Drops all members, keeping the allocation and capacity.
    pub fn clear(&mut self) {
        self.sorted_members.clear();
    }
}

impl IntoIterator for BoundedResults {
    type Item = ScoredNode;
    type IntoIter = IntoIter<ScoredNode>;

    /// Consumes the set, yielding members best-first.
    fn into_iter(self) -> IntoIter<ScoredNode> {
        self.sorted_members.into_iter()
    }
}
