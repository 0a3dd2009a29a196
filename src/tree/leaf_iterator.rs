//! Leaf iteration for tree-level diagnostics and validation.
//!
//! [`LeafIterator`] visits every leaf left to right by following high fence
//! keys, latching one leaf at a time. Leaves are yielded as they are: delta
//! and evicted leaves are not fetched.
//!
//! # Concurrency
//! The walk is safe against concurrent splits and prunes (each step
//! re-navigates from the root), but the collected totals are only exact
//! when the tree is quiescent.

use crate::error::{Result, StoreError};
use crate::leaf::Residency;

use super::navigate::Route;
use super::{LatchedLeaf, Tree};

/// Iterator over all leaves of a [`Tree`], left to right.
pub struct LeafIterator<'t> {
    tree: &'t Tree,
    /// `None` once the rightmost leaf was yielded.
    next: Option<Option<Vec<u8>>>,
}

impl<'t> LeafIterator<'t> {
    /// Start at the leftmost leaf.
    #[must_use]
    pub const fn new(tree: &'t Tree) -> Self {
        Self {
            tree,
            next: Some(None),
        }
    }
}

impl Iterator for LeafIterator<'_> {
    type Item = Result<LatchedLeaf>;

    fn next(&mut self) -> Option<Self::Item> {
        let fence = self.next.take()?;
        let leaf = match &fence {
            None => self.tree.descend(Route::First),
            Some(key) => self.tree.descend(Route::Containing(key)),
        };
        match leaf {
            Ok(leaf) => {
                self.next = leaf.high_fence().map(|high| Some(high.to_vec()));
                Some(Ok(leaf))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

/// Statistics collected from iterating over tree leaves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafStats {
    /// Total number of leaves visited
    pub leaf_count: usize,
    /// In-memory slots across all leaves
    pub slot_count: usize,
    /// Slots whose record is structurally defunct
    pub defunct_count: usize,
    /// Leaves held as a delta
    pub delta_leaves: usize,
    /// Leaves with no slots in memory
    pub evicted_leaves: usize,
    /// Leaves changed since their last full image
    pub dirty_leaves: usize,
    /// Registered cursors
    pub cursor_count: usize,
}

impl LeafStats {
    /// Collect statistics from a tree by iterating all leaves.
    ///
    /// # Errors
    /// Navigation failures.
    pub fn collect(tree: &Tree) -> Result<Self> {
        let mut stats = Self::default();
        for leaf in LeafIterator::new(tree) {
            let leaf = leaf?;
            stats.leaf_count += 1;
            stats.slot_count += leaf.len();
            stats.defunct_count += leaf
                .slots()
                .iter()
                .filter(|s| s.is_structurally_defunct())
                .count();
            stats.cursor_count += leaf.cursors().len();
            match leaf.residency() {
                Residency::Full => {}
                Residency::Delta => stats.delta_leaves += 1,
                Residency::Evicted => stats.evicted_leaves += 1,
            }
            if leaf.is_dirty() {
                stats.dirty_leaves += 1;
            }
        }
        Ok(stats)
    }
}

impl Tree {
    /// See [`LeafStats::collect`].
    ///
    /// # Errors
    /// Navigation failures.
    pub fn leaf_stats(&self) -> Result<LeafStats> {
        LeafStats::collect(self)
    }

    /// Check key order and fence coverage across all leaves.
    ///
    /// # Errors
    /// [`StoreError::UnexpectedState`] naming the first violation.
    pub fn verify_order(&self) -> Result<()> {
        let mut expected_low: Option<Vec<u8>> = None;
        for leaf in LeafIterator::new(self) {
            let leaf = leaf?;
            if leaf.low_fence() != expected_low.as_deref() {
                return Err(StoreError::unexpected(format!(
                    "leaf {} low fence {:?} does not continue {:?}",
                    leaf.id(),
                    leaf.low_fence(),
                    expected_low
                )));
            }
            for pair in leaf.slots().windows(2) {
                if pair[0].key() >= pair[1].key() {
                    return Err(StoreError::unexpected(format!(
                        "leaf {} keys out of order",
                        leaf.id()
                    )));
                }
            }
            if let Some(slot) = leaf.slots().iter().find(|s| !leaf.covers(s.key())) {
                return Err(StoreError::unexpected(format!(
                    "leaf {} holds {:?} outside its fences",
                    leaf.id(),
                    slot.key()
                )));
            }
            expected_low = leaf.high_fence().map(<[u8]>::to_vec);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::testing::{key, put_raw, tree};

    #[test]
    fn test_empty_tree_iteration() {
        let tree = tree(4);
        let stats = tree.leaf_stats().unwrap();
        // Empty tree has one leaf (the root)
        assert_eq!(stats.leaf_count, 1);
        assert_eq!(stats.slot_count, 0);
        tree.verify_order().unwrap();
    }

    #[test]
    fn test_simple_tree_iteration() {
        let tree = tree(4);
        for i in 0..10 {
            put_raw(&tree, &key(i), u64::from(i) + 1);
        }
        let stats = tree.leaf_stats().unwrap();
        assert!(stats.leaf_count >= 3);
        assert_eq!(stats.slot_count, 10);
        assert_eq!(stats.defunct_count, 0);
        assert_eq!(stats.dirty_leaves, stats.leaf_count);
    }

    #[test]
    fn test_iterator_yields_leaves_in_key_order() {
        let tree = tree(4);
        for i in (0..30).rev() {
            put_raw(&tree, &key(i), u64::from(i) + 1);
        }
        let mut keys = Vec::new();
        for leaf in LeafIterator::new(&tree) {
            keys.extend(leaf.unwrap().slots().iter().map(|s| s.key().to_vec()));
        }
        assert_eq!(keys, (0..30).map(key).collect::<Vec<_>>());
    }
}
