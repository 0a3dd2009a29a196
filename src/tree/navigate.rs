//! Latch-coupled descents and neighbour lookups.
//!
//! Neighbour leaves are found by key, not by sibling links: a leaf's high
//! fence is the smallest key of its right neighbour's range, and its low
//! fence bounds the left neighbour's range from above. A lookup that starts
//! from "the last key I saw" stays correct even if that key's leaf split or
//! was pruned after it was unlatched.

use crate::arena::{Node, NodeId};
use crate::error::{Result, StoreError};
use crate::internode::{InternalBody, InternalGuard, InternalNode};
use crate::tracing_helpers::trace_log;

use super::{LatchedLeaf, Tree};

use std::sync::Arc;

/// How many times a descent restarts after landing on a pruned leaf before
/// the tree is declared inconsistent.
const MAX_DESCENT_RETRIES: usize = 64;

/// Which child a descent follows at each level.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Route<'a> {
    /// The child whose range contains the key.
    Containing(&'a [u8]),
    /// The child holding the largest keys strictly below the key.
    Before(&'a [u8]),
    /// Leftmost child.
    First,
    /// Rightmost child.
    Last,
}

impl Route<'_> {
    fn select(self, body: &InternalBody) -> usize {
        match self {
            Self::Containing(key) => body.find_child(key),
            Self::Before(key) => body.find_child_before(key),
            Self::First => 0,
            Self::Last => body.len() - 1,
        }
    }
}

impl Tree {
    /// Descend along `route` and return the latched leaf, without changing
    /// its residency.
    pub(crate) fn descend(&self, route: Route<'_>) -> Result<LatchedLeaf> {
        for _ in 0..MAX_DESCENT_RETRIES {
            let root_guard = self.root.latch_timed(self.config.slow_latch);
            let mut parent: (Arc<InternalNode>, InternalGuard) = match self.resolve(*root_guard)? {
                Node::Leaf(leaf) => {
                    let latched = LatchedLeaf::latch(leaf, self.config.slow_latch);
                    drop(root_guard);
                    if latched.is_pruned() {
                        continue;
                    }
                    return Ok(latched);
                }
                Node::Internal(node) => {
                    let guard = node.latch().latch_timed(self.config.slow_latch);
                    drop(root_guard);
                    (node, guard)
                }
            };

            loop {
                let child_id: NodeId = parent.1.child(route.select(&parent.1));
                match self.resolve(child_id)? {
                    Node::Leaf(leaf) => {
                        let latched = LatchedLeaf::latch(leaf, self.config.slow_latch);
                        drop(parent);
                        if latched.is_pruned() {
                            break;
                        }
                        return Ok(latched);
                    }
                    Node::Internal(node) => {
                        let guard = node.latch().latch_timed(self.config.slow_latch);
                        parent = (node, guard);
                    }
                }
            }
            trace_log!(?route, "descent landed on a pruned leaf; restarting");
        }
        Err(StoreError::unexpected("descent kept landing on pruned leaves"))
    }

    /// The full-resident leaf whose range contains `key`.
    pub fn search_for_read(&self, key: &[u8]) -> Result<LatchedLeaf> {
        let mut leaf = self.descend(Route::Containing(key))?;
        self.ensure_full(&mut leaf)?;
        Ok(leaf)
    }

    /// The leaf containing `key`, left as a delta if it is one. Evicted
    /// leaves are still fetched.
    pub(crate) fn search_allow_delta(&self, key: &[u8]) -> Result<LatchedLeaf> {
        let mut leaf = self.descend(Route::Containing(key))?;
        if leaf.residency() == crate::leaf::Residency::Evicted {
            self.ensure_full(&mut leaf)?;
        }
        Ok(leaf)
    }

    /// The full-resident leaf holding the largest keys below `key`.
    pub fn search_before(&self, key: &[u8]) -> Result<LatchedLeaf> {
        let mut leaf = self.descend(Route::Before(key))?;
        self.ensure_full(&mut leaf)?;
        Ok(leaf)
    }

    /// The leftmost leaf, possibly empty.
    pub fn first_leaf(&self) -> Result<LatchedLeaf> {
        let mut leaf = self.descend(Route::First)?;
        self.ensure_full(&mut leaf)?;
        Ok(leaf)
    }

    /// The rightmost leaf, possibly empty.
    pub fn last_leaf(&self) -> Result<LatchedLeaf> {
        let mut leaf = self.descend(Route::Last)?;
        self.ensure_full(&mut leaf)?;
        Ok(leaf)
    }

    /// The smallest slot in the tree, skipping empty leaves.
    pub fn first_position(&self) -> Result<Option<(LatchedLeaf, usize)>> {
        let leaf = self.first_leaf()?;
        if !leaf.is_empty() {
            return Ok(Some((leaf, 0)));
        }
        let Some(fence) = leaf.high_fence().map(<[u8]>::to_vec) else {
            return Ok(None);
        };
        drop(leaf);
        self.position_at_or_after(&fence)
    }

    /// The largest slot in the tree, skipping empty leaves.
    pub fn last_position(&self) -> Result<Option<(LatchedLeaf, usize)>> {
        let leaf = self.last_leaf()?;
        if !leaf.is_empty() {
            let last = leaf.len() - 1;
            return Ok(Some((leaf, last)));
        }
        let Some(fence) = leaf.low_fence().map(<[u8]>::to_vec) else {
            return Ok(None);
        };
        drop(leaf);
        self.prev_leaf(&fence)
    }

    /// The first slot with key `>= key`, in whichever leaf holds it.
    pub fn position_at_or_after(&self, key: &[u8]) -> Result<Option<(LatchedLeaf, usize)>> {
        let leaf = self.search_for_read(key)?;
        let idx = leaf.lower_bound(key);
        if idx < leaf.len() {
            return Ok(Some((leaf, idx)));
        }
        // Nothing >= key here, so nothing == key anywhere.
        drop(leaf);
        self.next_leaf(key)
    }

    /// The first slot with key strictly greater than `after`.
    ///
    /// Used when a cursor steps off the end of a leaf: `after` is the last
    /// key it saw, captured before the old leaf was unlatched.
    pub fn next_leaf(&self, after: &[u8]) -> Result<Option<(LatchedLeaf, usize)>> {
        let mut leaf = self.search_for_read(after)?;
        loop {
            let idx = leaf.upper_bound(after);
            if idx < leaf.len() {
                return Ok(Some((leaf, idx)));
            }
            let Some(fence) = leaf.high_fence().map(<[u8]>::to_vec) else {
                return Ok(None);
            };
            drop(leaf);
            leaf = self.search_for_read(&fence)?;
        }
    }

    /// The last slot with key strictly less than `before`.
    pub fn prev_leaf(&self, before: &[u8]) -> Result<Option<(LatchedLeaf, usize)>> {
        let mut leaf = self.search_for_read(before)?;
        let mut bound: Vec<u8> = before.to_vec();
        loop {
            let idx = leaf.lower_bound(&bound);
            if idx > 0 {
                return Ok(Some((leaf, idx - 1)));
            }
            let Some(fence) = leaf.low_fence().map(<[u8]>::to_vec) else {
                return Ok(None);
            };
            drop(leaf);
            leaf = self.search_before(&fence)?;
            bound = fence;
        }
    }

    /// Latch the level-1 parent of `leaf_id`, found by descending towards
    /// `route_key`, together with the leaf's index in it.
    ///
    /// `None` when the leaf is the root or is no longer a child of the node
    /// `route_key` routes to (it split or was pruned since the key was
    /// captured). The caller must not hold any leaf latch.
    pub(crate) fn parent_of(
        &self,
        leaf_id: NodeId,
        route_key: &[u8],
    ) -> Result<Option<(Arc<InternalNode>, InternalGuard, usize)>> {
        let root_guard = self.root.latch_timed(self.config.slow_latch);
        let mut node: Arc<InternalNode> = match self.resolve(*root_guard)? {
            Node::Leaf(_) => return Ok(None),
            Node::Internal(node) => node,
        };
        let mut guard = node.latch().latch_timed(self.config.slow_latch);
        drop(root_guard);

        while !guard.is_leaf_parent() {
            let child_id = guard.child(guard.find_child(route_key));
            let Node::Internal(child) = self.resolve(child_id)? else {
                return Err(StoreError::unexpected(format!(
                    "level {} node has a leaf child {child_id}",
                    guard.level()
                )));
            };
            let child_guard = child.latch().latch_timed(self.config.slow_latch);
            node = child;
            guard = child_guard;
        }

        Ok(guard.index_of(leaf_id).map(|idx| (node, guard, idx)))
    }
}
