//! Compression of defunct slots and pruning of empty leaves.
//!
//! A slot may be removed when its record is gone for everyone: the locator
//! is null, the slot is known-deleted, or it is pending-deleted and nobody
//! holds a lock on it any more (the deleter committed). It must also have no
//! registered cursor and no lock holder, since both observe slots by index
//! or locator.

use std::sync::atomic::Ordering;

use crate::arena::NodeId;
use crate::error::Result;
use crate::leaf::{LeafBody, Residency};
use crate::slot::Slot;
use crate::tracing_helpers::{debug_log, trace_log};

use super::Tree;

/// What one [`Tree::compress`] pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressStats {
    /// Leaves examined.
    pub leaves_visited: usize,
    /// Slots removed.
    pub slots_removed: usize,
    /// Empty leaves pruned.
    pub leaves_pruned: usize,
}

impl Tree {
    fn is_compressible(&self, body: &LeafBody, idx: usize, slot: &Slot) -> bool {
        let gone = slot.lsn().is_null() || slot.is_known_deleted() || slot.is_pending_deleted();
        gone && !body.cursors().is_referenced(idx)
            && (slot.lsn().is_null() || !self.ctx.locks.is_locked(slot.lsn()))
    }

    /// Remove compressible slots from a latched, full-resident leaf.
    /// Returns the number removed.
    pub(crate) fn compress_body(&self, body: &mut LeafBody) -> usize {
        if body.residency() != Residency::Full {
            return 0;
        }
        let mut removed = 0;
        let mut idx = body.len();
        // Back to front so earlier indices stay valid.
        while idx > 0 {
            idx -= 1;
            if self.is_compressible(body, idx, body.slot(idx)) {
                let slot = body.remove_slot(idx);
                self.ctx
                    .budget
                    .charge(-isize::try_from(slot.cached_bytes()).unwrap_or(0));
                removed += 1;
            }
        }
        if removed > 0 {
            self.counters
                .slots_compressed
                .fetch_add(removed as u64, Ordering::Relaxed);
            trace_log!(removed, "compressed leaf");
        }
        removed
    }

    /// Compress every leaf, left to right, pruning the ones left empty.
    ///
    /// Safe to run concurrently with cursors: each leaf is latched on its
    /// own and the walk re-navigates by fence key.
    ///
    /// # Errors
    /// Navigation or log failures while fetching non-resident leaves.
    pub fn compress(&self) -> Result<CompressStats> {
        let mut stats = CompressStats::default();
        let mut leaf = self.first_leaf()?;
        loop {
            stats.leaves_visited += 1;
            stats.slots_removed += self.compress_body(&mut leaf);

            let empty = leaf.is_empty();
            let id = leaf.id();
            let route: Vec<u8> = leaf.low_fence().map(<[u8]>::to_vec).unwrap_or_default();
            let next: Option<Vec<u8>> = leaf.high_fence().map(<[u8]>::to_vec);
            drop(leaf);

            if empty && self.prune_leaf(id, &route)? {
                stats.leaves_pruned += 1;
            }
            let Some(next) = next else {
                break;
            };
            leaf = self.search_for_read(&next)?;
        }
        debug_log!(?stats, "compression pass");
        Ok(stats)
    }

    /// Remove an empty leaf from its parent.
    ///
    /// Refused (returns `false`) when the leaf is not empty, is pinned, has
    /// cursors, is the root, or is its parent's only child. The neighbour
    /// under the same parent absorbs the leaf's key range.
    ///
    /// # Errors
    /// Arena inconsistencies.
    pub fn prune_leaf(&self, leaf_id: NodeId, route_key: &[u8]) -> Result<bool> {
        let Some((_parent_node, mut parent, idx)) = self.parent_of(leaf_id, route_key)? else {
            return Ok(false);
        };
        if parent.len() <= 1 {
            return Ok(false);
        }
        let mut leaf = self.latch_leaf(leaf_id)?;
        if leaf.is_pruned()
            || !leaf.is_empty()
            || leaf.residency() != Residency::Full
            || !leaf.cursors().is_empty()
            || leaf.node().pin_count() > 0
        {
            return Ok(false);
        }

        if idx > 0 {
            let mut left = self.latch_leaf(parent.child(idx - 1))?;
            left.set_high_fence(leaf.high_fence().map(Box::from));
        } else {
            let mut right = self.latch_leaf(parent.child(1))?;
            right.set_low_fence(leaf.low_fence().map(Box::from));
        }

        leaf.mark_pruned();
        let _ = parent.remove_entry(idx);
        drop(leaf);
        drop(parent);
        let _ = self.arena.remove(leaf_id);
        self.counters.prunes.fetch_add(1, Ordering::Relaxed);
        debug_log!(leaf = %leaf_id, "pruned empty leaf");
        Ok(true)
    }
}
