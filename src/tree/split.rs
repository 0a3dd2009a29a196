//! Insert-path descent with preemptive splits.
//!
//! The insert descent splits every full node it passes through, top-down,
//! while holding that node's parent. A node is therefore never full when a
//! separator has to be added to it, and a split never propagates upwards.
//!
//! A full leaf is compressed before it is split: defunct slots with no
//! cursor and no lock are removed, which often frees enough room.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::arena::{Node, NodeId};
use crate::error::{Result, StoreError};
use crate::hooks::FaultPoint;
use crate::internode::{InternalBody, InternalGuard, InternalNode};
use crate::leaf::LeafNode;
use crate::tracing_helpers::{debug_log, trace_log};

use super::{LatchedLeaf, Tree};

const MAX_INSERT_RETRIES: usize = 64;

impl Tree {
    /// The full-resident leaf where `key` belongs, with room for one more
    /// slot.
    ///
    /// No cursor is registered here; the caller registers after deciding
    /// what to do with the slot.
    ///
    /// # Errors
    /// Fault-hook failures and arena inconsistencies.
    pub fn search_for_insert(&self, key: &[u8]) -> Result<LatchedLeaf> {
        for _ in 0..MAX_INSERT_RETRIES {
            let mut root_guard = self.root.latch_timed(self.config.slow_latch);
            let mut parent: (Arc<InternalNode>, InternalGuard) = match self.resolve(*root_guard)? {
                Node::Leaf(node) => {
                    let mut leaf = LatchedLeaf::latch(node, self.config.slow_latch);
                    if leaf.is_pruned() {
                        continue;
                    }
                    self.ensure_full(&mut leaf)?;
                    if !self.needs_split(&mut leaf) {
                        return Ok(leaf);
                    }
                    self.hooks().check(FaultPoint::BeforeLeafSplit)?;
                    let (separator, right) = self.split_leaf(&mut leaf);
                    let new_root = self.grow_root(1, leaf.id(), &separator, right.id());
                    *root_guard = new_root;
                    drop(root_guard);
                    return Ok(self.pick_side(key, &separator, leaf, right));
                }
                Node::Internal(node) => {
                    let mut guard = node.latch().latch_timed(self.config.slow_latch);
                    if guard.is_full(self.config.internal_capacity) {
                        let level = guard.level();
                        let (separator, upper) = guard.split_off_upper();
                        let upper_id = self.install_internal(upper);
                        *root_guard = self.grow_root(level + 1, node.id(), &separator, upper_id);
                        self.counters.internal_splits.fetch_add(1, Ordering::Relaxed);
                        debug_log!(level, "root split; tree grew");
                        continue;
                    }
                    drop(root_guard);
                    (node, guard)
                }
            };

            loop {
                let idx = parent.1.find_child(key);
                let child_id: NodeId = parent.1.child(idx);
                match self.resolve(child_id)? {
                    Node::Internal(child) => {
                        let mut guard = child.latch().latch_timed(self.config.slow_latch);
                        if guard.is_full(self.config.internal_capacity) {
                            let (separator, upper) = guard.split_off_upper();
                            let upper_id = self.install_internal(upper);
                            parent.1.insert_entry(idx + 1, &separator, upper_id);
                            self.counters.internal_splits.fetch_add(1, Ordering::Relaxed);
                            trace_log!(level = guard.level(), "internal split");
                            if key >= &*separator {
                                let upper = self.internal(upper_id)?;
                                let upper_guard = upper.latch().latch_timed(self.config.slow_latch);
                                drop(guard);
                                parent = (upper, upper_guard);
                                continue;
                            }
                        }
                        parent = (child, guard);
                    }
                    Node::Leaf(node) => {
                        let mut leaf = LatchedLeaf::latch(node, self.config.slow_latch);
                        if leaf.is_pruned() {
                            break;
                        }
                        self.ensure_full(&mut leaf)?;
                        if !self.needs_split(&mut leaf) {
                            return Ok(leaf);
                        }
                        self.hooks().check(FaultPoint::BeforeLeafSplit)?;
                        let (separator, right) = self.split_leaf(&mut leaf);
                        parent.1.insert_entry(idx + 1, &separator, right.id());
                        let chosen = self.pick_side(key, &separator, leaf, right);
                        drop(parent);
                        return Ok(chosen);
                    }
                }
            }
        }
        Err(StoreError::unexpected("insert descent kept landing on pruned leaves"))
    }

    /// Compress a full leaf; `true` if it is still full afterwards.
    fn needs_split(&self, leaf: &mut LatchedLeaf) -> bool {
        if !leaf.is_full(self.config.leaf_capacity) {
            return false;
        }
        self.compress_body(leaf);
        leaf.is_full(self.config.leaf_capacity)
    }

    /// Move the upper half of `leaf` into a new right sibling, returned
    /// unlatched together with the separator.
    fn split_leaf(&self, leaf: &mut LatchedLeaf) -> (Box<[u8]>, Arc<LeafNode>) {
        let at = leaf.len() / 2;
        let right_id = self.arena.reserve();
        let right_body = leaf.split_upper(at, right_id);
        let separator: Box<[u8]> = right_body
            .low_fence()
            .map_or_else(Box::default, Box::from);
        let right = Arc::new(LeafNode::new(right_id, right_body));
        self.arena.install_leaf(Arc::clone(&right));
        self.counters.leaf_splits.fetch_add(1, Ordering::Relaxed);
        debug_log!(left = %leaf.id(), right = %right_id, "leaf split");
        (separator, right)
    }

    /// Return whichever half of a fresh split `key` belongs to, latched.
    ///
    /// The right half is only reachable through the still-latched parent
    /// (or root pointer), so latching it while holding the left leaf cannot
    /// deadlock with a descent.
    fn pick_side(
        &self,
        key: &[u8],
        separator: &[u8],
        left: LatchedLeaf,
        right: Arc<LeafNode>,
    ) -> LatchedLeaf {
        if key < separator {
            return left;
        }
        let right = LatchedLeaf::latch(right, self.config.slow_latch);
        drop(left);
        right
    }

    fn install_internal(&self, body: InternalBody) -> NodeId {
        let id = self.arena.reserve();
        self.arena.install_internal(Arc::new(InternalNode::new(id, body)));
        id
    }

    fn grow_root(&self, level: u16, left: NodeId, separator: &[u8], right: NodeId) -> NodeId {
        self.install_internal(InternalBody::new_root(level, left, separator, right))
    }

    fn internal(&self, id: NodeId) -> Result<Arc<InternalNode>> {
        match self.resolve(id)? {
            Node::Internal(node) => Ok(node),
            Node::Leaf(_) => Err(StoreError::unexpected(format!(
                "expected internal node at {id}"
            ))),
        }
    }
}
