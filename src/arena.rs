//! Node storage for one tree.
//!
//! Nodes are addressed by [`NodeId`] rather than by pointer so that cursor
//! positions (which record a node id in an atomic) and parent entries can
//! refer to nodes without borrowing them. Lookups hand out `Arc`s, so a node
//! removed from the arena stays valid for any thread that already resolved
//! it; such a thread sees the node's `pruned` flag once it latches it.
//!
//! Ids are never reused.

use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::internode::InternalNode;
use crate::leaf::LeafNode;

/// Stable node identity within one tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw id.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl StdFmt::Display for NodeId {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A resolved node.
#[derive(Clone, Debug)]
pub enum Node {
    /// Bottom level.
    Leaf(Arc<LeafNode>),
    /// Any level above the leaves.
    Internal(Arc<InternalNode>),
}

/// Id-indexed node table.
pub struct NodeArena {
    nodes: RwLock<Vec<Option<Node>>>,
    next: AtomicU32,
}

impl StdFmt::Debug for NodeArena {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("NodeArena")
            .field("live", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeArena {
    /// Empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            next: AtomicU32::new(0),
        }
    }

    /// Reserve the next id. The node must be installed with one of the
    /// `install_*` methods before the id is published to other threads.
    #[must_use]
    pub fn reserve(&self) -> NodeId {
        NodeId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn install(&self, id: NodeId, node: Node) {
        let idx = id.0 as usize;
        let mut nodes = self.nodes.write();
        if nodes.len() <= idx {
            nodes.resize(idx + 1, None);
        }
        nodes[idx] = Some(node);
    }

    /// Store a leaf under its reserved id.
    pub fn install_leaf(&self, leaf: Arc<LeafNode>) {
        self.install(leaf.id(), Node::Leaf(leaf));
    }

    /// Store an internal node under its reserved id.
    pub fn install_internal(&self, node: Arc<InternalNode>) {
        self.install(node.id(), Node::Internal(node));
    }

    /// Resolve an id.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.nodes.read().get(id.0 as usize).and_then(Clone::clone)
    }

    /// Resolve an id that must name a leaf.
    #[must_use]
    pub fn leaf(&self, id: NodeId) -> Option<Arc<LeafNode>> {
        match self.get(id)? {
            Node::Leaf(leaf) => Some(leaf),
            Node::Internal(_) => None,
        }
    }

    /// Drop a node from the table.
    pub fn remove(&self, id: NodeId) -> Option<Node> {
        self.nodes
            .write()
            .get_mut(id.0 as usize)
            .and_then(Option::take)
    }

    /// Live node count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.read().iter().filter(|n| n.is_some()).count()
    }

    /// No live nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live leaf, in id order.
    #[must_use]
    pub fn leaves(&self) -> Vec<Arc<LeafNode>> {
        self.nodes
            .read()
            .iter()
            .filter_map(|n| match n {
                Some(Node::Leaf(leaf)) => Some(Arc::clone(leaf)),
                _ => None,
            })
            .collect()
    }
}
