//! Internal (routing) nodes.
//!
//! Internal nodes hold only separator keys and child ids. Entry 0's key is a
//! virtual negative infinity and is never compared.
//!
//! # Routing Model
//!
//! ```text
//!     [ -inf:C0 | K1:C1 | K2:C2 ]
//!        /        |        \
//!      C0        C1         C2
//!
//!    C0: keys < K1
//!    C1: keys >= K1 and < K2
//!    C2: keys >= K2
//! ```
//!
//! # Latching
//! The body sits behind a [`Latch`]. Descents latch a child before releasing
//! its parent; splits and prunes hold the parent latch while they modify the
//! parent's entries and the affected children.

use std::fmt as StdFmt;

use crate::arena::NodeId;
use crate::latch::{Latch, LatchGuard};

/// Separator key plus the child it routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    key: Box<[u8]>,
    child: NodeId,
}

impl ChildEntry {
    /// Separator. Meaningless for entry 0.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Child id.
    #[must_use]
    pub const fn child(&self) -> NodeId {
        self.child
    }
}

/// Latched contents of an internal node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalBody {
    /// 1 when the children are leaves.
    level: u16,
    entries: Vec<ChildEntry>,
}

impl InternalBody {
    /// A root with two children split at `separator`.
    #[must_use]
    pub fn new_root(level: u16, left: NodeId, separator: &[u8], right: NodeId) -> Self {
        Self {
            level,
            entries: vec![
                ChildEntry {
                    key: Box::default(),
                    child: left,
                },
                ChildEntry {
                    key: separator.into(),
                    child: right,
                },
            ],
        }
    }

    /// Height above the leaves.
    #[must_use]
    pub const fn level(&self) -> u16 {
        self.level
    }

    /// Children are leaves.
    #[must_use]
    pub const fn is_leaf_parent(&self) -> bool {
        self.level == 1
    }

    /// Number of children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Never true for a node reachable from the root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry `idx`.
    #[must_use]
    pub fn entry(&self, idx: usize) -> &ChildEntry {
        &self.entries[idx]
    }

    /// Child id at `idx`.
    #[must_use]
    pub fn child(&self, idx: usize) -> NodeId {
        self.entries[idx].child
    }

    /// All entries.
    #[must_use]
    pub fn entries(&self) -> &[ChildEntry] {
        &self.entries
    }

    /// Index of the child whose range contains `key`.
    #[must_use]
    pub fn find_child(&self, key: &[u8]) -> usize {
        // Entries 1.. are sorted; count how many separators are <= key.
        self.entries[1..].partition_point(|e| &*e.key <= key)
    }

    /// Index of the child holding the largest keys strictly below `key`.
    #[must_use]
    pub fn find_child_before(&self, key: &[u8]) -> usize {
        self.entries[1..].partition_point(|e| &*e.key < key)
    }

    /// Position of `child`, if it is one of this node's children.
    #[must_use]
    pub fn index_of(&self, child: NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.child == child)
    }

    /// Whether another separator would exceed `capacity`.
    #[must_use]
    pub fn is_full(&self, capacity: usize) -> bool {
        self.entries.len() >= capacity
    }

    /// Insert `(separator, child)` at `idx` (which must be > 0).
    pub(crate) fn insert_entry(&mut self, idx: usize, separator: &[u8], child: NodeId) {
        debug_assert!(idx > 0, "entry 0 is the -inf child");
        debug_assert!(
            idx == 1 || &*self.entries[idx - 1].key < separator,
            "separator out of order"
        );
        self.entries.insert(
            idx,
            ChildEntry {
                key: separator.into(),
                child,
            },
        );
    }

    /// Remove entry `idx`. Removing entry 0 promotes entry 1 to the -inf slot.
    pub(crate) fn remove_entry(&mut self, idx: usize) -> ChildEntry {
        self.entries.remove(idx)
    }

    /// Move the upper half of the entries into a new sibling body.
    ///
    /// Returns the sibling and the separator that routes to it.
    pub(crate) fn split_off_upper(&mut self) -> (Box<[u8]>, Self) {
        let mid = self.entries.len() / 2;
        let upper = self.entries.split_off(mid);
        let separator = upper[0].key.clone();
        (
            separator,
            Self {
                level: self.level,
                entries: upper,
            },
        )
    }
}

/// An internal node.
pub struct InternalNode {
    id: NodeId,
    latch: Latch<InternalBody>,
}

impl StdFmt::Debug for InternalNode {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("InternalNode")
            .field("id", &self.id)
            .field("latch", &self.latch)
            .finish()
    }
}

impl InternalNode {
    /// Wrap a body.
    #[must_use]
    pub fn new(id: NodeId, body: InternalBody) -> Self {
        Self {
            id,
            latch: Latch::new(body),
        }
    }

    /// Node id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// The latch protecting the body.
    #[must_use]
    pub const fn latch(&self) -> &Latch<InternalBody> {
        &self.latch
    }
}

/// Latched internal node body.
pub type InternalGuard = LatchGuard<InternalBody>;

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> NodeId {
        NodeId::from_raw(raw)
    }

    fn body() -> InternalBody {
        let mut body = InternalBody::new_root(1, id(0), b"g", id(1));
        body.insert_entry(2, b"p", id(2));
        body
    }

    #[test]
    fn test_find_child_routes_by_separator() {
        let body = body();
        assert_eq!(body.find_child(b"a"), 0);
        assert_eq!(body.find_child(b"g"), 1);
        assert_eq!(body.find_child(b"h"), 1);
        assert_eq!(body.find_child(b"p"), 2);
        assert_eq!(body.find_child(b"zzz"), 2);
    }

    #[test]
    fn test_find_child_before_is_strict() {
        let body = body();
        assert_eq!(body.find_child_before(b"g"), 0);
        assert_eq!(body.find_child_before(b"h"), 1);
        assert_eq!(body.find_child_before(b"p"), 1);
        assert_eq!(body.find_child_before(b"q"), 2);
    }

    #[test]
    fn test_remove_first_promotes_second() {
        let mut body = body();
        let removed = body.remove_entry(0);
        assert_eq!(removed.child(), id(0));
        // "a" now routes to the old entry 1.
        assert_eq!(body.child(body.find_child(b"a")), id(1));
        assert_eq!(body.index_of(id(2)), Some(1));
    }

    #[test]
    fn test_split_off_upper() {
        let mut body = body();
        body.insert_entry(3, b"t", id(3));
        let (sep, upper) = body.split_off_upper();

        assert_eq!(&*sep, b"p");
        assert_eq!(body.len(), 2);
        assert_eq!(upper.len(), 2);
        assert_eq!(upper.level(), 1);
        assert_eq!(upper.child(upper.find_child(b"zz")), id(3));
    }

    #[test]
    fn test_is_full() {
        let body = body();
        assert!(body.is_full(3));
        assert!(!body.is_full(4));
    }
}
