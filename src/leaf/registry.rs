//! Cursors registered on a leaf.
//!
//! Every positioned cursor appears in exactly one leaf's registry. The
//! registry is part of the latched leaf body, so registration changes and
//! slot-index adjustments happen under the same latch as the slot changes
//! that require them.
//!
//! A [`CursorPosition`] is shared between the cursor and the registry. Its
//! node and index are only written while the named leaf is latched; the
//! cursor reads them without a latch to find which leaf to latch, then
//! re-checks the node id once it holds the latch.

use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::arena::NodeId;

/// Identity of one cursor position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorId(u64);

impl CursorId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl StdFmt::Display for CursorId {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Where a cursor is: a leaf id and a slot index within it.
#[derive(Debug)]
pub struct CursorPosition {
    id: CursorId,
    node: AtomicU32,
    index: AtomicUsize,
}

impl CursorPosition {
    /// An unplaced position.
    #[must_use]
    pub const fn new(id: CursorId) -> Self {
        Self {
            id,
            node: AtomicU32::new(u32::MAX),
            index: AtomicUsize::new(0),
        }
    }

    /// Position identity.
    #[must_use]
    pub const fn id(&self) -> CursorId {
        self.id
    }

    /// Leaf the position was last placed on.
    #[must_use]
    pub fn node(&self) -> NodeId {
        NodeId::from_raw(self.node.load(Ordering::Acquire))
    }

    /// Slot index within [`CursorPosition::node`].
    #[must_use]
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    fn place(&self, node: NodeId, index: usize) {
        self.index.store(index, Ordering::Release);
        self.node.store(node.as_raw(), Ordering::Release);
    }

    fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Release);
    }
}

/// The cursors positioned on one leaf.
#[derive(Debug, Default)]
pub struct CursorRegistry {
    entries: Vec<Arc<CursorPosition>>,
}

impl CursorRegistry {
    /// Number of registered cursors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No cursor is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` is registered here.
    #[must_use]
    pub fn contains(&self, id: CursorId) -> bool {
        self.entries.iter().any(|p| p.id == id)
    }

    /// Whether some registered cursor sits on slot `index`.
    #[must_use]
    pub fn is_referenced(&self, index: usize) -> bool {
        self.entries.iter().any(|p| p.index() == index)
    }

    /// Register `position` at `(node, index)`. Re-registering moves it.
    pub(crate) fn register(&mut self, position: &Arc<CursorPosition>, node: NodeId, index: usize) {
        position.place(node, index);
        if !self.contains(position.id) {
            self.entries.push(Arc::clone(position));
        }
    }

    /// Remove `id`. Returns whether it was registered.
    pub(crate) fn deregister(&mut self, id: CursorId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|p| p.id != id);
        before != self.entries.len()
    }

    /// Move a registered cursor to another slot of the same leaf.
    pub(crate) fn move_to(&mut self, id: CursorId, index: usize) -> bool {
        match self.entries.iter().find(|p| p.id == id) {
            Some(position) => {
                position.set_index(index);
                true
            }
            None => false,
        }
    }

    /// A slot was inserted at `index`: shift cursors at or after it.
    pub(crate) fn adjust_for_insert(&mut self, index: usize) {
        for position in &self.entries {
            let current = position.index();
            if current >= index {
                position.set_index(current + 1);
            }
        }
    }

    /// The slot at `index` was removed: shift cursors after it.
    pub(crate) fn adjust_for_remove(&mut self, index: usize) {
        debug_assert!(!self.is_referenced(index), "removed a slot under a cursor");
        for position in &self.entries {
            let current = position.index();
            if current > index {
                position.set_index(current - 1);
            }
        }
    }

    /// Slots `at..` moved to the new leaf `node`: move their cursors along.
    pub(crate) fn split_off(&mut self, at: usize, node: NodeId) -> Self {
        let (moved, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|p| p.index() >= at);
        self.entries = kept;
        for position in &moved {
            position.place(node, position.index() - at);
        }
        Self { entries: moved }
    }

    /// Slots were reordered: map every cursor's index through `map`.
    pub(crate) fn remap(&mut self, map: impl Fn(usize) -> usize) {
        for position in &self.entries {
            position.set_index(map(position.index()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(raw: u64) -> Arc<CursorPosition> {
        Arc::new(CursorPosition::new(CursorId::from_raw(raw)))
    }

    #[test]
    fn test_register_and_deregister() {
        let mut reg = CursorRegistry::default();
        let a = position(1);
        reg.register(&a, NodeId::from_raw(3), 2);
        reg.register(&a, NodeId::from_raw(3), 4);

        assert_eq!(reg.len(), 1);
        assert_eq!(a.index(), 4);
        assert_eq!(a.node(), NodeId::from_raw(3));
        assert!(reg.is_referenced(4));

        assert!(reg.deregister(a.id()));
        assert!(!reg.deregister(a.id()));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_adjust_for_insert_and_remove() {
        let mut reg = CursorRegistry::default();
        let (a, b) = (position(1), position(2));
        reg.register(&a, NodeId::from_raw(0), 1);
        reg.register(&b, NodeId::from_raw(0), 3);

        reg.adjust_for_insert(2);
        assert_eq!((a.index(), b.index()), (1, 4));

        reg.adjust_for_insert(1);
        assert_eq!((a.index(), b.index()), (2, 5));

        reg.adjust_for_remove(3);
        assert_eq!((a.index(), b.index()), (2, 4));
    }

    #[test]
    fn test_split_off_moves_upper_cursors() {
        let mut reg = CursorRegistry::default();
        let (a, b, c) = (position(1), position(2), position(3));
        reg.register(&a, NodeId::from_raw(0), 0);
        reg.register(&b, NodeId::from_raw(0), 5);
        reg.register(&c, NodeId::from_raw(0), 8);

        let moved = reg.split_off(5, NodeId::from_raw(9));

        assert_eq!(reg.len(), 1);
        assert_eq!(moved.len(), 2);
        assert_eq!((b.node(), b.index()), (NodeId::from_raw(9), 0));
        assert_eq!((c.node(), c.index()), (NodeId::from_raw(9), 3));
        assert_eq!((a.node(), a.index()), (NodeId::from_raw(0), 0));
    }

    #[test]
    fn test_remap() {
        let mut reg = CursorRegistry::default();
        let a = position(1);
        reg.register(&a, NodeId::from_raw(0), 1);
        reg.remap(|i| i * 10);
        assert_eq!(a.index(), 10);
    }
}
