//! Leaf nodes.
//!
//! A leaf holds sorted [`Slot`]s plus everything that must change atomically
//! with them: the cursor registry, the key-range fences and the residency
//! state. All of it lives in [`LeafBody`] behind the node's [`Latch`].
//!
//! # Residency
//!
//! ```text
//!   Full  --evict (clean)-->  Evicted
//!   Full  --evict (few dirty)-->  Delta   (dirty slots + filter over image)
//!   Delta / Evicted  --fetch-->  Full     (log image, delta merged on top)
//! ```
//!
//! Only full leaves are searched by key. Blind deletion is the one operation
//! that works on a delta directly.
//!
//! # Fences
//! `low_fence <= key < high_fence` for every slot. `None` is unbounded. The
//! navigator finds neighbour leaves by searching for a fence key, so fences
//! must be kept exact across splits and prunes.
//!
//! # Pins
//! The pin count lives outside the latch. A pinned leaf is never pruned or
//! evicted; a cursor pins its leaf while it crosses to the next one.

pub mod delta;
pub mod registry;

use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::arena::NodeId;
use crate::latch::{Latch, LatchGuard};
use crate::lsn::Lsn;
use crate::slot::Slot;

use self::delta::{KeyFilter, merge_delta};
use self::registry::CursorRegistry;

/// What part of a leaf is in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    /// Every slot.
    Full,
    /// Only slots dirtied since the last full image.
    Delta,
    /// No slots; the last full image is in the log.
    Evicted,
}

/// The last full image written to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullImage {
    lsn: Lsn,
    filter: KeyFilter,
}

impl FullImage {
    /// Locator of the image.
    #[must_use]
    pub const fn lsn(&self) -> Lsn {
        self.lsn
    }
}

/// Latched contents of a leaf.
#[derive(Debug)]
pub struct LeafBody {
    slots: Vec<Slot>,
    residency: Residency,
    full_image: Option<FullImage>,
    /// A slot was removed since the last full image; a delta cannot express
    /// that.
    slots_removed: bool,
    pruned: bool,
    low_fence: Option<Box<[u8]>>,
    high_fence: Option<Box<[u8]>>,
    cursors: CursorRegistry,
}

impl LeafBody {
    /// The single leaf of an empty tree.
    #[must_use]
    pub fn empty_root() -> Self {
        Self::with_slots(Vec::new(), None, None)
    }

    fn with_slots(
        slots: Vec<Slot>,
        low_fence: Option<Box<[u8]>>,
        high_fence: Option<Box<[u8]>>,
    ) -> Self {
        Self {
            slots,
            residency: Residency::Full,
            full_image: None,
            slots_removed: false,
            pruned: false,
            low_fence,
            high_fence,
            cursors: CursorRegistry::default(),
        }
    }

    // ========================================================================
    //  Slots
    // ========================================================================

    /// In-memory slots, sorted by key.
    #[must_use]
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Slot `idx`.
    #[inline]
    #[must_use]
    pub fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, idx: usize) -> &mut Slot {
        &mut self.slots[idx]
    }

    /// In-memory slot count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// No in-memory slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Binary search by key.
    ///
    /// # Errors
    /// `Err(idx)` is the insertion point when the key is absent.
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.slots.binary_search_by(|s| s.key().cmp(key))
    }

    /// Index of the first slot with key `>= key`.
    #[must_use]
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.slots.partition_point(|s| s.key() < key)
    }

    /// Index of the first slot with key `> key`.
    #[must_use]
    pub fn upper_bound(&self, key: &[u8]) -> usize {
        self.slots.partition_point(|s| s.key() <= key)
    }

    /// Whether inserting another slot needs a split first.
    #[must_use]
    pub fn is_full(&self, capacity: usize) -> bool {
        self.slots.len() >= capacity
    }

    /// Insert `slot` at `idx`, shifting registered cursors.
    pub(crate) fn insert_slot(&mut self, idx: usize, slot: Slot) {
        debug_assert!(idx == 0 || self.slots[idx - 1].key() < slot.key());
        debug_assert!(idx == self.slots.len() || slot.key() < self.slots[idx].key());
        self.slots.insert(idx, slot);
        self.cursors.adjust_for_insert(idx);
    }

    /// Remove the slot at `idx`. No cursor may be registered on it.
    pub(crate) fn remove_slot(&mut self, idx: usize) -> Slot {
        self.cursors.adjust_for_remove(idx);
        self.slots_removed = true;
        self.slots.remove(idx)
    }

    /// Cached (evictable) value bytes held by this leaf.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.slots.iter().map(Slot::cached_bytes).sum()
    }

    /// Slots changed since the last full image.
    #[must_use]
    pub fn dirty_slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_dirty()).count()
    }

    // ========================================================================
    //  Fences
    // ========================================================================

    /// Inclusive lower bound of the leaf's key range.
    #[must_use]
    pub fn low_fence(&self) -> Option<&[u8]> {
        self.low_fence.as_deref()
    }

    /// Exclusive upper bound of the leaf's key range.
    #[must_use]
    pub fn high_fence(&self) -> Option<&[u8]> {
        self.high_fence.as_deref()
    }

    /// Whether `key` falls in this leaf's range.
    #[must_use]
    pub fn covers(&self, key: &[u8]) -> bool {
        self.low_fence.as_deref().is_none_or(|low| low <= key)
            && self.high_fence.as_deref().is_none_or(|high| key < high)
    }

    pub(crate) fn set_low_fence(&mut self, fence: Option<Box<[u8]>>) {
        self.low_fence = fence;
    }

    pub(crate) fn set_high_fence(&mut self, fence: Option<Box<[u8]>>) {
        self.high_fence = fence;
    }

    // ========================================================================
    //  Cursors and state
    // ========================================================================

    /// Registered cursors.
    #[must_use]
    pub const fn cursors(&self) -> &CursorRegistry {
        &self.cursors
    }

    pub(crate) const fn cursors_mut(&mut self) -> &mut CursorRegistry {
        &mut self.cursors
    }

    /// Changed since the last full image, or never logged.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.full_image.is_none() || self.slots_removed || self.slots.iter().any(Slot::is_dirty)
    }

    /// Whether the leaf could be reduced to a delta of its dirty slots.
    /// Lock checks on the omitted slots are left to the caller.
    #[must_use]
    pub fn delta_representable(&self, max_dirty_percent: u8) -> bool {
        if self.residency != Residency::Full || self.full_image.is_none() || self.slots_removed {
            return false;
        }
        let dirty = self.dirty_slot_count();
        dirty > 0 && dirty * 100 <= self.slots.len() * usize::from(max_dirty_percent)
    }

    /// Removed from the tree; any holder must re-navigate.
    #[must_use]
    pub const fn is_pruned(&self) -> bool {
        self.pruned
    }

    pub(crate) const fn mark_pruned(&mut self) {
        self.pruned = true;
    }

    /// Residency state.
    #[must_use]
    pub const fn residency(&self) -> Residency {
        self.residency
    }

    /// Last logged full image.
    #[must_use]
    pub const fn full_image(&self) -> Option<&FullImage> {
        self.full_image.as_ref()
    }

    /// Whether the last full image might contain `key`. `true` when there
    /// is no image to consult.
    #[must_use]
    pub fn image_may_contain(&self, key: &[u8]) -> bool {
        self.full_image
            .as_ref()
            .is_none_or(|image| image.filter.may_contain(key))
    }

    // ========================================================================
    //  Split
    // ========================================================================

    /// Move slots `at..` and their cursors into a new right sibling `new_id`.
    ///
    /// Both halves lose their full image: the logged image no longer
    /// matches either key set.
    pub(crate) fn split_upper(&mut self, at: usize, new_id: NodeId) -> Self {
        debug_assert_eq!(self.residency, Residency::Full);
        let upper: Vec<Slot> = self.slots.split_off(at);
        let separator: Box<[u8]> = upper[0].key().into();

        let mut right = Self::with_slots(upper, Some(separator.clone()), self.high_fence.take());
        right.cursors = self.cursors.split_off(at, new_id);

        self.high_fence = Some(separator);
        self.full_image = None;
        right
    }

    // ========================================================================
    //  Residency transitions
    // ========================================================================

    /// Record that the current slots were logged as a full image at `lsn`.
    pub(crate) fn mark_logged(&mut self, lsn: Lsn) {
        debug_assert_eq!(self.residency, Residency::Full);
        let filter = KeyFilter::build(self.slots.iter().map(Slot::key));
        self.full_image = Some(FullImage { lsn, filter });
        for slot in &mut self.slots {
            slot.clear_dirty();
        }
        self.slots_removed = false;
    }

    /// Copies of the slots for a full log image.
    #[must_use]
    pub(crate) fn image_slots(&self) -> Vec<Slot> {
        self.slots.iter().map(Slot::image_copy).collect()
    }

    /// Keep only dirty slots. Requires a full image and no cursors.
    pub(crate) fn enter_delta(&mut self) {
        debug_assert!(self.full_image.is_some());
        debug_assert!(self.cursors.is_empty());
        self.slots.retain(Slot::is_dirty);
        self.residency = Residency::Delta;
    }

    /// Drop every slot. Requires a clean full image and no cursors.
    pub(crate) fn enter_evicted(&mut self) {
        debug_assert!(self.full_image.is_some() && !self.is_dirty());
        debug_assert!(self.cursors.is_empty());
        self.slots.clear();
        self.residency = Residency::Evicted;
    }

    /// Reconstitute from the logged image. Cursors on delta slots are
    /// remapped to their merged positions.
    pub(crate) fn restore_full(&mut self, image: Vec<Slot>) {
        match self.residency {
            Residency::Full => {}
            Residency::Evicted => {
                self.slots = image;
                self.residency = Residency::Full;
            }
            Residency::Delta => {
                let delta = std::mem::take(&mut self.slots);
                let (merged, map) = merge_delta(image, delta);
                self.slots = merged;
                self.cursors.remap(|idx| map[idx]);
                self.residency = Residency::Full;
            }
        }
    }
}

// ============================================================================
//  LeafNode
// ============================================================================

/// A leaf: id, pin count, and the latched body.
pub struct LeafNode {
    id: NodeId,
    pins: AtomicU32,
    latch: Latch<LeafBody>,
}

impl StdFmt::Debug for LeafNode {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("LeafNode")
            .field("id", &self.id)
            .field("pins", &self.pin_count())
            .field("latch", &self.latch)
            .finish()
    }
}

impl LeafNode {
    /// Wrap a body.
    #[must_use]
    pub fn new(id: NodeId, body: LeafBody) -> Self {
        Self {
            id,
            pins: AtomicU32::new(0),
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
    pub const fn latch(&self) -> &Latch<LeafBody> {
        &self.latch
    }

    /// Current pin count.
    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    /// Pin until the returned guard drops.
    #[must_use = "dropping the pin releases it immediately"]
    pub fn pin(self: &Arc<Self>) -> LeafPin {
        self.pins.fetch_add(1, Ordering::AcqRel);
        LeafPin {
            node: Arc::clone(self),
        }
    }
}

/// Keeps a leaf from being pruned or evicted.
#[derive(Debug)]
pub struct LeafPin {
    node: Arc<LeafNode>,
}

impl LeafPin {
    /// The pinned leaf.
    #[must_use]
    pub const fn node(&self) -> &Arc<LeafNode> {
        &self.node
    }
}

impl Drop for LeafPin {
    fn drop(&mut self) {
        self.node.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Latched leaf body.
pub type LeafGuard = LatchGuard<LeafBody>;
