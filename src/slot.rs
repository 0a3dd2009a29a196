//! One key-indexed entry of a leaf node.
//!
//! A slot pairs a key with the locator of its current record version and the
//! flags that decide whether that record logically exists. Small values are
//! embedded permanently; larger ones are cached and may be evicted, after
//! which they are fetched back from the log by locator.
//!
//! # Invariants
//! - A logically deleted slot has `KNOWN_DELETED` or `PENDING_DELETED` set.
//! - `PENDING_DELETED` is never set on a logically live slot.
//! - `EMBEDDED` is set iff the slot data is [`SlotData::Embedded`].

use std::sync::Arc;

use bitflags::bitflags;

use crate::lsn::Lsn;

bitflags! {
    /// Per-slot state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SlotFlags: u8 {
        /// The record is deleted and the deletion is committed (or was
        /// never-written); the slot may be compressed away.
        const KNOWN_DELETED = 1 << 0;
        /// Deleted by a write whose locker may still abort.
        const PENDING_DELETED = 1 << 1;
        /// Placeholder deletion inserted into a leaf delta; overrides any
        /// slot for the same key in the full image.
        const TOMBSTONE = 1 << 2;
        /// The value is stored inline in the slot.
        const EMBEDDED = 1 << 3;
        /// Changed since the last full leaf image was logged.
        const DIRTY = 1 << 4;
    }
}

/// Value bytes held by a slot, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SlotData {
    /// Nothing in memory; fetch from the log if needed.
    #[default]
    Absent,
    /// Inline value; never evicted.
    Embedded(Arc<[u8]>),
    /// Cached copy of a logged value; evictable.
    Cached(Arc<[u8]>),
}

impl SlotData {
    /// Bytes if present in memory.
    #[must_use]
    pub fn bytes(&self) -> Option<&Arc<[u8]>> {
        match self {
            Self::Absent => None,
            Self::Embedded(bytes) | Self::Cached(bytes) => Some(bytes),
        }
    }
}

/// A leaf slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    key: Box<[u8]>,
    lsn: Lsn,
    flags: SlotFlags,
    data: SlotData,
    expiration: Option<u64>,
    modified_at: u64,
    last_logged_size: u32,
}

impl Slot {
    /// A fresh slot for `key` whose record does not exist yet.
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: key.into(),
            lsn: Lsn::NULL,
            flags: SlotFlags::DIRTY,
            data: SlotData::Absent,
            expiration: None,
            modified_at: 0,
            last_logged_size: 0,
        }
    }

    /// Placeholder for a blind deletion of `key`.
    #[must_use]
    pub fn tombstone(key: &[u8]) -> Self {
        let mut slot = Self::new(key);
        slot.flags.insert(SlotFlags::TOMBSTONE);
        slot
    }

    // ========================================================================
    //  Accessors
    // ========================================================================

    /// Key bytes.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Locator of the current version.
    #[inline]
    #[must_use]
    pub const fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// Flag bits.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> SlotFlags {
        self.flags
    }

    /// In-memory value bytes.
    #[inline]
    #[must_use]
    pub const fn data(&self) -> &SlotData {
        &self.data
    }

    /// Expiration time in milliseconds since the epoch.
    #[inline]
    #[must_use]
    pub const fn expiration(&self) -> Option<u64> {
        self.expiration
    }

    /// Time of the last modification.
    #[inline]
    #[must_use]
    pub const fn modified_at(&self) -> u64 {
        self.modified_at
    }

    /// Size of the last logged version.
    #[inline]
    #[must_use]
    pub const fn last_logged_size(&self) -> u32 {
        self.last_logged_size
    }

    /// `KNOWN_DELETED` is set.
    #[inline]
    #[must_use]
    pub const fn is_known_deleted(&self) -> bool {
        self.flags.contains(SlotFlags::KNOWN_DELETED)
    }

    /// `PENDING_DELETED` is set.
    #[inline]
    #[must_use]
    pub const fn is_pending_deleted(&self) -> bool {
        self.flags.contains(SlotFlags::PENDING_DELETED)
    }

    /// Either deletion flag is set.
    #[inline]
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.flags
            .intersects(SlotFlags::KNOWN_DELETED.union(SlotFlags::PENDING_DELETED))
    }

    /// Absent by locator or by a deletion flag, ignoring expiration and locks.
    #[inline]
    #[must_use]
    pub const fn is_structurally_defunct(&self) -> bool {
        self.lsn.is_null() || self.is_deleted()
    }

    /// Blind-deletion placeholder.
    #[inline]
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.flags.contains(SlotFlags::TOMBSTONE)
    }

    /// Changed since the last full image.
    #[inline]
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.flags.contains(SlotFlags::DIRTY)
    }

    /// Whether the record has expired at `now`.
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration.is_some_and(|exp| now >= exp)
    }

    /// Bytes of evictable cached value.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        match &self.data {
            SlotData::Cached(bytes) => bytes.len(),
            SlotData::Absent | SlotData::Embedded(_) => 0,
        }
    }

    // ========================================================================
    //  Mutators (callers hold the leaf latch)
    // ========================================================================

    /// Install a freshly logged version. Returns the change in cached bytes.
    pub(crate) fn install_version(
        &mut self,
        lsn: Lsn,
        value: Option<Arc<[u8]>>,
        max_embedded: usize,
        logged_size: u32,
        now: u64,
    ) -> isize {
        self.lsn = lsn;
        self.last_logged_size = logged_size;
        self.modified_at = now;
        self.flags.insert(SlotFlags::DIRTY);
        self.set_data(value, max_embedded)
    }

    /// Replace the in-memory value, embedding it when small enough.
    /// Returns the change in cached bytes.
    pub(crate) fn set_data(&mut self, value: Option<Arc<[u8]>>, max_embedded: usize) -> isize {
        let before = self.cached_bytes();
        self.data = match value {
            Some(bytes) if bytes.len() <= max_embedded => SlotData::Embedded(bytes),
            Some(bytes) => SlotData::Cached(bytes),
            None => SlotData::Absent,
        };
        self.flags
            .set(SlotFlags::EMBEDDED, matches!(self.data, SlotData::Embedded(_)));
        byte_delta(before, self.cached_bytes())
    }

    /// Cache a value fetched from the log. Embedded data is left alone.
    /// Returns the bytes newly cached.
    pub(crate) fn cache_fetched(&mut self, value: Arc<[u8]>) -> usize {
        if matches!(self.data, SlotData::Absent) {
            self.data = SlotData::Cached(value);
            return self.cached_bytes();
        }
        0
    }

    /// Drop a cached value. Returns the bytes freed.
    pub(crate) fn evict_cached(&mut self) -> usize {
        let freed = self.cached_bytes();
        if freed > 0 {
            self.data = SlotData::Absent;
        }
        freed
    }

    pub(crate) fn set_lsn(&mut self, lsn: Lsn) {
        self.lsn = lsn;
        self.flags.insert(SlotFlags::DIRTY);
    }

    pub(crate) const fn set_expiration(&mut self, expiration: Option<u64>) {
        self.expiration = expiration;
    }

    pub(crate) fn mark_known_deleted(&mut self) {
        self.flags.remove(SlotFlags::PENDING_DELETED);
        self.flags.insert(SlotFlags::KNOWN_DELETED | SlotFlags::DIRTY);
    }

    pub(crate) fn mark_pending_deleted(&mut self) {
        self.flags.insert(SlotFlags::PENDING_DELETED | SlotFlags::DIRTY);
    }

    /// Clear both deletion flags and the tombstone marker.
    pub(crate) fn clear_deleted(&mut self) {
        self.flags.remove(
            SlotFlags::KNOWN_DELETED | SlotFlags::PENDING_DELETED | SlotFlags::TOMBSTONE,
        );
        self.flags.insert(SlotFlags::DIRTY);
    }

    /// Overwrite deletion state from an undo descriptor.
    pub(crate) fn restore_flags(&mut self, known_deleted: bool, pending_deleted: bool) {
        self.flags.remove(SlotFlags::KNOWN_DELETED | SlotFlags::PENDING_DELETED);
        self.flags.set(SlotFlags::KNOWN_DELETED, known_deleted);
        self.flags.set(SlotFlags::PENDING_DELETED, pending_deleted);
        self.flags.insert(SlotFlags::DIRTY);
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.flags.remove(SlotFlags::DIRTY);
    }

    /// Turn a delta placeholder into an ordinary deleted slot.
    pub(crate) fn clear_tombstone(&mut self) {
        self.flags.remove(SlotFlags::TOMBSTONE);
    }

    /// Copy suitable for a logged leaf image: cached values are dropped,
    /// embedded ones kept.
    #[must_use]
    pub(crate) fn image_copy(&self) -> Self {
        let mut copy = self.clone();
        if matches!(copy.data, SlotData::Cached(_)) {
            copy.data = SlotData::Absent;
        }
        copy.flags.remove(SlotFlags::DIRTY | SlotFlags::TOMBSTONE);
        copy
    }
}

#[expect(clippy::cast_possible_wrap, reason = "cached values are far below isize::MAX")]
const fn byte_delta(before: usize, after: usize) -> isize {
    after as isize - before as isize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_slot_is_defunct_until_written() {
        let mut slot = Slot::new(b"k");
        assert!(slot.is_structurally_defunct());
        assert!(slot.is_dirty());

        slot.install_version(Lsn::from_raw(1), Some(Arc::from(&b"v"[..])), 8, 10, 0);
        assert!(!slot.is_structurally_defunct());
        assert!(slot.flags().contains(SlotFlags::EMBEDDED));
    }

    #[test]
    fn test_large_values_are_cached_and_evictable() {
        let mut slot = Slot::new(b"k");
        let big: Arc<[u8]> = vec![0_u8; 64].into();
        slot.install_version(Lsn::from_raw(9), Some(big), 16, 70, 0);

        assert!(!slot.flags().contains(SlotFlags::EMBEDDED));
        assert_eq!(slot.cached_bytes(), 64);
        assert_eq!(slot.evict_cached(), 64);
        assert_eq!(slot.data(), &SlotData::Absent);
        assert_eq!(slot.evict_cached(), 0);
    }

    #[test]
    fn test_embedded_values_survive_eviction() {
        let mut slot = Slot::new(b"k");
        slot.install_version(Lsn::from_raw(2), Some(Arc::from(&b"tiny"[..])), 16, 4, 0);
        assert_eq!(slot.evict_cached(), 0);
        assert!(slot.data().bytes().is_some());
    }

    #[test]
    fn test_known_deleted_clears_pending() {
        let mut slot = Slot::new(b"k");
        slot.set_lsn(Lsn::from_raw(3));
        slot.mark_pending_deleted();
        assert!(slot.is_pending_deleted());

        slot.mark_known_deleted();
        assert!(slot.is_known_deleted());
        assert!(!slot.is_pending_deleted());

        slot.clear_deleted();
        assert!(!slot.is_deleted());
    }

    #[test]
    fn test_expiration() {
        let mut slot = Slot::new(b"k");
        assert!(!slot.is_expired(u64::MAX));
        slot.set_expiration(Some(100));
        assert!(!slot.is_expired(99));
        assert!(slot.is_expired(100));
    }

    #[test]
    fn test_tombstone_flags() {
        let slot = Slot::tombstone(b"gone");
        assert!(slot.is_tombstone());
        assert!(slot.is_structurally_defunct());
    }
}
