//! Cache modes and the leaf evictor.
//!
//! Eviction works at two granularities:
//! - value level: drop one slot's cached value (it can be re-read from the
//!   log by locator)
//! - leaf level: reduce a leaf to a delta of its dirty slots, or drop its
//!   slots entirely after logging a full image
//!
//! Cursors request either through their [`CacheMode`]. Independently, when
//! the [`MemoryBudget`] reports memory pressure, cursor operations run a
//! bounded "critical" pass inline that evicts from the cold end of an LRU
//! order. Critical eviction only ever `try_latch`es, so it can run while the
//! caller holds no latch without risking a wait.

use std::collections::{BTreeMap, HashMap};
use std::fmt as StdFmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::leaf::{LeafBody, LeafNode, Residency};
use crate::lock::LockTable;
use crate::log::LogWriter;
use crate::tracing_helpers::{debug_log, warn_log};

/// How an operation should treat the cache afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMode {
    /// Keep what was touched; mark the leaf recently used.
    #[default]
    Default,
    /// Evict the value of the record just read or written.
    EvictValue,
    /// Evict the value, and evict the leaf when the cursor moves off it.
    EvictLeaf,
    /// Leave LRU position alone, and skip critical eviction when nothing was
    /// dirtied.
    Unchanged,
    /// Move the leaf to the cold end of the LRU list.
    MakeCold,
}

impl CacheMode {
    /// Whether the value of the current record should be dropped after use.
    #[must_use]
    pub const fn evicts_value(self) -> bool {
        matches!(self, Self::EvictValue | Self::EvictLeaf)
    }
}

// ============================================================================
//  Memory budget
// ============================================================================

/// Source of the memory-pressure signal.
pub trait MemoryBudget: Send + Sync + StdFmt::Debug {
    /// Record a change in cached bytes.
    fn charge(&self, delta: isize);

    /// Currently charged bytes.
    fn usage(&self) -> u64;

    /// Whether critical eviction should run.
    fn is_over_budget(&self) -> bool;
}

/// Fixed-limit byte budget.
#[derive(Debug)]
pub struct CacheBudget {
    limit: u64,
    used: AtomicI64,
}

impl CacheBudget {
    /// Budget of `limit` bytes.
    #[must_use]
    pub const fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicI64::new(0),
        }
    }
}

impl MemoryBudget for CacheBudget {
    fn charge(&self, delta: isize) {
        if delta != 0 {
            self.used.fetch_add(delta as i64, Ordering::Relaxed);
        }
    }

    fn usage(&self) -> u64 {
        u64::try_from(self.used.load(Ordering::Relaxed)).unwrap_or(0)
    }

    fn is_over_budget(&self) -> bool {
        self.usage() > self.limit
    }
}

// ============================================================================
//  LRU order
// ============================================================================

/// Leaves ordered by last use, coldest first.
///
/// Entries are keyed by the leaf's allocation address, which is unique
/// across every tree in the environment. The stored [`Weak`] keeps that
/// address from being reused while the entry exists.
#[derive(Debug, Default)]
struct Lru {
    generations: HashMap<usize, i64>,
    order: BTreeMap<i64, Weak<LeafNode>>,
    /// Last generation handed to a hot touch. Grows upward.
    hot: i64,
    /// Last generation handed to a cold touch. Grows downward.
    cold: i64,
}

impl Lru {
    fn addr(leaf: &Arc<LeafNode>) -> usize {
        Arc::as_ptr(leaf) as usize
    }

    fn contains(&self, leaf: &Arc<LeafNode>) -> bool {
        self.generations.contains_key(&Self::addr(leaf))
    }

    /// Move `leaf` to the hot end, or the cold end if `cold`.
    fn touch(&mut self, leaf: &Arc<LeafNode>, cold: bool) {
        let generation = if cold {
            self.cold -= 1;
            self.cold
        } else {
            self.hot += 1;
            self.hot
        };
        if let Some(previous) = self.generations.insert(Self::addr(leaf), generation) {
            self.order.remove(&previous);
        }
        self.order.insert(generation, Arc::downgrade(leaf));
    }

    /// Remove and return the coldest entry.
    fn pop_coldest(&mut self) -> Option<(i64, Weak<LeafNode>)> {
        let (generation, weak) = self.order.pop_first()?;
        self.generations.remove(&(weak.as_ptr() as usize));
        Some((generation, weak))
    }

    /// Put back an entry taken by [`Lru::pop_coldest`], unless the leaf was
    /// touched again in the meantime.
    fn restore(&mut self, generation: i64, weak: Weak<LeafNode>) {
        let addr = weak.as_ptr() as usize;
        if self.generations.contains_key(&addr) || weak.strong_count() == 0 {
            return;
        }
        self.generations.insert(addr, generation);
        self.order.insert(generation, weak);
    }

    fn coldest_live(&self) -> Option<&Weak<LeafNode>> {
        self.order.values().find(|w| w.strong_count() > 0)
    }

    fn len(&self) -> usize {
        debug_assert_eq!(self.order.len(), self.generations.len());
        self.order.len()
    }
}

// ============================================================================
//  Evictor
// ============================================================================

/// Result of a leaf-level eviction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// Cursors, pins or pruning kept the leaf as it was.
    Skipped,
    /// Cached values dropped; the leaf is (still) a delta.
    Delta,
    /// All slots dropped.
    Evicted,
}

/// Eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictorStats {
    /// Values dropped individually.
    pub values_evicted: u64,
    /// Leaves reduced to deltas.
    pub deltas: u64,
    /// Leaves fully evicted.
    pub leaves_evicted: u64,
    /// Leaf evictions skipped.
    pub skipped: u64,
    /// Critical passes run.
    pub critical_passes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    values_evicted: AtomicU64,
    deltas: AtomicU64,
    leaves_evicted: AtomicU64,
    skipped: AtomicU64,
    critical_passes: AtomicU64,
}

/// Environment-wide evictor.
pub struct Evictor {
    budget: Arc<dyn MemoryBudget>,
    log: Arc<dyn LogWriter>,
    locks: Arc<LockTable>,
    batch: usize,
    max_dirty_percent: u8,
    lru: Mutex<Lru>,
    counters: Counters,
}

impl StdFmt::Debug for Evictor {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Evictor")
            .field("budget", &self.budget)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Evictor {
    /// Evictor over `budget`, logging images to `log`.
    #[must_use]
    pub fn new(
        budget: Arc<dyn MemoryBudget>,
        log: Arc<dyn LogWriter>,
        locks: Arc<LockTable>,
        batch: usize,
        max_dirty_percent: u8,
    ) -> Self {
        Self {
            budget,
            log,
            locks,
            batch: batch.max(1),
            max_dirty_percent,
            lru: Mutex::new(Lru::default()),
            counters: Counters::default(),
        }
    }

    /// The memory budget.
    #[must_use]
    pub const fn budget(&self) -> &Arc<dyn MemoryBudget> {
        &self.budget
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> EvictorStats {
        let c = &self.counters;
        EvictorStats {
            values_evicted: c.values_evicted.load(Ordering::Relaxed),
            deltas: c.deltas.load(Ordering::Relaxed),
            leaves_evicted: c.leaves_evicted.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            critical_passes: c.critical_passes.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    //  LRU
    // ========================================================================

    /// Record a use of `leaf` under `mode`.
    pub fn note_access(&self, leaf: &Arc<LeafNode>, mode: CacheMode) {
        let mut lru = self.lru.lock();
        match mode {
            CacheMode::Unchanged if lru.contains(leaf) => {}
            CacheMode::MakeCold => lru.touch(leaf, true),
            _ => lru.touch(leaf, false),
        }
    }

    /// Whether `leaf` is at the cold end.
    #[must_use]
    pub fn is_coldest(&self, leaf: &Arc<LeafNode>) -> bool {
        self.lru
            .lock()
            .coldest_live()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(leaf)))
    }

    // ========================================================================
    //  Eviction
    // ========================================================================

    /// Drop the cached value of slot `idx`. Returns the bytes freed.
    pub fn evict_value(&self, body: &mut LeafBody, idx: usize) -> usize {
        let freed = body.slot_mut(idx).evict_cached();
        if freed > 0 {
            self.budget.charge(-(freed as isize));
            self.counters.values_evicted.fetch_add(1, Ordering::Relaxed);
        }
        freed
    }

    /// Evict as much of a latched leaf as its state allows.
    ///
    /// # Errors
    /// Propagates failures to log the leaf's full image.
    pub fn evict_leaf(&self, node: &LeafNode, body: &mut LeafBody) -> Result<EvictOutcome> {
        if body.is_pruned() || !body.cursors().is_empty() || node.pin_count() > 0 {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(EvictOutcome::Skipped);
        }

        let freed: usize = (0..body.len())
            .map(|idx| body.slot_mut(idx).evict_cached())
            .sum();
        self.budget.charge(-(freed as isize));

        match body.residency() {
            Residency::Evicted => return Ok(EvictOutcome::Evicted),
            Residency::Delta => return Ok(EvictOutcome::Delta),
            Residency::Full => {}
        }

        if body.is_dirty() {
            if body.delta_representable(self.max_dirty_percent) && self.omitted_slots_unlocked(body)
            {
                body.enter_delta();
                self.counters.deltas.fetch_add(1, Ordering::Relaxed);
                debug_log!(leaf = %node.id(), slots = body.len(), "leaf reduced to delta");
                return Ok(EvictOutcome::Delta);
            }
            let lsn = self.log.write_leaf_image(body.image_slots())?;
            body.mark_logged(lsn);
        }

        body.enter_evicted();
        self.counters.leaves_evicted.fetch_add(1, Ordering::Relaxed);
        debug_log!(leaf = %node.id(), freed, "leaf evicted");
        Ok(EvictOutcome::Evicted)
    }

    /// A delta omits clean slots; none of them may be locked, or a blind
    /// write on the delta could bypass the lock.
    fn omitted_slots_unlocked(&self, body: &LeafBody) -> bool {
        body.slots()
            .iter()
            .filter(|s| !s.is_dirty() && !s.lsn().is_null())
            .all(|s| !self.locks.is_locked(s.lsn()))
    }

    /// Evict from the cold end until the budget recovers or one batch has
    /// been examined. Returns the number of leaves evicted or reduced.
    ///
    /// The caller must not hold any latch it could need released for
    /// progress; leaves are only ever `try_latch`ed here.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn trigger_critical(&self) -> usize {
        if !self.budget.is_over_budget() {
            return 0;
        }
        self.counters.critical_passes.fetch_add(1, Ordering::Relaxed);

        let candidates: Vec<(i64, Weak<LeafNode>)> = {
            let mut lru = self.lru.lock();
            std::iter::from_fn(|| lru.pop_coldest())
                .take(self.batch)
                .collect()
        };

        let mut reclaimed = 0;
        let mut requeue: Vec<Arc<LeafNode>> = Vec::new();
        let mut candidates = candidates.into_iter();
        for (_, weak) in candidates.by_ref() {
            let Some(node) = weak.upgrade() else {
                continue;
            };
            let Some(mut body) = node.latch().try_latch() else {
                requeue.push(node);
                continue;
            };
            match self.evict_leaf(&node, &mut body) {
                Ok(EvictOutcome::Evicted) => reclaimed += 1,
                Ok(EvictOutcome::Delta) => {
                    reclaimed += 1;
                    drop(body);
                    requeue.push(node);
                }
                Ok(EvictOutcome::Skipped) => {
                    drop(body);
                    requeue.push(node);
                }
                Err(err) => {
                    warn_log!(leaf = %node.id(), error = %err, "critical eviction failed");
                    drop(body);
                    requeue.push(node);
                }
            }
            if !self.budget.is_over_budget() {
                break;
            }
        }

        let unvisited: Vec<(i64, Weak<LeafNode>)> = candidates.collect();
        if !requeue.is_empty() || !unvisited.is_empty() {
            let mut lru = self.lru.lock();
            for (generation, weak) in unvisited {
                lru.restore(generation, weak);
            }
            for node in &requeue {
                lru.touch(node, false);
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::NodeId;
    use crate::lock::{LockMode, LockerId};
    use crate::log::MemLog;
    use crate::lsn::Lsn;
    use crate::slot::Slot;

    fn evictor(limit: u64) -> (Evictor, Arc<LockTable>) {
        let locks = Arc::new(LockTable::new());
        let evictor = Evictor::new(
            Arc::new(CacheBudget::new(limit)),
            Arc::new(MemLog::new()),
            Arc::clone(&locks),
            4,
            50,
        );
        (evictor, locks)
    }

    fn leaf(keys: &[&[u8]], value_len: usize) -> Arc<LeafNode> {
        let node = Arc::new(LeafNode::new(NodeId::from_raw(0), LeafBody::empty_root()));
        {
            let mut body = node.latch().latch();
            for (i, key) in keys.iter().enumerate() {
                let mut slot = Slot::new(key);
                let _ = slot.install_version(
                    Lsn::from_raw(i as u64 + 1),
                    Some(vec![7_u8; value_len].into()),
                    4,
                    0,
                    0,
                );
                let idx = body.search(key).unwrap_err();
                body.insert_slot(idx, slot);
            }
        }
        node
    }

    #[test]
    fn test_dirty_leaf_is_logged_then_evicted() {
        let (evictor, _) = evictor(u64::MAX);
        let node = leaf(&[b"a", b"b"], 32);
        let mut body = node.latch().latch();

        assert_eq!(evictor.evict_leaf(&node, &mut body).unwrap(), EvictOutcome::Evicted);
        assert_eq!(body.residency(), Residency::Evicted);
        assert!(body.full_image().is_some());
    }

    #[test]
    fn test_few_dirty_slots_become_delta() {
        let (evictor, _) = evictor(u64::MAX);
        let node = leaf(&[b"a", b"b", b"c", b"d"], 8);
        let mut body = node.latch().latch();
        assert_eq!(evictor.evict_leaf(&node, &mut body).unwrap(), EvictOutcome::Evicted);

        let image = evictor.log.read_leaf_image(body.full_image().unwrap().lsn()).unwrap();
        body.restore_full(image);
        body.slot_mut(0).set_lsn(Lsn::from_raw(50));

        assert_eq!(evictor.evict_leaf(&node, &mut body).unwrap(), EvictOutcome::Delta);
        assert_eq!(body.residency(), Residency::Delta);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn test_delta_refused_when_omitted_slot_locked() {
        let (evictor, locks) = evictor(u64::MAX);
        let node = leaf(&[b"a", b"b", b"c", b"d"], 8);
        let mut body = node.latch().latch();
        let _ = evictor.evict_leaf(&node, &mut body).unwrap();
        let image = evictor.log.read_leaf_image(body.full_image().unwrap().lsn()).unwrap();
        body.restore_full(image);
        body.slot_mut(0).set_lsn(Lsn::from_raw(50));

        let _ = locks.try_lock(body.slot(2).lsn(), LockerId::from_raw(9), LockMode::Read);
        assert_eq!(evictor.evict_leaf(&node, &mut body).unwrap(), EvictOutcome::Evicted);
    }

    #[test]
    fn test_cursor_or_pin_blocks_leaf_eviction() {
        let (evictor, _) = evictor(u64::MAX);
        let node = leaf(&[b"a"], 8);
        let pin = node.pin();
        let mut body = node.latch().latch();
        assert_eq!(evictor.evict_leaf(&node, &mut body).unwrap(), EvictOutcome::Skipped);
        drop(body);
        drop(pin);
    }

    #[test]
    fn test_critical_pass_evicts_cold_leaves() {
        let (evictor, _) = evictor(10);
        let hot = leaf(&[b"a"], 64);
        let cold = leaf(&[b"b"], 64);
        evictor.budget().charge(128);
        evictor.note_access(&hot, CacheMode::Default);
        evictor.note_access(&cold, CacheMode::MakeCold);
        assert!(evictor.is_coldest(&cold));

        assert!(evictor.trigger_critical() >= 1);
        assert_eq!(cold.latch().latch().residency(), Residency::Evicted);
        assert_eq!(evictor.stats().critical_passes, 1);
    }

    #[test]
    fn test_lru_orders_by_last_touch() {
        let (evictor, _) = evictor(u64::MAX);
        let a = leaf(&[b"a"], 8);
        let b = leaf(&[b"b"], 8);
        let c = leaf(&[b"c"], 8);
        for node in [&a, &b, &c] {
            evictor.note_access(node, CacheMode::Default);
        }
        assert!(evictor.is_coldest(&a));

        evictor.note_access(&a, CacheMode::Default);
        assert!(evictor.is_coldest(&b));
        evictor.note_access(&b, CacheMode::Unchanged);
        assert!(evictor.is_coldest(&b));
        evictor.note_access(&c, CacheMode::MakeCold);
        assert!(evictor.is_coldest(&c));

        let mut lru = evictor.lru.lock();
        assert_eq!(lru.len(), 3);
        let popped: Vec<_> = std::iter::from_fn(|| lru.pop_coldest())
            .map(|(_, weak)| weak.as_ptr())
            .collect();
        assert_eq!(popped, [Arc::as_ptr(&c), Arc::as_ptr(&b), Arc::as_ptr(&a)]);
        assert_eq!(lru.len(), 0);
    }

    #[test]
    fn test_lru_skips_dropped_leaves() {
        let (evictor, _) = evictor(u64::MAX);
        let gone = leaf(&[b"a"], 8);
        let kept = leaf(&[b"b"], 8);
        evictor.note_access(&gone, CacheMode::Default);
        evictor.note_access(&kept, CacheMode::Default);
        drop(gone);
        assert!(evictor.is_coldest(&kept));

        // Untracked leaves enter at the hot end even under `Unchanged`.
        let fresh = leaf(&[b"c"], 8);
        evictor.note_access(&fresh, CacheMode::Unchanged);
        assert!(evictor.is_coldest(&kept));
        assert_eq!(evictor.lru.lock().len(), 3);
    }

    #[test]
    fn test_critical_pass_requeues_skipped_leaves() {
        let (evictor, _) = evictor(10);
        let pinned = leaf(&[b"a"], 64);
        let other = leaf(&[b"b"], 64);
        evictor.budget().charge(128);
        evictor.note_access(&pinned, CacheMode::Default);
        evictor.note_access(&other, CacheMode::Default);

        let pin = pinned.pin();
        assert!(evictor.trigger_critical() >= 1);
        assert_eq!(other.latch().latch().residency(), Residency::Evicted);
        assert_eq!(pinned.latch().latch().residency(), Residency::Full);
        assert!(evictor.is_coldest(&pinned));
        drop(pin);
    }

    #[test]
    fn test_under_budget_is_a_no_op() {
        let (evictor, _) = evictor(u64::MAX);
        let node = leaf(&[b"a"], 64);
        evictor.note_access(&node, CacheMode::Default);
        assert_eq!(evictor.trigger_critical(), 0);
        assert_eq!(evictor.stats().critical_passes, 0);
    }

    #[test]
    fn test_evict_value() {
        let (evictor, _) = evictor(u64::MAX);
        let node = leaf(&[b"a"], 64);
        evictor.budget().charge(64);
        let mut body = node.latch().latch();
        assert_eq!(evictor.evict_value(&mut body, 0), 64);
        assert_eq!(evictor.budget().usage(), 0);
    }
}
