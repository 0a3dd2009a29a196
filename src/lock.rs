//! Record lock table keyed by record locator.
//!
//! Locks are identified by the [`Lsn`] of the version they protect, not by a
//! stable record id. Every write produces a new locator, so a writer ends up
//! holding locks on both the version it replaced and the version it created,
//! and waiters must re-validate the slot's locator after they wake up (see
//! `cursor::lock_record`).
//!
//! # Structure
//! - Entries are sharded by locator. Each shard has its own mutex and a
//!   condition variable that release/demote broadcast on.
//! - A second, locker-sharded index records which locators each locker owns,
//!   so commit/abort can release everything without the locker keeping its
//!   own list (migration may grant a locker locks it never asked for).
//!
//! # Fairness
//! A new request is denied while earlier waiters queue on the same locator,
//! unless the requester already owns it (re-entry and promotion). Waiters are
//! granted in FIFO order; consecutive shared waiters are granted together.
//!
//! # Mutex Ordering
//! shard mutex, then owned-index mutex. The owned index is never held while
//! a shard mutex is acquired.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cancel::CancellationToken;
use crate::error::{Result, StoreError};
use crate::locker::UndoDescriptor;
use crate::lsn::Lsn;
use crate::tracing_helpers::{debug_log, trace_log};

/// Number of entry shards. Power of two.
const LOCK_SHARDS: usize = 64;

/// Number of owned-index shards. Power of two.
const OWNER_SHARDS: usize = 16;

/// Upper bound on one condition-variable wait, so cancellation is noticed
/// promptly even without a release broadcast.
const WAIT_SLICE: Duration = Duration::from_millis(10);

// ============================================================================
//  Lock vocabulary
// ============================================================================

/// Identity of a lock owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockerId(u64);

impl LockerId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl StdFmt::Display for LockerId {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Mode in which a lock is held.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    /// Shared.
    Read,
    /// Exclusive.
    Write,
}

impl LockMode {
    /// Whether two holders in these modes can coexist.
    #[must_use]
    pub const fn is_compatible(self, other: Self) -> bool {
        matches!((self, other), (Self::Read, Self::Read))
    }

    /// Whether holding `self` satisfies a request for `requested`.
    #[must_use]
    pub const fn covers(self, requested: Self) -> bool {
        matches!((self, requested), (Self::Write, _) | (Self::Read, Self::Read))
    }
}

/// Kind of lock an operation asks for on a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Dirty read: no lock.
    None,
    /// Shared lock.
    Read,
    /// Exclusive lock.
    Write,
}

impl LockType {
    /// The lock mode to request, if any.
    #[must_use]
    pub const fn mode(self) -> Option<LockMode> {
        match self {
            Self::None => None,
            Self::Read => Some(LockMode::Read),
            Self::Write => Some(LockMode::Write),
        }
    }
}

/// How a successful request was satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockGrant {
    /// A new ownership was recorded; revert by releasing.
    New,
    /// A shared ownership was upgraded to exclusive; revert by demoting.
    Promoted,
    /// The locker already held a covering lock; nothing to revert.
    Existing,
}

/// Outcome of a non-blocking request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockAttempt {
    /// Granted.
    Granted(LockGrant),
    /// Conflicts with an owner or an earlier waiter.
    Denied,
}

// ============================================================================
//  Entries
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct Owner {
    locker: LockerId,
    mode: LockMode,
}

#[derive(Clone, Copy, Debug)]
struct Waiter {
    locker: LockerId,
    mode: LockMode,
    ticket: u64,
}

#[derive(Debug, Default)]
struct LockEntry {
    owners: Vec<Owner>,
    waiters: VecDeque<Waiter>,
    /// Abort descriptor published by the exclusive owner, read by
    /// optimistic read-committed readers.
    undo: Option<(LockerId, Arc<UndoDescriptor>)>,
}

impl LockEntry {
    fn owner_mode(&self, locker: LockerId) -> Option<LockMode> {
        self.owners
            .iter()
            .find(|o| o.locker == locker)
            .map(|o| o.mode)
    }

    fn conflicts(&self, locker: LockerId, mode: LockMode) -> bool {
        self.owners
            .iter()
            .any(|o| o.locker != locker && !o.mode.is_compatible(mode))
    }

    fn is_idle(&self) -> bool {
        self.owners.is_empty() && self.waiters.is_empty()
    }

    /// Record ownership. Caller checked there is no conflict.
    fn grant(&mut self, locker: LockerId, mode: LockMode) -> LockGrant {
        if let Some(owner) = self.owners.iter_mut().find(|o| o.locker == locker) {
            if owner.mode.covers(mode) {
                return LockGrant::Existing;
            }
            owner.mode = mode;
            return LockGrant::Promoted;
        }
        self.owners.push(Owner { locker, mode });
        LockGrant::New
    }

    /// Whether the waiter holding `ticket` may be granted now.
    fn waiter_grantable(&self, ticket: u64, locker: LockerId, mode: LockMode) -> bool {
        if self.conflicts(locker, mode) {
            return false;
        }
        for waiter in &self.waiters {
            if waiter.ticket == ticket {
                return true;
            }
            if !waiter.mode.is_compatible(mode) {
                return false;
            }
        }
        false
    }

    fn remove_waiter(&mut self, ticket: u64) {
        self.waiters.retain(|w| w.ticket != ticket);
    }

    fn remove_owner(&mut self, locker: LockerId) -> bool {
        let before = self.owners.len();
        self.owners.retain(|o| o.locker != locker);
        if self.undo.as_ref().is_some_and(|(owner, _)| *owner == locker) {
            self.undo = None;
        }
        before != self.owners.len()
    }
}

struct LockShard {
    entries: Mutex<HashMap<Lsn, LockEntry>>,
    released: Condvar,
}

impl LockShard {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }
}

// ============================================================================
//  Statistics
// ============================================================================

/// Lock table counters.
#[derive(Debug, Default)]
pub struct LockStats {
    requests: AtomicU64,
    waits: AtomicU64,
    timeouts: AtomicU64,
    interrupts: AtomicU64,
    pub(crate) elisions: AtomicU64,
    pub(crate) relock_retries: AtomicU64,
    pub(crate) optimistic_reads: AtomicU64,
}

/// Point-in-time copy of [`LockStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStatsSnapshot {
    /// Lock requests (blocking and non-blocking).
    pub requests: u64,
    /// Requests that had to wait.
    pub waits: u64,
    /// Waits that timed out.
    pub timeouts: u64,
    /// Waits that were interrupted.
    pub interrupts: u64,
    /// Write locks skipped because the locator was uncontended.
    pub elisions: u64,
    /// Lock attempts repeated because the locator changed during a wait.
    pub relock_retries: u64,
    /// Reads satisfied from a blocked writer's abort version.
    pub optimistic_reads: u64,
}

impl LockStats {
    fn snapshot(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            elisions: self.elisions.load(Ordering::Relaxed),
            relock_retries: self.relock_retries.load(Ordering::Relaxed),
            optimistic_reads: self.optimistic_reads.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
//  LockTable
// ============================================================================

/// Environment-wide record lock table.
pub struct LockTable {
    shards: Box<[LockShard]>,
    owned: Box<[Mutex<HashMap<LockerId, HashSet<Lsn>>>]>,
    next_ticket: AtomicU64,
    stats: LockStats,
}

impl StdFmt::Debug for LockTable {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("LockTable")
            .field("locked", &self.locked_count())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..LOCK_SHARDS).map(|_| LockShard::new()).collect(),
            owned: (0..OWNER_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            next_ticket: AtomicU64::new(1),
            stats: LockStats::default(),
        }
    }

    #[inline]
    fn shard(&self, lsn: Lsn) -> &LockShard {
        let hash: u64 = lsn.as_raw().wrapping_mul(0x9e37_79b9_7f4a_7c15);
        #[expect(clippy::cast_possible_truncation, reason = "masked to shard count")]
        let idx: usize = (hash >> 32) as usize & (LOCK_SHARDS - 1);
        &self.shards[idx]
    }

    #[inline]
    fn owned_shard(&self, locker: LockerId) -> &Mutex<HashMap<LockerId, HashSet<Lsn>>> {
        #[expect(clippy::cast_possible_truncation, reason = "masked to shard count")]
        let idx: usize = locker.as_raw() as usize & (OWNER_SHARDS - 1);
        &self.owned[idx]
    }

    fn note_owned(&self, locker: LockerId, lsn: Lsn) {
        self.owned_shard(locker)
            .lock()
            .entry(locker)
            .or_default()
            .insert(lsn);
    }

    fn forget_owned(&self, locker: LockerId, lsn: Lsn) {
        let mut owned = self.owned_shard(locker).lock();
        if let Some(set) = owned.get_mut(&locker) {
            set.remove(&lsn);
            if set.is_empty() {
                owned.remove(&locker);
            }
        }
    }

    pub(crate) const fn stats_ref(&self) -> &LockStats {
        &self.stats
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> LockStatsSnapshot {
        self.stats.snapshot()
    }

    // ========================================================================
    //  Acquisition
    // ========================================================================

    /// Request a lock without waiting.
    pub fn try_lock(&self, lsn: Lsn, locker: LockerId, mode: LockMode) -> LockAttempt {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let shard: &LockShard = self.shard(lsn);
        let mut entries: MutexGuard<'_, HashMap<Lsn, LockEntry>> = shard.entries.lock();
        self.try_grant_locked(&mut entries, lsn, locker, mode)
    }

    fn try_grant_locked(
        &self,
        entries: &mut HashMap<Lsn, LockEntry>,
        lsn: Lsn,
        locker: LockerId,
        mode: LockMode,
    ) -> LockAttempt {
        let entry: &mut LockEntry = entries.entry(lsn).or_default();
        let already_owner: bool = entry.owner_mode(locker).is_some();

        if entry.conflicts(locker, mode) || (!already_owner && !entry.waiters.is_empty()) {
            if entry.is_idle() {
                entries.remove(&lsn);
            }
            return LockAttempt::Denied;
        }

        let grant: LockGrant = entry.grant(locker, mode);
        if grant == LockGrant::New {
            self.note_owned(locker, lsn);
        }
        LockAttempt::Granted(grant)
    }

    /// Request a lock, waiting up to `timeout`.
    ///
    /// A zero timeout means no-wait: a conflict fails immediately.
    ///
    /// # Errors
    /// - [`StoreError::LockConflict`] on conflict with a zero timeout
    /// - [`StoreError::LockTimeout`] when the wait expires
    /// - [`StoreError::Interrupted`] when `cancel` fires during the wait
    pub fn lock(
        &self,
        lsn: Lsn,
        locker: LockerId,
        mode: LockMode,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockGrant> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let shard: &LockShard = self.shard(lsn);
        let mut entries: MutexGuard<'_, HashMap<Lsn, LockEntry>> = shard.entries.lock();

        if let LockAttempt::Granted(grant) = self.try_grant_locked(&mut entries, lsn, locker, mode)
        {
            return Ok(grant);
        }

        if timeout.is_zero() {
            return Err(StoreError::LockConflict { locator: lsn });
        }

        let ticket: u64 = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        entries
            .entry(lsn)
            .or_default()
            .waiters
            .push_back(Waiter {
                locker,
                mode,
                ticket,
            });
        self.stats.waits.fetch_add(1, Ordering::Relaxed);
        debug_log!(%lsn, %locker, ?mode, "waiting for record lock");

        let deadline: Instant = Instant::now() + timeout;
        loop {
            let now: Instant = Instant::now();
            if now >= deadline {
                Self::abandon_wait(&mut entries, lsn, ticket);
                shard.released.notify_all();
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::LockTimeout {
                    locator: lsn,
                    timeout,
                });
            }

            let _ = shard
                .released
                .wait_for(&mut entries, (deadline - now).min(WAIT_SLICE));

            if cancel.is_cancelled() {
                Self::abandon_wait(&mut entries, lsn, ticket);
                shard.released.notify_all();
                self.stats.interrupts.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::Interrupted);
            }

            let Some(entry) = entries.get_mut(&lsn) else {
                return Err(StoreError::unexpected(format!(
                    "lock entry for {lsn} vanished while {locker} was waiting"
                )));
            };

            if entry.waiter_grantable(ticket, locker, mode) {
                entry.remove_waiter(ticket);
                let grant: LockGrant = entry.grant(locker, mode);
                if grant == LockGrant::New {
                    self.note_owned(locker, lsn);
                }
                // Shared waiters queued behind us may now proceed too.
                shard.released.notify_all();
                trace_log!(%lsn, %locker, ?grant, "record lock granted after wait");
                return Ok(grant);
            }
        }
    }

    fn abandon_wait(entries: &mut HashMap<Lsn, LockEntry>, lsn: Lsn, ticket: u64) {
        if let Some(entry) = entries.get_mut(&lsn) {
            entry.remove_waiter(ticket);
            if entry.is_idle() {
                entries.remove(&lsn);
            }
        }
    }

    // ========================================================================
    //  Release / demotion
    // ========================================================================

    /// Release `locker`'s lock on `lsn`. Returns whether it was held.
    pub fn release(&self, lsn: Lsn, locker: LockerId) -> bool {
        let shard: &LockShard = self.shard(lsn);
        let removed: bool = {
            let mut entries = shard.entries.lock();
            let Some(entry) = entries.get_mut(&lsn) else {
                return false;
            };
            let removed = entry.remove_owner(locker);
            if entry.is_idle() {
                entries.remove(&lsn);
            }
            removed
        };

        if removed {
            self.forget_owned(locker, lsn);
            shard.released.notify_all();
        }
        removed
    }

    /// Downgrade an exclusive lock to shared. Returns whether it was demoted.
    pub fn demote(&self, lsn: Lsn, locker: LockerId) -> bool {
        let shard: &LockShard = self.shard(lsn);
        let demoted: bool = {
            let mut entries = shard.entries.lock();
            let Some(entry) = entries.get_mut(&lsn) else {
                return false;
            };
            let Some(owner) = entry
                .owners
                .iter_mut()
                .find(|o| o.locker == locker && o.mode == LockMode::Write)
            else {
                return false;
            };
            owner.mode = LockMode::Read;
            if entry.undo.as_ref().is_some_and(|(o, _)| *o == locker) {
                entry.undo = None;
            }
            true
        };

        if demoted {
            shard.released.notify_all();
        }
        demoted
    }

    /// Release every lock `locker` owns. Returns how many were released.
    pub fn release_all(&self, locker: LockerId) -> usize {
        let held: HashSet<Lsn> = self
            .owned_shard(locker)
            .lock()
            .remove(&locker)
            .unwrap_or_default();

        let mut released = 0;
        for lsn in held {
            let shard: &LockShard = self.shard(lsn);
            let mut entries = shard.entries.lock();
            if let Some(entry) = entries.get_mut(&lsn) {
                if entry.remove_owner(locker) {
                    released += 1;
                }
                if entry.is_idle() {
                    entries.remove(&lsn);
                }
            }
            drop(entries);
            shard.released.notify_all();
        }
        released
    }

    // ========================================================================
    //  Inspection
    // ========================================================================

    /// No owner and no waiter exists for `lsn`.
    ///
    /// Only meaningful while the caller holds the latch of the leaf whose
    /// slot carries `lsn`: the latch is what keeps new requesters out.
    #[must_use]
    pub fn is_uncontended(&self, lsn: Lsn) -> bool {
        self.shard(lsn)
            .entries
            .lock()
            .get(&lsn)
            .is_none_or(LockEntry::is_idle)
    }

    /// Some locker owns `lsn`.
    #[must_use]
    pub fn is_locked(&self, lsn: Lsn) -> bool {
        self.shard(lsn)
            .entries
            .lock()
            .get(&lsn)
            .is_some_and(|e| !e.owners.is_empty())
    }

    /// Mode in which `locker` owns `lsn`.
    #[must_use]
    pub fn owner_mode(&self, lsn: Lsn, locker: LockerId) -> Option<LockMode> {
        self.shard(lsn)
            .entries
            .lock()
            .get(&lsn)
            .and_then(|e| e.owner_mode(locker))
    }

    /// Every owner of `lsn` with its mode.
    #[must_use]
    pub fn owners_of(&self, lsn: Lsn) -> Vec<(LockerId, LockMode)> {
        self.shard(lsn)
            .entries
            .lock()
            .get(&lsn)
            .map(|e| e.owners.iter().map(|o| (o.locker, o.mode)).collect())
            .unwrap_or_default()
    }

    /// Number of locators with at least one owner.
    #[must_use]
    pub fn locked_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.entries.lock().values().filter(|e| !e.owners.is_empty()).count())
            .sum()
    }

    // ========================================================================
    //  Abort descriptors
    // ========================================================================

    /// Publish the abort descriptor of `locker`'s exclusive lock on `lsn`.
    pub fn publish_undo(&self, lsn: Lsn, locker: LockerId, undo: Arc<UndoDescriptor>) {
        let mut entries = self.shard(lsn).entries.lock();
        if let Some(entry) = entries.get_mut(&lsn)
            && entry.owner_mode(locker) == Some(LockMode::Write)
        {
            entry.undo = Some((locker, undo));
        }
    }

    /// Abort descriptor of the current exclusive owner of `lsn`, if published.
    #[must_use]
    pub fn writer_undo(&self, lsn: Lsn) -> Option<Arc<UndoDescriptor>> {
        self.shard(lsn)
            .entries
            .lock()
            .get(&lsn)
            .and_then(|e| e.undo.as_ref().map(|(_, undo)| Arc::clone(undo)))
    }

    // ========================================================================
    //  Migration
    // ========================================================================

    /// Grant every `(locker, mode)` in `owners` on `new_lsn` and carry the
    /// published abort descriptor over from `old_lsn`.
    ///
    /// `new_lsn` was just produced under the caller's leaf latch, so nobody
    /// else can know it yet. Releasing the old-locator locks is left to the
    /// caller and must only happen after this returns.
    pub fn grant_migrated(&self, old_lsn: Lsn, new_lsn: Lsn, owners: &[(LockerId, LockMode)]) {
        let undo: Option<(LockerId, Arc<UndoDescriptor>)> = self
            .shard(old_lsn)
            .entries
            .lock()
            .get(&old_lsn)
            .and_then(|e| e.undo.clone());

        {
            let mut entries = self.shard(new_lsn).entries.lock();
            let entry: &mut LockEntry = entries.entry(new_lsn).or_default();
            debug_assert!(entry.is_idle(), "migrated locator {new_lsn} already in use");
            for &(locker, mode) in owners {
                if entry.grant(locker, mode) == LockGrant::New {
                    self.note_owned(locker, new_lsn);
                }
            }
            entry.undo = undo;
            if entry.is_idle() {
                entries.remove(&new_lsn);
            }
        }
    }
}

#[cfg(all(test, not(miri)))]
mod concurrent_tests;

#[cfg(test)]
mod shuttle_tests;
