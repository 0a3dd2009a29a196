//! Locking the record under a cursor.
//!
//! Lock identity is the slot's current locator. A request that cannot be
//! granted immediately unlatches, waits, re-latches and re-reads the
//! locator; if a writer replaced the record in the meantime the lock it
//! waited for protects nothing, so it is reverted and the request starts
//! over on the new locator (retry-on-change).

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::hooks::FaultPoint;
use crate::leaf::registry::CursorPosition;
use crate::lock::{LockAttempt, LockGrant, LockMode, LockType};
use crate::locker::{Isolation, Locker, UndoDescriptor};
use crate::lsn::Lsn;
use crate::slot::Slot;
use crate::tracing_helpers::{debug_log, trace_log};
use crate::tree::{LatchedLeaf, Tree};

use super::{Cursor, ReadMode};

/// What an operation asks of [`Cursor::lock_at`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockRequest {
    pub(crate) lock_type: LockType,
    /// Skip the write lock when nobody holds or waits for the locator.
    pub(crate) elide: bool,
    /// Expose pending deletions to a lock-free read.
    pub(crate) dirty_all: bool,
    /// The caller will read the value.
    pub(crate) want_value: bool,
    /// A blocked read may return the writer's prior version.
    pub(crate) optimistic: bool,
    /// Locks newly taken are released when the cursor moves on.
    pub(crate) release_on_move: bool,
}

/// How a granted lock was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquired {
    /// Write lock skipped on an uncontended locator.
    Elided,
    /// Granted by the lock table.
    Grant(LockGrant),
}

/// Outcome of locking one slot.
#[derive(Debug)]
pub(crate) enum LockStanding {
    /// No lock was requested.
    Unlocked { lsn: Lsn, defunct: bool },
    /// The slot's locator is locked (or the lock was elided).
    Locked {
        lsn: Lsn,
        defunct: bool,
        acquired: Acquired,
    },
    /// Blocked by a writer; its prior version is reported instead.
    PriorVersion {
        undo: Arc<UndoDescriptor>,
        value: Option<Arc<[u8]>>,
    },
}

impl LockStanding {
    /// Locator of the version this standing describes.
    pub(crate) fn lsn(&self) -> Lsn {
        match self {
            Self::Unlocked { lsn, .. } | Self::Locked { lsn, .. } => *lsn,
            Self::PriorVersion { undo, .. } => undo.abort_lsn(),
        }
    }

    pub(crate) const fn is_defunct(&self) -> bool {
        match self {
            Self::Unlocked { defunct, .. } | Self::Locked { defunct, .. } => *defunct,
            Self::PriorVersion { .. } => false,
        }
    }

    /// Undo whatever this standing did to the lock table.
    pub(crate) fn revert(&self, locker: &Locker) {
        if let Self::Locked {
            lsn,
            acquired: Acquired::Grant(grant),
            ..
        } = self
        {
            locker.revert(*lsn, *grant);
        }
    }

    /// The locator, if this standing created a new lock ownership.
    pub(crate) const fn newly_locked(&self) -> Option<Lsn> {
        match self {
            Self::Locked {
                lsn,
                acquired: Acquired::Grant(LockGrant::New),
                ..
            } => Some(*lsn),
            _ => None,
        }
    }
}

/// Where a lock wait left the walker.
enum Relatched {
    /// The locator did not change; the lock is held.
    Held(LatchedLeaf, LockGrant),
    /// The locator changed; the lock was reverted.
    Changed(LatchedLeaf),
}

impl Cursor {
    /// Locks newly taken by a non-transactional cursor are released when it
    /// moves on, unless retained.
    fn releases_non_txn_locks(&self) -> bool {
        !self.locker.is_transactional() && !self.retain_non_txn_locks
    }

    pub(super) fn read_request(&self, mode: ReadMode, want_value: bool) -> LockRequest {
        let lock_type = match mode {
            ReadMode::Rmw => LockType::Write,
            ReadMode::ReadUncommitted | ReadMode::ReadUncommittedAll => LockType::None,
            ReadMode::ReadCommitted => LockType::Read,
            ReadMode::Default => match self.isolation {
                Isolation::ReadUncommitted => LockType::None,
                Isolation::ReadCommitted
                | Isolation::RepeatableRead
                | Isolation::OptimisticReadCommitted => LockType::Read,
            },
        };
        let dirty_all = mode == ReadMode::ReadUncommittedAll
            || (lock_type == LockType::None && self.read_uncommitted_all);
        let optimistic = lock_type == LockType::Read
            && mode == ReadMode::Default
            && self.isolation == Isolation::OptimisticReadCommitted;
        let committed_read = lock_type == LockType::Read
            && (mode == ReadMode::ReadCommitted
                || matches!(
                    self.isolation,
                    Isolation::ReadCommitted | Isolation::OptimisticReadCommitted
                ));
        LockRequest {
            lock_type,
            elide: false,
            dirty_all,
            want_value,
            optimistic,
            release_on_move: self.releases_non_txn_locks() || committed_read,
        }
    }

    pub(super) fn write_request(&self, elide: bool) -> LockRequest {
        LockRequest {
            lock_type: LockType::Write,
            elide,
            dirty_all: false,
            want_value: false,
            optimistic: false,
            release_on_move: self.releases_non_txn_locks(),
        }
    }

    /// Lock the slot under `walker`.
    ///
    /// `leaf` must be the latched leaf the walker is registered on. The
    /// returned leaf is the one it is registered on afterwards, which may
    /// differ if a split moved it during a lock wait. On error the walker
    /// stays registered and no lock is left behind.
    pub(super) fn lock_at(
        &self,
        tree: &Tree,
        mut leaf: LatchedLeaf,
        walker: &Arc<CursorPosition>,
        request: &LockRequest,
    ) -> Result<(LatchedLeaf, LockStanding)> {
        let Some(mode) = request.lock_type.mode() else {
            return self.dirty_standing(tree, leaf, walker, request);
        };
        loop {
            let slot = leaf.slot(walker.index());
            let lsn = slot.lsn();
            if lsn.is_null() {
                return Ok((leaf, LockStanding::Unlocked { lsn, defunct: true }));
            }

            let locks = self.locker.lock_table();
            if mode == LockMode::Write && request.elide && locks.is_uncontended(lsn) {
                locks.stats_ref().elisions.fetch_add(1, Ordering::Relaxed);
                let defunct = self.is_defunct(tree, slot);
                let standing = LockStanding::Locked {
                    lsn,
                    defunct,
                    acquired: Acquired::Elided,
                };
                return Ok((leaf, standing));
            }

            if let LockAttempt::Granted(grant) = self.locker.try_lock(lsn, mode)? {
                let defunct = self.is_defunct(tree, leaf.slot(walker.index()));
                let standing = LockStanding::Locked {
                    lsn,
                    defunct,
                    acquired: Acquired::Grant(grant),
                };
                return Ok((leaf, standing));
            }

            if request.optimistic
                && let Some(standing) = self.prior_version(tree, lsn)
            {
                locks.stats_ref().optimistic_reads.fetch_add(1, Ordering::Relaxed);
                return Ok((leaf, standing));
            }

            match self.wait_for_lock(tree, leaf, walker, lsn, mode)? {
                Relatched::Held(relatched, grant) => {
                    let defunct = self.is_defunct(tree, relatched.slot(walker.index()));
                    let standing = LockStanding::Locked {
                        lsn,
                        defunct,
                        acquired: Acquired::Grant(grant),
                    };
                    return Ok((relatched, standing));
                }
                Relatched::Changed(relatched) => leaf = relatched,
            }
        }
    }

    /// Unlatch, block on `lsn`, relatch and check the locator is unchanged.
    fn wait_for_lock(
        &self,
        tree: &Tree,
        leaf: LatchedLeaf,
        walker: &Arc<CursorPosition>,
        lsn: Lsn,
        mode: LockMode,
    ) -> Result<Relatched> {
        drop(leaf);
        tree.hooks().check(FaultPoint::BeforeBlockingLock)?;
        debug_log!(cursor = %walker.id(), %lsn, ?mode, "waiting for record lock");
        let grant = self.locker.lock(lsn, mode)?;

        let relatched = self.latch_position(tree, walker).and_then(|leaf| {
            tree.hooks().check(FaultPoint::AfterRelatch)?;
            Ok(leaf)
        });
        let leaf = match relatched {
            Ok(leaf) => leaf,
            Err(err) => {
                self.locker.revert(lsn, grant);
                return Err(err);
            }
        };

        let current = leaf.slot(walker.index()).lsn();
        if current != lsn {
            self.locker.revert(lsn, grant);
            self.locker
                .lock_table()
                .stats_ref()
                .relock_retries
                .fetch_add(1, Ordering::Relaxed);
            trace_log!(cursor = %walker.id(), old = %lsn, new = %current, "locator changed during wait");
            return Ok(Relatched::Changed(leaf));
        }
        Ok(Relatched::Held(leaf, grant))
    }

    /// Existence of the slot under a lock-free read.
    fn dirty_standing(
        &self,
        tree: &Tree,
        mut leaf: LatchedLeaf,
        walker: &Arc<CursorPosition>,
        request: &LockRequest,
    ) -> Result<(LatchedLeaf, LockStanding)> {
        loop {
            let slot = leaf.slot(walker.index());
            let lsn = slot.lsn();
            if !request.dirty_all || !slot.is_pending_deleted() || slot.is_known_deleted() {
                let defunct = self.is_defunct(tree, slot);
                return Ok((leaf, LockStanding::Unlocked { lsn, defunct }));
            }

            // A pending deletion is in flight while its writer holds the lock.
            match self.locker.try_lock(lsn, LockMode::Read)? {
                LockAttempt::Granted(grant) => {
                    self.locker.revert(lsn, grant);
                    return Ok((leaf, LockStanding::Unlocked { lsn, defunct: true }));
                }
                LockAttempt::Denied if !request.want_value => {
                    let defunct = self.is_expired_unprotected(tree, slot);
                    return Ok((leaf, LockStanding::Unlocked { lsn, defunct }));
                }
                LockAttempt::Denied => {}
            }

            leaf = match self.wait_for_lock(tree, leaf, walker, lsn, LockMode::Read)? {
                Relatched::Held(relatched, grant) => {
                    self.locker.revert(lsn, grant);
                    relatched
                }
                Relatched::Changed(relatched) => relatched,
            };
        }
    }

    /// The blocking writer's prior version, if it is a live record.
    ///
    /// A prior value that cannot be read back from the log is treated as
    /// unavailable, and the caller waits for the lock instead.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn prior_version(&self, tree: &Tree, lsn: Lsn) -> Option<LockStanding> {
        let undo = self.locker.lock_table().writer_undo(lsn)?;
        if undo.is_abort_defunct() {
            return None;
        }
        let now = tree.context().clock.now_millis();
        if undo.abort_expiration().is_some_and(|exp| now >= exp) {
            return None;
        }
        let value = match undo.abort_data() {
            Some(bytes) => Arc::clone(bytes),
            None => match tree.context().log.read_value(undo.abort_lsn()) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return None,
                Err(err) => {
                    trace_log!(%lsn, prior = %undo.abort_lsn(), error = %err, "prior version unreadable; waiting instead");
                    return None;
                }
            },
        };
        trace_log!(%lsn, prior = %undo.abort_lsn(), "read prior version of blocked record");
        Some(LockStanding::PriorVersion {
            undo,
            value: Some(value),
        })
    }

    /// Whether the record in `slot` does not exist for this cursor's locker.
    ///
    /// A pending deletion counts as defunct here: either the deleter
    /// committed, or it is this locker, or (for a lock-free read) the
    /// caller has already decided not to expose it.
    pub(super) fn is_defunct(&self, tree: &Tree, slot: &Slot) -> bool {
        slot.is_structurally_defunct() || self.is_expired_unprotected(tree, slot)
    }

    /// Expired, and not locked by this locker before it expired (within
    /// the grace window).
    fn is_expired_unprotected(&self, tree: &Tree, slot: &Slot) -> bool {
        let Some(expiration) = slot.expiration() else {
            return false;
        };
        let now = tree.context().clock.now_millis();
        if now < expiration {
            return false;
        }
        let grace = self.db.environment().config().ttl_grace_ms;
        let protected = now < expiration.saturating_add(grace)
            && self.locker.locked_before(slot.lsn(), expiration);
        !protected
    }

    /// Value of slot `idx`, fetching it from the log if it is not cached.
    pub(super) fn fetch_value(
        &self,
        tree: &Tree,
        leaf: &mut LatchedLeaf,
        idx: usize,
    ) -> Result<Option<Arc<[u8]>>> {
        let slot = leaf.slot(idx);
        if let Some(bytes) = slot.data().bytes() {
            return Ok(Some(Arc::clone(bytes)));
        }
        let lsn = slot.lsn();
        let Some(value) = tree.context().log.read_value(lsn)? else {
            return Ok(None);
        };
        let cached = leaf.slot_mut(idx).cache_fetched(Arc::clone(&value));
        tree.context()
            .budget
            .charge(isize::try_from(cached).unwrap_or(isize::MAX));
        Ok(Some(value))
    }
}
