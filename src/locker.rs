//! Lock owners: transactions and non-transactional lockers.
//!
//! A [`Locker`] is the identity locks are granted to. Transactional lockers
//! keep every lock until [`Locker::commit`] or [`Locker::abort`] and record
//! an undo entry per write; non-transactional lockers auto-commit each write
//! and drop their locks as the owning cursor moves.
//!
//! Lockers are shared as `Arc<Locker>` between the cursors using them, but a
//! locker is used from one thread at a time.

use std::collections::HashMap;
use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::lock::{LockAttempt, LockGrant, LockMode, LockTable, LockerId};
use crate::lsn::Lsn;
use crate::slot::Slot;
use crate::tracing_helpers::{debug_log, warn_log};
use crate::tree::Tree;

/// Read isolation of a locker or cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Isolation {
    /// Reads take no locks and may see uncommitted data.
    ReadUncommitted,
    /// Reads lock, and release the lock when the cursor moves.
    ReadCommitted,
    /// Reads keep their locks until the locker ends.
    #[default]
    RepeatableRead,
    /// Like read-committed, but a read blocked by a writer returns the
    /// writer's abort version instead of waiting.
    OptimisticReadCommitted,
}

/// Whether a locker groups writes into a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerKind {
    /// Writes are undone on abort; locks held to the end.
    Transactional,
    /// Each write commits immediately.
    NonTransactional,
}

// ============================================================================
//  Undo
// ============================================================================

/// What a slot looked like before a write, enough to restore it on abort.
///
/// Published on the new version's lock so optimistic readers can return the
/// prior version instead of waiting for the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoDescriptor {
    abort_lsn: Lsn,
    abort_known_deleted: bool,
    abort_pending_deleted: bool,
    abort_data: Option<Arc<[u8]>>,
    abort_expiration: Option<u64>,
}

impl UndoDescriptor {
    /// Undo of a write that created the record.
    #[must_use]
    pub const fn for_insert() -> Self {
        Self {
            abort_lsn: Lsn::NULL,
            abort_known_deleted: true,
            abort_pending_deleted: false,
            abort_data: None,
            abort_expiration: None,
        }
    }

    /// Capture `slot` as it is before being overwritten.
    #[must_use]
    pub(crate) fn capture(slot: &Slot) -> Self {
        Self {
            abort_lsn: slot.lsn(),
            abort_known_deleted: slot.is_known_deleted() || slot.lsn().is_null(),
            abort_pending_deleted: slot.is_pending_deleted(),
            abort_data: slot.data().bytes().cloned(),
            abort_expiration: slot.expiration(),
        }
    }

    /// Locator to restore.
    #[must_use]
    pub const fn abort_lsn(&self) -> Lsn {
        self.abort_lsn
    }

    /// Whether the restored record would not exist.
    #[must_use]
    pub const fn is_abort_defunct(&self) -> bool {
        self.abort_lsn.is_null() || self.abort_known_deleted || self.abort_pending_deleted
    }

    pub(crate) const fn abort_known_deleted(&self) -> bool {
        self.abort_known_deleted
    }

    pub(crate) const fn abort_pending_deleted(&self) -> bool {
        self.abort_pending_deleted
    }

    /// Prior value, if it was in memory when captured.
    #[must_use]
    pub const fn abort_data(&self) -> Option<&Arc<[u8]>> {
        self.abort_data.as_ref()
    }

    /// Prior expiration.
    #[must_use]
    pub const fn abort_expiration(&self) -> Option<u64> {
        self.abort_expiration
    }
}

struct UndoRecord {
    tree: Arc<Tree>,
    key: Box<[u8]>,
    new_lsn: Lsn,
    undo: Arc<UndoDescriptor>,
}

// ============================================================================
//  Locker
// ============================================================================

#[derive(Default)]
struct LockerState {
    ended: bool,
    undo: Vec<UndoRecord>,
    /// First time each locator was locked, for the expiration grace rule.
    first_locked: HashMap<Lsn, u64>,
}

/// A lock owner.
pub struct Locker {
    id: LockerId,
    kind: LockerKind,
    isolation: Isolation,
    locks: Arc<LockTable>,
    clock: Arc<dyn Clock>,
    timeout_ms: AtomicU64,
    interrupt: CancellationToken,
    state: Mutex<LockerState>,
}

impl StdFmt::Debug for Locker {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Locker")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("isolation", &self.isolation)
            .finish_non_exhaustive()
    }
}

impl Locker {
    pub(crate) fn new(
        id: LockerId,
        kind: LockerKind,
        isolation: Isolation,
        locks: Arc<LockTable>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        #[expect(clippy::cast_possible_truncation, reason = "timeouts are far below u64::MAX ms")]
        let timeout_ms = timeout.as_millis() as u64;
        Self {
            id,
            kind,
            isolation,
            locks,
            clock,
            timeout_ms: AtomicU64::new(timeout_ms),
            interrupt: CancellationToken::new(),
            state: Mutex::new(LockerState::default()),
        }
    }

    /// Lock owner identity.
    #[must_use]
    pub const fn id(&self) -> LockerId {
        self.id
    }

    /// Transactional or not.
    #[must_use]
    pub const fn kind(&self) -> LockerKind {
        self.kind
    }

    /// `kind() == Transactional`.
    #[must_use]
    pub const fn is_transactional(&self) -> bool {
        matches!(self.kind, LockerKind::Transactional)
    }

    /// Default read isolation for cursors using this locker.
    #[must_use]
    pub const fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Current lock wait limit.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Change the lock wait limit. Zero means no-wait.
    pub fn set_lock_timeout(&self, timeout: Duration) {
        #[expect(clippy::cast_possible_truncation, reason = "timeouts are far below u64::MAX ms")]
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Interrupt any current or future lock wait of this locker.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Undo [`Locker::interrupt`].
    pub fn clear_interrupt(&self) {
        self.interrupt.reset();
    }

    /// The token observed by this locker's lock waits.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Whether the transaction has neither committed nor aborted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.state.lock().ended
    }

    pub(crate) fn check_active(&self) -> Result<()> {
        if self.state.lock().ended {
            return Err(StoreError::LockerInactive {
                locker: self.id.as_raw(),
            });
        }
        Ok(())
    }

    pub(crate) const fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }

    // ========================================================================
    //  Locking
    // ========================================================================

    fn note_locked(&self, lsn: Lsn) {
        let now = self.clock.now_millis();
        self.state.lock().first_locked.entry(lsn).or_insert(now);
    }

    /// Non-blocking request.
    pub(crate) fn try_lock(&self, lsn: Lsn, mode: LockMode) -> Result<LockAttempt> {
        self.check_active()?;
        let attempt = self.locks.try_lock(lsn, self.id, mode);
        if matches!(attempt, LockAttempt::Granted(_)) {
            self.note_locked(lsn);
        }
        Ok(attempt)
    }

    /// Blocking request bounded by the locker's timeout and interrupt.
    ///
    /// The caller must not hold any latch.
    pub(crate) fn lock(&self, lsn: Lsn, mode: LockMode) -> Result<LockGrant> {
        self.check_active()?;
        self.interrupt.check()?;
        let grant = self
            .locks
            .lock(lsn, self.id, mode, self.lock_timeout(), &self.interrupt)?;
        self.note_locked(lsn);
        Ok(grant)
    }

    /// Undo a grant obtained by this locker.
    pub(crate) fn revert(&self, lsn: Lsn, grant: LockGrant) {
        match grant {
            LockGrant::New => {
                self.release(lsn);
            }
            LockGrant::Promoted => {
                self.locks.demote(lsn, self.id);
            }
            LockGrant::Existing => {}
        }
    }

    pub(crate) fn release(&self, lsn: Lsn) -> bool {
        self.state.lock().first_locked.remove(&lsn);
        self.locks.release(lsn, self.id)
    }

    pub(crate) fn owned_mode(&self, lsn: Lsn) -> Option<LockMode> {
        self.locks.owner_mode(lsn, self.id)
    }

    /// Whether this locker locked `lsn` strictly before `when`.
    pub(crate) fn locked_before(&self, lsn: Lsn, when: u64) -> bool {
        self.state
            .lock()
            .first_locked
            .get(&lsn)
            .is_some_and(|&at| at < when)
    }

    /// Release every lock this locker owns.
    pub fn release_all(&self) -> usize {
        self.state.lock().first_locked.clear();
        self.locks.release_all(self.id)
    }

    // ========================================================================
    //  Transaction end
    // ========================================================================

    /// Record a write for undo. Non-transactional writes are not recorded.
    pub(crate) fn record_write(
        &self,
        tree: &Arc<Tree>,
        key: &[u8],
        new_lsn: Lsn,
        undo: Arc<UndoDescriptor>,
    ) {
        if !self.is_transactional() {
            return;
        }
        self.state.lock().undo.push(UndoRecord {
            tree: Arc::clone(tree),
            key: key.into(),
            new_lsn,
            undo,
        });
    }

    /// Make the transaction's writes permanent and release its locks.
    ///
    /// For a non-transactional locker this only releases locks.
    ///
    /// # Errors
    /// [`StoreError::LockerInactive`] if the transaction already ended.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn commit(&self) -> Result<()> {
        if !self.is_transactional() {
            self.release_all();
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            if state.ended {
                return Err(StoreError::LockerInactive {
                    locker: self.id.as_raw(),
                });
            }
            state.ended = true;
            state.undo.clear();
        }
        let released = self.release_all();
        debug_log!(locker = %self.id, released, "transaction committed");
        Ok(())
    }

    /// Restore every slot this transaction wrote, newest first, then release
    /// its locks. The caller must not hold any latch.
    ///
    /// # Errors
    /// - [`StoreError::LockerInactive`] if the transaction already ended
    /// - the first error hit while restoring; remaining records are still
    ///   restored and all locks are released
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn abort(&self) -> Result<()> {
        let records: Vec<UndoRecord> = {
            let mut state = self.state.lock();
            if state.ended {
                return Err(StoreError::LockerInactive {
                    locker: self.id.as_raw(),
                });
            }
            state.ended = true;
            std::mem::take(&mut state.undo)
        };

        let mut first_error: Option<StoreError> = None;
        let undone = records.len();
        for record in records.into_iter().rev() {
            if let Err(err) =
                record
                    .tree
                    .undo_write(&record.key, record.new_lsn, self.id, &record.undo)
            {
                warn_log!(locker = %self.id, error = %err, "undo failed");
                first_error.get_or_insert(err);
            }
        }

        let released = self.release_all();
        debug_log!(locker = %self.id, undone, released, "transaction aborted");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        if self.is_transactional() && self.is_active() {
            warn_log!(locker = %self.id, "active transaction dropped; aborting");
            let _ = self.abort();
        } else {
            self.locks.release_all(self.id);
        }
    }
}
