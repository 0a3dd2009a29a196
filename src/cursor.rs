//! Cursors: positioned, locking access to one database.
//!
//! A cursor is a (leaf, slot index) position plus the locking context of
//! its [`Locker`]. Every operation follows the same discipline:
//!
//! 1. latch exactly one leaf,
//! 2. lock the slot's current locator (never blocking while latched),
//! 3. read or mutate the slot,
//! 4. release the latch.
//!
//! # Positions
//! A positioned cursor is registered in its leaf's
//! [`CursorRegistry`](crate::leaf::registry::CursorRegistry), which is how
//! splits move it and how compression knows not to remove its slot. Moves
//! never edit the current position in place: a fresh *walker* position is
//! registered, driven to the target slot and locked there, and only then
//! swapped in as the new anchor. A failed move drops the walker and leaves
//! the cursor exactly where it was.
//!
//! # Lock Release
//! Locks a cursor acquired are released when it moves off the record,
//! resets or closes if the locker is non-transactional (unless
//! [`CursorConfig::retain_non_txn_locks`] is set), or if they are
//! read-committed read locks of a transaction. Everything else is held
//! until the locker ends.

mod cache;
mod insert;
mod lock_record;
mod skip;
mod update;

use std::fmt as StdFmt;
use std::sync::Arc;

use crate::config::CursorConfig;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::evictor::CacheMode;
use crate::hooks::FaultPoint;
use crate::leaf::registry::CursorPosition;
use crate::lock::LockMode;
use crate::locker::{Isolation, Locker};
use crate::lsn::{Lsn, RecordVersion};
use crate::tracing_helpers::trace_log;
use crate::tree::{LatchedLeaf, Tree};

use lock_record::{LockRequest, LockStanding};

pub use skip::{SkipOutcome, SkipStop};

// ============================================================================
//  Public vocabulary
// ============================================================================

/// Direction of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Towards larger keys.
    Forward,
    /// Towards smaller keys.
    Backward,
}

/// Lock mode of a single read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReadMode {
    /// Follow the cursor's isolation.
    #[default]
    Default,
    /// No lock; skip records whose deletion is in flight.
    ReadUncommitted,
    /// No lock; expose records whose deletion is not yet committed.
    ReadUncommittedAll,
    /// Shared lock released when the cursor moves.
    ReadCommitted,
    /// Exclusive lock, for a read followed by a write.
    Rmw,
}

/// A record as seen by a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes; `None` for a deletion or when the value was not asked for.
    pub value: Option<Arc<[u8]>>,
    /// Version the value belongs to.
    pub version: RecordVersion,
    /// Expiration time in milliseconds, if any.
    pub expiration: Option<u64>,
}

/// How `put` treats an existing live record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PutMode {
    /// Leave it alone and report [`PutOutcome::KeyExists`].
    NoOverwrite,
    /// Replace its value.
    Overwrite,
}

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new record was created (or a defunct slot reused).
    Inserted(RecordVersion),
    /// An existing record was overwritten.
    Updated(RecordVersion),
    /// A live record exists and the mode was [`PutMode::NoOverwrite`]. The
    /// cursor is positioned on it, write-locked.
    KeyExists,
}

/// Value supplied to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewValue<'a> {
    /// Replace the whole value.
    Full(&'a [u8]),
    /// Overwrite `data.len()` bytes at `offset`, zero-filling any gap.
    Partial {
        /// Byte offset into the old value.
        offset: usize,
        /// Replacement bytes.
        data: &'a [u8],
    },
}

impl NewValue<'_> {
    /// Whether the old value is needed to compute the new one.
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        matches!(self, Self::Partial { .. })
    }

    /// Length of the shortest value this can produce, checked against
    /// `max`.
    ///
    /// # Errors
    /// [`StoreError::ValueTooLarge`] if the length exceeds `max` or
    /// overflows.
    pub fn checked_len(&self, max: usize) -> Result<usize> {
        let len = match *self {
            Self::Full(data) => Some(data.len()),
            Self::Partial { offset, data } => offset.checked_add(data.len()),
        };
        match len {
            Some(len) if len <= max => Ok(len),
            _ => Err(StoreError::ValueTooLarge {
                len: len.unwrap_or(usize::MAX),
                max,
            }),
        }
    }

    /// The complete new value given the old one.
    ///
    /// # Errors
    /// [`StoreError::ValueTooLarge`] if the result would exceed `max`.
    pub fn resolve(&self, old: Option<&[u8]>, max: usize) -> Result<Vec<u8>> {
        let end = self.checked_len(max)?;
        match *self {
            Self::Full(data) => Ok(data.to_vec()),
            Self::Partial { offset, data } => {
                let mut merged = old.unwrap_or_default().to_vec();
                if merged.len() > max {
                    return Err(StoreError::ValueTooLarge {
                        len: merged.len(),
                        max,
                    });
                }
                if merged.len() < end {
                    merged.resize(end, 0);
                }
                merged[offset..end].copy_from_slice(data);
                Ok(merged)
            }
        }
    }
}

/// Result of an update through a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Updated {
    /// Version written.
    pub version: RecordVersion,
    /// Value replaced, when it was asked for.
    pub old_value: Option<Arc<[u8]>>,
}

/// Result of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The record was deleted; the deletion's version.
    Deleted(RecordVersion),
    /// The deletion was applied to a leaf delta without reading the leaf.
    BlindDeleted(RecordVersion),
    /// There was no live record to delete.
    NotFound,
}

/// Lifecycle state of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorStatus {
    /// Not positioned.
    Uninitialized,
    /// Positioned on a slot.
    Initialized,
    /// Closed; every operation fails.
    Closed,
}

// ============================================================================
//  Cursor
// ============================================================================

/// Where a positioned cursor is, and what it owes the lock table.
#[derive(Debug)]
struct Anchor {
    position: Arc<CursorPosition>,
    version: RecordVersion,
    /// Locks to release when the cursor leaves this record.
    release_on_move: Vec<Lsn>,
}

#[derive(Debug)]
enum CursorState {
    Uninitialized,
    Initialized(Anchor),
    Closed,
}

/// A cursor over one database.
pub struct Cursor {
    db: Database,
    locker: Arc<Locker>,
    isolation: Isolation,
    read_uncommitted_all: bool,
    retain_non_txn_locks: bool,
    cache_mode: CacheMode,
    state: CursorState,
}

impl StdFmt::Debug for Cursor {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Cursor")
            .field("database", &self.db.name())
            .field("locker", &self.locker.id())
            .field("isolation", &self.isolation)
            .field("cache_mode", &self.cache_mode)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Cursor {
    pub(crate) fn new(db: Database, locker: Arc<Locker>, config: CursorConfig) -> Self {
        let isolation = config.isolation.unwrap_or_else(|| locker.isolation());
        let cache_mode = config.cache_mode.unwrap_or(db.config().cache_mode);
        Self {
            db,
            locker,
            isolation,
            read_uncommitted_all: config.read_uncommitted_all,
            retain_non_txn_locks: config.retain_non_txn_locks,
            cache_mode,
            state: CursorState::Uninitialized,
        }
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn status(&self) -> CursorStatus {
        match self.state {
            CursorState::Uninitialized => CursorStatus::Uninitialized,
            CursorState::Initialized(_) => CursorStatus::Initialized,
            CursorState::Closed => CursorStatus::Closed,
        }
    }

    /// Version of the record the cursor is on.
    #[must_use]
    pub const fn version(&self) -> Option<RecordVersion> {
        match &self.state {
            CursorState::Initialized(anchor) => Some(anchor.version),
            CursorState::Uninitialized | CursorState::Closed => None,
        }
    }

    /// Owning locker.
    #[must_use]
    pub const fn locker(&self) -> &Arc<Locker> {
        &self.locker
    }

    /// Database the cursor reads.
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Cache mode applied by subsequent operations.
    #[must_use]
    pub const fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    /// Change the cache mode for subsequent operations.
    pub const fn set_cache_mode(&mut self, mode: CacheMode) {
        self.cache_mode = mode;
    }

    // ========================================================================
    //  Positioning
    // ========================================================================

    /// Move to the smallest live record.
    ///
    /// Returns `None` on an empty database; the cursor is then unchanged.
    ///
    /// # Errors
    /// Lock conflicts, timeouts and interruption. The cursor is unchanged.
    pub fn first(&mut self, mode: ReadMode) -> Result<Option<Record>> {
        self.run(false, |cursor| {
            let tree = Arc::clone(cursor.db.tree());
            let request = cursor.read_request(mode, true);
            let start = tree.first_position()?;
            cursor.move_from(&tree, start, Direction::Forward, false, &request)
        })
    }

    /// Move to the largest live record.
    ///
    /// # Errors
    /// As for [`Cursor::first`].
    pub fn last(&mut self, mode: ReadMode) -> Result<Option<Record>> {
        self.run(false, |cursor| {
            let tree = Arc::clone(cursor.db.tree());
            let request = cursor.read_request(mode, true);
            let start = tree.last_position()?;
            cursor.move_from(&tree, start, Direction::Backward, false, &request)
        })
    }

    /// Move to the live record with exactly `key`.
    ///
    /// Returns `None` if there is none; the cursor is then unchanged.
    ///
    /// # Errors
    /// As for [`Cursor::first`].
    pub fn search(&mut self, key: &[u8], mode: ReadMode) -> Result<Option<Record>> {
        self.run(false, |cursor| {
            let tree = Arc::clone(cursor.db.tree());
            let mut leaf = tree.search_for_read(key)?;
            let Ok(idx) = leaf.search(key) else {
                return Ok(None);
            };
            let walker = cursor.new_position();
            let id = leaf.id();
            leaf.cursors_mut().register(&walker, id, idx);
            let request = cursor.read_request(mode, true);
            cursor.land(&tree, leaf, walker, &request)
        })
    }

    /// Move to the smallest live record with key `>= key`.
    ///
    /// # Errors
    /// As for [`Cursor::first`].
    pub fn search_range(&mut self, key: &[u8], mode: ReadMode) -> Result<Option<Record>> {
        self.run(false, |cursor| {
            let tree = Arc::clone(cursor.db.tree());
            let request = cursor.read_request(mode, true);
            let start = tree.position_at_or_after(key)?;
            cursor.move_from(&tree, start, Direction::Forward, false, &request)
        })
    }

    /// Move to the next live record. An uninitialized cursor starts at the
    /// first one.
    ///
    /// Returns `None` at the end of the database; the cursor stays put.
    ///
    /// # Errors
    /// As for [`Cursor::first`].
    pub fn next(&mut self, mode: ReadMode) -> Result<Option<Record>> {
        self.advance(Direction::Forward, mode)
    }

    /// Move to the previous live record. An uninitialized cursor starts at
    /// the last one.
    ///
    /// # Errors
    /// As for [`Cursor::first`].
    pub fn prev(&mut self, mode: ReadMode) -> Result<Option<Record>> {
        self.advance(Direction::Backward, mode)
    }

    /// Re-read the record under the cursor.
    ///
    /// Returns `None` if it became defunct since the cursor landed on it.
    ///
    /// # Errors
    /// [`StoreError::CursorNotInitialized`], lock conflicts.
    pub fn current(&mut self, mode: ReadMode) -> Result<Option<Record>> {
        self.run(false, |cursor| {
            let tree = Arc::clone(cursor.db.tree());
            let anchor = cursor.anchor_position()?;
            let mut leaf = cursor.latch_position(&tree, &anchor)?;
            let walker = cursor.new_position();
            let id = leaf.id();
            leaf.cursors_mut().register(&walker, id, anchor.index());
            let request = cursor.read_request(mode, true);
            cursor.land(&tree, leaf, walker, &request)
        })
    }

    /// Return to `Uninitialized`, releasing the locks the cursor would
    /// release on a move.
    pub fn reset(&mut self) {
        if !matches!(self.state, CursorState::Closed) {
            self.release_anchor(CursorState::Uninitialized);
        }
    }

    /// Reset and close. Closing twice is harmless.
    pub fn close(&mut self) {
        if !matches!(self.state, CursorState::Closed) {
            self.release_anchor(CursorState::Closed);
        }
    }

    /// A new cursor with the same locker and settings, positioned on the
    /// same slot when `preserve_position` is set.
    ///
    /// The clone does not inherit responsibility for releasing locks.
    ///
    /// # Errors
    /// [`StoreError::CursorClosed`].
    pub fn dup(&self, preserve_position: bool) -> Result<Self> {
        let anchor = match &self.state {
            CursorState::Closed => return Err(StoreError::CursorClosed),
            CursorState::Uninitialized => None,
            CursorState::Initialized(anchor) => Some(anchor),
        };
        let mut clone = Self {
            db: self.db.clone(),
            locker: Arc::clone(&self.locker),
            isolation: self.isolation,
            read_uncommitted_all: self.read_uncommitted_all,
            retain_non_txn_locks: self.retain_non_txn_locks,
            cache_mode: self.cache_mode,
            state: CursorState::Uninitialized,
        };
        if let (true, Some(anchor)) = (preserve_position, anchor) {
            let tree = Arc::clone(self.db.tree());
            let mut leaf = self
                .db
                .environment()
                .observe(self.latch_position(&tree, &anchor.position))?;
            let position = self.new_position();
            let id = leaf.id();
            leaf.cursors_mut()
                .register(&position, id, anchor.position.index());
            drop(leaf);
            clone.state = CursorState::Initialized(Anchor {
                position,
                version: anchor.version,
                release_on_move: Vec::new(),
            });
        }
        Ok(clone)
    }

    // ========================================================================
    //  Operation frame
    // ========================================================================

    /// Run one cursor operation: validity checks, critical eviction on both
    /// sides, and environment invalidation on a fatal error.
    fn run<T>(&mut self, dirties: bool, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if matches!(self.state, CursorState::Closed) {
            return Err(StoreError::CursorClosed);
        }
        let env = self.db.environment().clone();
        env.check_valid()?;
        self.critical_eviction(dirties);
        let result = op(self);
        self.critical_eviction(dirties);
        env.observe(result)
    }

    fn anchor_position(&self) -> Result<Arc<CursorPosition>> {
        match &self.state {
            CursorState::Initialized(anchor) => Ok(Arc::clone(&anchor.position)),
            CursorState::Uninitialized => Err(StoreError::CursorNotInitialized),
            CursorState::Closed => Err(StoreError::CursorClosed),
        }
    }

    fn new_position(&self) -> Arc<CursorPosition> {
        Arc::new(CursorPosition::new(self.db.environment().next_cursor_id()))
    }

    fn max_value_len(&self) -> usize {
        self.db.environment().config().max_value_len
    }

    fn advance(&mut self, direction: Direction, mode: ReadMode) -> Result<Option<Record>> {
        self.run(false, |cursor| {
            let tree = Arc::clone(cursor.db.tree());
            let request = cursor.read_request(mode, true);
            let anchor = match &cursor.state {
                CursorState::Initialized(anchor) => Arc::clone(&anchor.position),
                CursorState::Uninitialized => {
                    let start = match direction {
                        Direction::Forward => tree.first_position()?,
                        Direction::Backward => tree.last_position()?,
                    };
                    return cursor.move_from(&tree, start, direction, false, &request);
                }
                CursorState::Closed => return Err(StoreError::CursorClosed),
            };
            let leaf = cursor.latch_position(&tree, &anchor)?;
            let idx = anchor.index();
            cursor.move_from(&tree, Some((leaf, idx)), direction, true, &request)
        })
    }

    // ========================================================================
    //  Walking
    // ========================================================================

    /// Register a walker at `start` and walk it to the first live slot,
    /// stepping once first if `step_first`.
    fn move_from(
        &mut self,
        tree: &Arc<Tree>,
        start: Option<(LatchedLeaf, usize)>,
        direction: Direction,
        step_first: bool,
        request: &LockRequest,
    ) -> Result<Option<Record>> {
        let Some((mut leaf, idx)) = start else {
            return Ok(None);
        };
        let walker = self.new_position();
        let id = leaf.id();
        leaf.cursors_mut().register(&walker, id, idx);

        match self.walk(tree, leaf, &walker, direction, step_first, request) {
            Ok(Some((leaf, standing))) => self.settle_on(tree, leaf, walker, standing, request).map(Some),
            Ok(None) => {
                self.discard_position(tree, &walker);
                Ok(None)
            }
            Err(err) => {
                self.discard_position(tree, &walker);
                Err(err)
            }
        }
    }

    fn walk(
        &self,
        tree: &Tree,
        mut leaf: LatchedLeaf,
        walker: &Arc<CursorPosition>,
        direction: Direction,
        mut step: bool,
        request: &LockRequest,
    ) -> Result<Option<(LatchedLeaf, LockStanding)>> {
        loop {
            if step {
                match self.step(tree, leaf, walker, direction)? {
                    Some(next) => leaf = next,
                    None => return Ok(None),
                }
            }
            step = true;
            let (locked, standing) = self.lock_at(tree, leaf, walker, request)?;
            if !standing.is_defunct() {
                return Ok(Some((locked, standing)));
            }
            standing.revert(&self.locker);
            leaf = locked;
        }
    }

    fn step(
        &self,
        tree: &Tree,
        mut leaf: LatchedLeaf,
        walker: &Arc<CursorPosition>,
        direction: Direction,
    ) -> Result<Option<LatchedLeaf>> {
        let idx = walker.index();
        let next = match direction {
            Direction::Forward => (idx + 1 < leaf.len()).then_some(idx + 1),
            Direction::Backward => idx.checked_sub(1),
        };
        if let Some(next) = next {
            leaf.cursors_mut().move_to(walker.id(), next);
            return Ok(Some(leaf));
        }
        self.cross_leaf(tree, leaf, walker, direction)
    }

    /// Hand the walker over to the adjacent leaf.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn cross_leaf(
        &self,
        tree: &Tree,
        mut leaf: LatchedLeaf,
        walker: &Arc<CursorPosition>,
        direction: Direction,
    ) -> Result<Option<LatchedLeaf>> {
        let boundary = leaf.slot(walker.index()).key().to_vec();
        let pin = leaf.node().pin();
        leaf.cursors_mut().deregister(walker.id());
        let from = leaf.id();
        drop(leaf);

        tree.hooks().check(FaultPoint::LeafBoundary)?;
        self.locker.cancellation_token().check()?;

        let found = match direction {
            Direction::Forward => tree.next_leaf(&boundary)?,
            Direction::Backward => tree.prev_leaf(&boundary)?,
        };
        let Some((mut next, idx)) = found else {
            return Ok(None);
        };
        let id = next.id();
        next.cursors_mut().register(walker, id, idx);
        drop(pin);
        trace_log!(cursor = %walker.id(), %from, to = %id, "crossed leaf boundary");
        Ok(Some(next))
    }

    /// Lock the walker's slot and report it, or `None` if it is defunct.
    /// The walker is discarded unless it becomes the anchor.
    fn land(
        &mut self,
        tree: &Arc<Tree>,
        leaf: LatchedLeaf,
        walker: Arc<CursorPosition>,
        request: &LockRequest,
    ) -> Result<Option<Record>> {
        let (leaf, standing) = match self.lock_at(tree, leaf, &walker, request) {
            Ok(locked) => locked,
            Err(err) => {
                self.discard_position(tree, &walker);
                return Err(err);
            }
        };
        if standing.is_defunct() {
            drop(leaf);
            standing.revert(&self.locker);
            self.discard_position(tree, &walker);
            return Ok(None);
        }
        self.settle_on(tree, leaf, walker, standing, request).map(Some)
    }

    /// Read the locked slot under the walker and make the walker the anchor.
    fn settle_on(
        &mut self,
        tree: &Arc<Tree>,
        mut leaf: LatchedLeaf,
        walker: Arc<CursorPosition>,
        standing: LockStanding,
        request: &LockRequest,
    ) -> Result<Record> {
        let idx = walker.index();
        let (value, version, expiration) = match &standing {
            LockStanding::PriorVersion { undo, value } => (
                value.clone(),
                RecordVersion::unsequenced(undo.abort_lsn()),
                undo.abort_expiration(),
            ),
            LockStanding::Unlocked { .. } | LockStanding::Locked { .. } => {
                let value = if request.want_value {
                    match self.fetch_value(tree, &mut leaf, idx) {
                        Ok(value) => value,
                        Err(err) => {
                            drop(leaf);
                            standing.revert(&self.locker);
                            self.discard_position(tree, &walker);
                            return Err(err);
                        }
                    }
                } else {
                    None
                };
                let slot = leaf.slot(idx);
                (value, RecordVersion::unsequenced(slot.lsn()), slot.expiration())
            }
        };
        let key = leaf.slot(idx).key().to_vec();
        self.evict_value_after(&mut leaf, idx);

        let release_on_move = if request.release_on_move {
            standing.newly_locked().into_iter().collect()
        } else {
            Vec::new()
        };
        self.install_anchor(
            tree,
            leaf,
            Anchor {
                position: walker,
                version,
                release_on_move,
            },
        );
        Ok(Record {
            key,
            value,
            version,
            expiration,
        })
    }

    /// Swap in `anchor` (registered on `leaf`) and retire the old one.
    fn install_anchor(&mut self, tree: &Tree, mut leaf: LatchedLeaf, anchor: Anchor) {
        let leaf_id = leaf.id();
        let prior = match std::mem::replace(&mut self.state, CursorState::Initialized(anchor)) {
            CursorState::Initialized(prior) => Some(prior),
            CursorState::Uninitialized | CursorState::Closed => None,
        };
        // The latch pins the old position's node if it is this leaf.
        let same_leaf = prior
            .as_ref()
            .is_some_and(|prior| prior.position.node() == leaf_id);
        if let (true, Some(prior)) = (same_leaf, &prior) {
            leaf.cursors_mut().deregister(prior.position.id());
        }
        self.note_access(leaf.node());
        drop(leaf);

        if let Some(prior) = prior {
            let prior_leaf = prior.position.node();
            if !same_leaf {
                self.discard_position(tree, &prior.position);
            }
            self.retire_locks(prior.release_on_move);
            if !same_leaf {
                self.evict_prior_leaf(tree, prior_leaf);
            }
        }
    }

    /// Release locks owed by a previous anchor, carrying over any that
    /// protect the current one.
    fn retire_locks(&mut self, locks: Vec<Lsn>) {
        for lsn in locks {
            if let CursorState::Initialized(anchor) = &mut self.state
                && anchor.version.lsn == lsn
            {
                if !anchor.release_on_move.contains(&lsn) {
                    anchor.release_on_move.push(lsn);
                }
                continue;
            }
            self.release_lock(lsn);
        }
    }

    fn release_lock(&self, lsn: Lsn) {
        if self.locker.is_transactional() {
            // A transaction keeps write locks to its end.
            if self.locker.owned_mode(lsn) == Some(LockMode::Read) {
                self.locker.release(lsn);
            }
        } else {
            self.locker.release(lsn);
        }
    }

    fn release_anchor(&mut self, next: CursorState) {
        if let CursorState::Initialized(anchor) = std::mem::replace(&mut self.state, next) {
            let tree = Arc::clone(self.db.tree());
            let leaf_id = anchor.position.node();
            self.discard_position(&tree, &anchor.position);
            for lsn in anchor.release_on_move {
                self.release_lock(lsn);
            }
            self.evict_prior_leaf(&tree, leaf_id);
        }
    }

    // ========================================================================
    //  Latching positions
    // ========================================================================

    /// Latch the leaf `position` is registered on.
    ///
    /// The node id is read unlatched, so it is re-checked under the latch: a
    /// split may have moved the position in between.
    fn latch_position(&self, tree: &Tree, position: &CursorPosition) -> Result<LatchedLeaf> {
        loop {
            let id = position.node();
            let leaf = tree.latch_leaf(id)?;
            if position.node() != id {
                continue;
            }
            if !leaf.cursors().contains(position.id()) {
                return Err(StoreError::unexpected(format!(
                    "cursor {} is not registered on leaf {id}",
                    position.id()
                )));
            }
            return Ok(leaf);
        }
    }

    /// Deregister `position` wherever it is. Tolerates positions that were
    /// never placed or are already gone.
    fn discard_position(&self, tree: &Tree, position: &CursorPosition) {
        loop {
            let id = position.node();
            let Ok(mut leaf) = tree.latch_leaf(id) else {
                return;
            };
            if position.node() == id {
                leaf.cursors_mut().deregister(position.id());
                return;
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, EnvConfig};
    use crate::env::Environment;

    fn env_with_leaf_capacity(leaf_capacity: usize) -> Environment {
        Environment::open(EnvConfig {
            leaf_capacity,
            internal_capacity: 4,
            lock_timeout_ms: 0,
            ..EnvConfig::default()
        })
    }

    fn key(i: u32) -> Vec<u8> {
        format!("k{i:05}").into_bytes()
    }

    fn fill(db: &Database, locker: &Arc<Locker>, n: u32) {
        for i in 0..n {
            db.put(locker, &key(i), format!("v{i}").as_bytes()).unwrap();
        }
    }

    #[test]
    fn test_new_value_resolve() {
        assert_eq!(NewValue::Full(b"abc").resolve(Some(b"zzzz"), 64).unwrap(), b"abc");
        let partial = NewValue::Partial {
            offset: 2,
            data: b"XY",
        };
        assert!(partial.is_partial());
        assert_eq!(partial.resolve(Some(b"abcdef"), 64).unwrap(), b"abXYef");
        assert_eq!(partial.resolve(Some(b"a"), 64).unwrap(), b"a\0XY");
        assert_eq!(partial.resolve(None, 64).unwrap(), b"\0\0XY");
    }

    #[test]
    fn test_new_value_length_is_bounded() {
        let wrapping = NewValue::Partial {
            offset: usize::MAX,
            data: b"x",
        };
        assert_eq!(
            wrapping.resolve(None, 64).unwrap_err(),
            StoreError::ValueTooLarge {
                len: usize::MAX,
                max: 64
            }
        );

        let past_limit = NewValue::Partial {
            offset: 60,
            data: b"abcde",
        };
        assert_eq!(
            past_limit.checked_len(64).unwrap_err(),
            StoreError::ValueTooLarge { len: 65, max: 64 }
        );
        assert_eq!(past_limit.checked_len(65).unwrap(), 65);
        assert!(NewValue::Full(&[0_u8; 8]).resolve(None, 4).is_err());
    }

    #[test]
    fn test_forward_and_backward_scans_cross_leaves() {
        let env = env_with_leaf_capacity(4);
        let db = env.open_database("scan", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        fill(&db, &locker, 30);
        assert!(db.tree().height() > 1);

        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        let mut forward = Vec::new();
        while let Some(record) = cursor.next(ReadMode::Default).unwrap() {
            forward.push(record.key);
        }
        assert_eq!(forward, (0..30).map(key).collect::<Vec<_>>());

        cursor.reset();
        let mut backward = Vec::new();
        while let Some(record) = cursor.prev(ReadMode::Default).unwrap() {
            backward.push(record.key);
        }
        forward.reverse();
        assert_eq!(backward, forward);
    }

    #[test]
    fn test_end_of_data_keeps_position() {
        let env = env_with_leaf_capacity(4);
        let db = env.open_database("end", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        fill(&db, &locker, 3);

        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        let last = cursor.last(ReadMode::Default).unwrap().unwrap();
        assert!(cursor.next(ReadMode::Default).unwrap().is_none());
        assert_eq!(cursor.status(), CursorStatus::Initialized);
        assert_eq!(cursor.current(ReadMode::Default).unwrap().unwrap().key, last.key);
    }

    #[test]
    fn test_search_miss_leaves_cursor_in_place() {
        let env = env_with_leaf_capacity(8);
        let db = env.open_database("miss", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        fill(&db, &locker, 5);

        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        let hit = cursor.search(&key(2), ReadMode::Default).unwrap().unwrap();
        assert_eq!(&*hit.value.unwrap(), b"v2");
        assert!(cursor.search(b"nope", ReadMode::Default).unwrap().is_none());
        assert_eq!(cursor.current(ReadMode::Default).unwrap().unwrap().key, key(2));

        let range = cursor.search_range(b"k00002x", ReadMode::Default).unwrap().unwrap();
        assert_eq!(range.key, key(3));
    }

    #[test]
    fn test_cursor_registration_follows_moves() {
        let env = env_with_leaf_capacity(4);
        let db = env.open_database("reg", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        fill(&db, &locker, 12);

        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        for _ in 0..7 {
            cursor.next(ReadMode::Default).unwrap().unwrap();
        }
        assert_eq!(db.leaf_stats().unwrap().cursor_count, 1);

        let clone = cursor.dup(true).unwrap();
        assert_eq!(clone.version(), cursor.version());
        assert_eq!(db.leaf_stats().unwrap().cursor_count, 2);

        cursor.reset();
        assert_eq!(cursor.status(), CursorStatus::Uninitialized);
        drop(clone);
        assert_eq!(db.leaf_stats().unwrap().cursor_count, 0);
    }

    #[test]
    fn test_closed_cursor_rejects_operations() {
        let env = env_with_leaf_capacity(8);
        let db = env.open_database("closed", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        cursor.close();
        cursor.close();
        assert_eq!(cursor.status(), CursorStatus::Closed);
        assert!(matches!(cursor.first(ReadMode::Default), Err(StoreError::CursorClosed)));
        assert!(matches!(cursor.dup(false), Err(StoreError::CursorClosed)));
    }

    #[test]
    fn test_current_requires_position() {
        let env = env_with_leaf_capacity(8);
        let db = env.open_database("uninit", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        assert!(matches!(
            cursor.current(ReadMode::Default),
            Err(StoreError::CursorNotInitialized)
        ));
    }

    #[test]
    fn test_non_txn_locks_released_on_move() {
        let env = env_with_leaf_capacity(8);
        let db = env.open_database("release", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        fill(&db, &locker, 3);

        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        let first = cursor.first(ReadMode::Default).unwrap().unwrap();
        assert!(env.lock_table().is_locked(first.version.lsn));
        let second = cursor.next(ReadMode::Default).unwrap().unwrap();
        assert!(!env.lock_table().is_locked(first.version.lsn));
        assert!(env.lock_table().is_locked(second.version.lsn));
        cursor.close();
        assert_eq!(env.lock_table().locked_count(), 0);
    }

    #[test]
    fn test_retained_locks_survive_moves() {
        let env = env_with_leaf_capacity(8);
        let db = env.open_database("retain", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        fill(&db, &locker, 3);

        let config = CursorConfig {
            retain_non_txn_locks: true,
            ..CursorConfig::default()
        };
        let mut cursor = db.open_cursor(&locker, config).unwrap();
        let first = cursor.first(ReadMode::Default).unwrap().unwrap();
        cursor.next(ReadMode::Default).unwrap().unwrap();
        cursor.close();
        assert!(env.lock_table().is_locked(first.version.lsn));
        locker.release_all();
        assert_eq!(env.lock_table().locked_count(), 0);
    }

    #[test]
    fn test_repeatable_read_keeps_read_locks() {
        let env = env_with_leaf_capacity(8);
        let db = env.open_database("rr", DatabaseConfig::default()).unwrap();
        let auto = env.non_txn_locker().unwrap();
        fill(&db, &auto, 3);

        let txn = env.begin_txn(Isolation::RepeatableRead).unwrap();
        let mut cursor = db.open_cursor(&txn, CursorConfig::default()).unwrap();
        let first = cursor.first(ReadMode::Default).unwrap().unwrap();
        cursor.next(ReadMode::Default).unwrap().unwrap();
        cursor.close();
        assert_eq!(
            env.lock_table().owner_mode(first.version.lsn, txn.id()),
            Some(LockMode::Read)
        );

        let rc = env.begin_txn(Isolation::ReadCommitted).unwrap();
        let mut cursor = db.open_cursor(&rc, CursorConfig::default()).unwrap();
        let first = cursor.first(ReadMode::Default).unwrap().unwrap();
        cursor.next(ReadMode::Default).unwrap().unwrap();
        assert_eq!(env.lock_table().owner_mode(first.version.lsn, rc.id()), None);
        cursor.close();
        txn.commit().unwrap();
        rc.commit().unwrap();
    }
}
