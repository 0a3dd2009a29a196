//! Updates and deletes through a positioned cursor, and blind deletes.
//!
//! Every write goes through [`Cursor::write_slot`]: log the version, lock
//! the new locator, publish the undo descriptor on that lock, then install
//! the version into the slot, all before the latch is released. A log
//! failure leaves the slot untouched.

use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::hooks::FaultPoint;
use crate::leaf::Residency;
use crate::leaf::registry::CursorPosition;
use crate::lock::{LockAttempt, LockGrant, LockMode};
use crate::locker::UndoDescriptor;
use crate::log::{LogEntry, LogEntryKind, LoggedVersion};
use crate::lsn::{Lsn, RecordVersion};
use crate::slot::Slot;
use crate::tracing_helpers::trace_log;
use crate::tree::{LatchedLeaf, Tree};

use super::lock_record::LockStanding;
use super::{Anchor, Cursor, DeleteOutcome, NewValue, Updated};

/// One version to write into a slot.
pub(super) struct SlotWrite<'a> {
    pub(super) kind: LogEntryKind,
    pub(super) value: Option<&'a [u8]>,
    pub(super) expiration: Option<u64>,
    pub(super) undo: Arc<UndoDescriptor>,
}

impl Cursor {
    /// Replace the value of the record under the cursor.
    ///
    /// Returns `None` if the record became defunct since the cursor landed
    /// on it. The old value is fetched only for a partial update or when
    /// `return_old` is set. The record keeps its expiration.
    ///
    /// # Errors
    /// [`StoreError::CursorNotInitialized`], lock conflicts, durability
    /// failures (the record is unchanged), [`StoreError::ValueTooLarge`].
    pub fn update_current(
        &mut self,
        value: NewValue<'_>,
        return_old: bool,
    ) -> Result<Option<Updated>> {
        self.run(true, |cursor| {
            value.checked_len(cursor.max_value_len())?;
            let tree = Arc::clone(cursor.db.tree());
            let Some((leaf, walker, standing)) = cursor.lock_current(&tree)? else {
                return Ok(None);
            };
            let expiration = leaf.slot(walker.index()).expiration();
            cursor
                .overwrite(&tree, leaf, walker, &standing, value, expiration, return_old)
                .map(Some)
        })
    }

    /// Delete the record under the cursor. The cursor stays on its slot.
    ///
    /// A transactional delete leaves the slot pending-deleted until the
    /// transaction ends; a non-transactional one is known-deleted at once.
    ///
    /// # Errors
    /// As for [`Cursor::update_current`].
    pub fn delete_current(&mut self) -> Result<DeleteOutcome> {
        self.run(true, |cursor| {
            let tree = Arc::clone(cursor.db.tree());
            let Some((mut leaf, walker, standing)) = cursor.lock_current(&tree)? else {
                return Ok(DeleteOutcome::NotFound);
            };
            let idx = walker.index();
            let write = SlotWrite {
                kind: LogEntryKind::Delete,
                value: None,
                expiration: leaf.slot(idx).expiration(),
                undo: Arc::new(UndoDescriptor::capture(leaf.slot(idx))),
            };
            let logged = match cursor.write_slot(&tree, &mut leaf, idx, write) {
                Ok(logged) => logged,
                Err(err) => {
                    cursor.abandon(leaf, &walker, &standing);
                    return Err(err);
                }
            };
            if cursor.locker.is_transactional() {
                leaf.slot_mut(idx).mark_pending_deleted();
            } else {
                leaf.slot_mut(idx).mark_known_deleted();
            }
            let version = RecordVersion {
                lsn: logged.lsn,
                seq: logged.seq,
            };
            let release_on_move = cursor.write_release(&standing, Some(logged.lsn));
            cursor.install_anchor(
                &tree,
                leaf,
                Anchor {
                    position: walker,
                    version,
                    release_on_move,
                },
            );
            Ok(DeleteOutcome::Deleted(version))
        })
    }

    /// Write-lock the record under the cursor through a fresh walker.
    ///
    /// `None` when it is defunct; nothing is then left locked or registered.
    fn lock_current(
        &self,
        tree: &Tree,
    ) -> Result<Option<(LatchedLeaf, Arc<CursorPosition>, LockStanding)>> {
        let anchor = self.anchor_position()?;
        let mut leaf = self.latch_position(tree, &anchor)?;
        let walker = self.new_position();
        let id = leaf.id();
        leaf.cursors_mut().register(&walker, id, anchor.index());

        let request = self.write_request(true);
        let (mut leaf, standing) = match self.lock_at(tree, leaf, &walker, &request) {
            Ok(locked) => locked,
            Err(err) => {
                self.discard_position(tree, &walker);
                return Err(err);
            }
        };
        if standing.is_defunct() {
            leaf.cursors_mut().deregister(walker.id());
            drop(leaf);
            standing.revert(&self.locker);
            return Ok(None);
        }
        Ok(Some((leaf, walker, standing)))
    }

    /// Write a new version over the live, locked slot under `walker`.
    #[expect(clippy::too_many_arguments, reason = "one call per write path")]
    pub(super) fn overwrite(
        &mut self,
        tree: &Arc<Tree>,
        mut leaf: LatchedLeaf,
        walker: Arc<CursorPosition>,
        standing: &LockStanding,
        value: NewValue<'_>,
        expiration: Option<u64>,
        return_old: bool,
    ) -> Result<Updated> {
        let idx = walker.index();
        let old = if value.is_partial() || return_old {
            match self.fetch_value(tree, &mut leaf, idx) {
                Ok(old) => old,
                Err(err) => {
                    self.abandon(leaf, &walker, standing);
                    return Err(err);
                }
            }
        } else {
            None
        };
        let written = value
            .resolve(old.as_deref(), self.max_value_len())
            .and_then(|bytes| {
                let write = SlotWrite {
                    kind: LogEntryKind::Update,
                    value: Some(&bytes),
                    expiration,
                    undo: Arc::new(UndoDescriptor::capture(leaf.slot(idx))),
                };
                self.write_slot(tree, &mut leaf, idx, write)
            });
        let logged = match written {
            Ok(logged) => logged,
            Err(err) => {
                self.abandon(leaf, &walker, standing);
                return Err(err);
            }
        };
        let version = RecordVersion {
            lsn: logged.lsn,
            seq: logged.seq,
        };
        self.evict_value_after(&mut leaf, idx);
        let release_on_move = self.write_release(standing, Some(logged.lsn));
        self.install_anchor(
            tree,
            leaf,
            Anchor {
                position: walker,
                version,
                release_on_move,
            },
        );
        Ok(Updated {
            version,
            old_value: if return_old { old } else { None },
        })
    }

    /// Log `write` for slot `idx` and install it.
    ///
    /// The new locator is write-locked by this locker before the latch can
    /// be released, so no other cursor can observe it unlocked.
    pub(super) fn write_slot(
        &self,
        tree: &Arc<Tree>,
        leaf: &mut LatchedLeaf,
        idx: usize,
        write: SlotWrite<'_>,
    ) -> Result<LoggedVersion> {
        let ctx = tree.context();
        ctx.hooks.check(FaultPoint::BeforeLogWrite)?;
        let slot = leaf.slot(idx);
        let logged = ctx.log.write_version(&LogEntry {
            kind: write.kind,
            database: tree.database(),
            key: slot.key(),
            value: write.value,
            prior: slot.lsn(),
            txn: self.locker.is_transactional().then(|| self.locker.id()),
            expiration: write.expiration,
        })?;

        match self.locker.try_lock(logged.lsn, LockMode::Write)? {
            LockAttempt::Granted(LockGrant::New) => {}
            other => {
                return Err(StoreError::unexpected(format!(
                    "fresh locator {} was already locked: {other:?}",
                    logged.lsn
                )));
            }
        }
        if self.locker.is_transactional() {
            ctx.locks
                .publish_undo(logged.lsn, self.locker.id(), Arc::clone(&write.undo));
        }

        let now = ctx.clock.now_millis();
        let slot = leaf.slot_mut(idx);
        let delta = slot.install_version(
            logged.lsn,
            write.value.map(Arc::from),
            tree.config().max_embedded_value,
            logged.size,
            now,
        );
        slot.set_expiration(write.expiration);
        ctx.budget.charge(delta);

        let key = slot.key().to_vec();
        self.locker.record_write(tree, &key, logged.lsn, write.undo);
        trace_log!(lsn = %logged.lsn, kind = ?write.kind, "version installed");
        Ok(logged)
    }

    /// Apply a delete to a leaf delta without reading the full leaf.
    ///
    /// `None` when the fast path does not apply: the database does not allow
    /// it, the locker is transactional, the leaf is not a delta, the key is
    /// already in the delta or cannot be in its image, or the delta has no
    /// room.
    pub(crate) fn blind_delete(&mut self, key: &[u8]) -> Result<Option<DeleteOutcome>> {
        if !self.db.config().allows_blind_deletion() || self.locker.is_transactional() {
            return Ok(None);
        }
        self.run(true, |cursor| {
            let tree = Arc::clone(cursor.db.tree());
            let mut leaf = tree.search_allow_delta(key)?;
            if leaf.residency() != Residency::Delta || leaf.is_full(tree.config().leaf_capacity) {
                return Ok(None);
            }
            let Err(idx) = leaf.search(key) else {
                return Ok(None);
            };
            if !leaf.image_may_contain(key) {
                trace_log!(leaf = %leaf.id(), "key outside delta image; using full path");
                return Ok(None);
            }

            leaf.insert_slot(idx, Slot::tombstone(key));
            let ctx = tree.context();
            let logged = ctx.hooks.check(FaultPoint::BeforeLogWrite).and_then(|()| {
                ctx.log.write_version(&LogEntry {
                    kind: LogEntryKind::BlindDelete,
                    database: tree.database(),
                    key,
                    value: None,
                    prior: Lsn::NULL,
                    txn: None,
                    expiration: None,
                })
            });
            let logged = match logged {
                Ok(logged) => logged,
                Err(err) => {
                    // A tombstone left behind would shadow the image slot.
                    leaf.remove_slot(idx);
                    return Err(err);
                }
            };

            let now = ctx.clock.now_millis();
            let slot = leaf.slot_mut(idx);
            let delta = slot.install_version(
                logged.lsn,
                None,
                tree.config().max_embedded_value,
                logged.size,
                now,
            );
            slot.mark_known_deleted();
            ctx.budget.charge(delta);
            let locked = matches!(
                cursor.locker.try_lock(logged.lsn, LockMode::Write)?,
                LockAttempt::Granted(_)
            );
            drop(leaf);
            if locked {
                cursor.locker.release(logged.lsn);
            }
            trace_log!(lsn = %logged.lsn, "blind delete applied to delta");
            Ok(Some(DeleteOutcome::BlindDeleted(RecordVersion {
                lsn: logged.lsn,
                seq: logged.seq,
            })))
        })
    }
}
