//! Inserting through a cursor.
//!
//! The target leaf comes from `search_for_insert`, which has already split
//! it if needed, so the cursor registers only once the slot it will occupy
//! is final. Three cases follow, all under that one latch:
//! - absent key: a new slot is created and the version logged into it
//! - defunct slot: the slot is reused, with undo back to the defunct state
//! - live slot: overwritten, or reported as [`PutOutcome::KeyExists`]

use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::leaf::registry::CursorPosition;
use crate::locker::UndoDescriptor;
use crate::log::LogEntryKind;
use crate::lsn::{Lsn, RecordVersion};
use crate::slot::Slot;
use crate::tree::{LatchedLeaf, Tree};

use super::lock_record::LockStanding;
use super::update::SlotWrite;
use super::{Anchor, Cursor, NewValue, PutMode, PutOutcome};

impl Cursor {
    /// Insert or overwrite `key`.
    ///
    /// On success the cursor is positioned on the record.
    ///
    /// # Errors
    /// - [`StoreError::KeyTooLarge`]
    /// - [`StoreError::ValueTooLarge`], before anything is latched
    /// - lock conflicts on an existing record
    /// - [`StoreError::Durability`]: a new slot is left known-deleted, a
    ///   reused or overwritten slot keeps its previous state
    pub fn put(&mut self, key: &[u8], value: &[u8], mode: PutMode) -> Result<PutOutcome> {
        self.put_with(key, NewValue::Full(value), mode, None)
    }

    /// [`Cursor::put`] with a partial value and an expiration time.
    ///
    /// A partial value written to a new record is zero-filled below its
    /// offset. The new version carries `expiration`.
    ///
    /// # Errors
    /// As for [`Cursor::put`].
    pub fn put_with(
        &mut self,
        key: &[u8],
        value: NewValue<'_>,
        mode: PutMode,
        expiration: Option<u64>,
    ) -> Result<PutOutcome> {
        self.run(true, |cursor| {
            let config = cursor.db.environment().config();
            let max = config.max_key_len;
            if key.len() > max {
                return Err(StoreError::KeyTooLarge {
                    len: key.len(),
                    max,
                });
            }
            value.checked_len(config.max_value_len)?;
            let tree = Arc::clone(cursor.db.tree());
            cursor.insert_or_update(&tree, key, value, mode, expiration)
        })
    }

    fn insert_or_update(
        &mut self,
        tree: &Arc<Tree>,
        key: &[u8],
        value: NewValue<'_>,
        mode: PutMode,
        expiration: Option<u64>,
    ) -> Result<PutOutcome> {
        let mut leaf = tree.search_for_insert(key)?;
        let walker = self.new_position();
        let id = leaf.id();

        let idx = match leaf.search(key) {
            Ok(idx) => idx,
            Err(idx) => {
                leaf.insert_slot(idx, Slot::new(key));
                leaf.cursors_mut().register(&walker, id, idx);
                return self
                    .insert_new(tree, leaf, walker, value, expiration)
                    .map(PutOutcome::Inserted);
            }
        };

        leaf.cursors_mut().register(&walker, id, idx);
        let request = self.write_request(mode == PutMode::Overwrite);
        let (leaf, standing) = match self.lock_at(tree, leaf, &walker, &request) {
            Ok(locked) => locked,
            Err(err) => {
                self.discard_position(tree, &walker);
                return Err(err);
            }
        };

        if standing.is_defunct() {
            return self
                .reuse_defunct(tree, leaf, walker, &standing, value, expiration)
                .map(PutOutcome::Inserted);
        }
        match mode {
            PutMode::NoOverwrite => {
                let version = RecordVersion::unsequenced(standing.lsn());
                let release_on_move = self.write_release(&standing, None);
                self.install_anchor(
                    tree,
                    leaf,
                    Anchor {
                        position: walker,
                        version,
                        release_on_move,
                    },
                );
                Ok(PutOutcome::KeyExists)
            }
            PutMode::Overwrite => self
                .overwrite(tree, leaf, walker, &standing, value, expiration, false)
                .map(|updated| PutOutcome::Updated(updated.version)),
        }
    }

    /// Log the first version into a just-created slot.
    fn insert_new(
        &mut self,
        tree: &Arc<Tree>,
        mut leaf: LatchedLeaf,
        walker: Arc<CursorPosition>,
        value: NewValue<'_>,
        expiration: Option<u64>,
    ) -> Result<RecordVersion> {
        let idx = walker.index();
        let written = value
            .resolve(None, self.max_value_len())
            .and_then(|bytes| {
                let write = SlotWrite {
                    kind: LogEntryKind::Insert,
                    value: Some(&bytes),
                    expiration,
                    undo: Arc::new(UndoDescriptor::for_insert()),
                };
                self.write_slot(tree, &mut leaf, idx, write)
            });
        match written {
            Ok(logged) => {
                let version = RecordVersion {
                    lsn: logged.lsn,
                    seq: logged.seq,
                };
                self.evict_value_after(&mut leaf, idx);
                let release_on_move = self.write_release_new(logged.lsn);
                self.install_anchor(
                    tree,
                    leaf,
                    Anchor {
                        position: walker,
                        version,
                        release_on_move,
                    },
                );
                Ok(version)
            }
            Err(err) => {
                // The slot exists but its record never did.
                leaf.slot_mut(idx).mark_known_deleted();
                leaf.cursors_mut().deregister(walker.id());
                Err(err)
            }
        }
    }

    /// Write a new record into a defunct slot.
    fn reuse_defunct(
        &mut self,
        tree: &Arc<Tree>,
        mut leaf: LatchedLeaf,
        walker: Arc<CursorPosition>,
        standing: &LockStanding,
        value: NewValue<'_>,
        expiration: Option<u64>,
    ) -> Result<RecordVersion> {
        let idx = walker.index();
        let written = value
            .resolve(None, self.max_value_len())
            .and_then(|bytes| {
                let write = SlotWrite {
                    kind: LogEntryKind::Insert,
                    value: Some(&bytes),
                    expiration,
                    undo: Arc::new(UndoDescriptor::capture(leaf.slot(idx))),
                };
                self.write_slot(tree, &mut leaf, idx, write)
            });
        match written {
            Ok(logged) => {
                leaf.slot_mut(idx).clear_deleted();
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
                Ok(version)
            }
            Err(err) => {
                self.abandon(leaf, &walker, standing);
                Err(err)
            }
        }
    }

    /// Locks a write leaves for release on move: whatever the standing newly
    /// took plus the new version's lock, for non-transactional cursors.
    pub(super) fn write_release(
        &self,
        standing: &LockStanding,
        written: Option<Lsn>,
    ) -> Vec<Lsn> {
        if self.locker.is_transactional() || self.retain_non_txn_locks {
            return Vec::new();
        }
        standing.newly_locked().into_iter().chain(written).collect()
    }

    fn write_release_new(&self, written: Lsn) -> Vec<Lsn> {
        if self.locker.is_transactional() || self.retain_non_txn_locks {
            return Vec::new();
        }
        vec![written]
    }

    /// Drop a walker and its lock after a failed write.
    pub(super) fn abandon(
        &self,
        mut leaf: LatchedLeaf,
        walker: &CursorPosition,
        standing: &LockStanding,
    ) {
        leaf.cursors_mut().deregister(walker.id());
        drop(leaf);
        standing.revert(&self.locker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CursorConfig, DatabaseConfig, EnvConfig};
    use crate::cursor::ReadMode;
    use crate::env::Environment;
    use crate::hooks::{FaultPoint, HookOutcome};
    use crate::locker::Isolation;

    fn env() -> Environment {
        Environment::open(EnvConfig {
            leaf_capacity: 4,
            internal_capacity: 4,
            lock_timeout_ms: 0,
            max_key_len: 16,
            ..EnvConfig::default()
        })
    }

    #[test]
    fn test_put_no_overwrite_reports_existing() {
        let env = env();
        let db = env.open_database("a", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();

        let first = cursor.put(b"k", b"one", PutMode::NoOverwrite).unwrap();
        assert!(matches!(first, PutOutcome::Inserted(_)));
        assert_eq!(
            cursor.put(b"k", b"two", PutMode::NoOverwrite).unwrap(),
            PutOutcome::KeyExists
        );
        let record = cursor.current(ReadMode::Default).unwrap().unwrap();
        assert_eq!(&*record.value.unwrap(), b"one");

        let updated = cursor.put(b"k", b"two", PutMode::Overwrite).unwrap();
        assert!(matches!(updated, PutOutcome::Updated(v) if v.lsn > record.version.lsn));
        assert_eq!(&*db.get(&locker, b"k").unwrap().unwrap(), b"two");
    }

    #[test]
    fn test_key_too_large() {
        let env = env();
        let db = env.open_database("a", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        let err = db.put(&locker, &[7; 17], b"v").unwrap_err();
        assert_eq!(err, StoreError::KeyTooLarge { len: 17, max: 16 });
    }

    #[test]
    fn test_failed_insert_leaves_known_deleted_slot() {
        let env = env();
        let db = env.open_database("a", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        env.hooks().set(FaultPoint::BeforeLogWrite, || {
            HookOutcome::Fail("disk full".into())
        });
        let err = db.put(&locker, b"k", b"v").unwrap_err();
        assert!(matches!(err, StoreError::Durability { .. }));
        assert!(env.is_valid());

        let stats = db.leaf_stats().unwrap();
        assert_eq!(stats.slot_count, 1);
        assert_eq!(stats.defunct_count, 1);
        assert_eq!(stats.cursor_count, 0);
        assert!(db.get(&locker, b"k").unwrap().is_none());

        env.hooks().clear(FaultPoint::BeforeLogWrite);
        assert!(matches!(
            db.put(&locker, b"k", b"v").unwrap(),
            PutOutcome::Inserted(_)
        ));
        assert_eq!(db.leaf_stats().unwrap().slot_count, 1);
    }

    #[test]
    fn test_aborted_insert_slot_is_reused() {
        let env = env();
        let db = env.open_database("a", DatabaseConfig::default()).unwrap();
        let txn = env.begin_txn(Isolation::RepeatableRead).unwrap();
        db.put(&txn, b"k", b"v").unwrap();
        txn.abort().unwrap();

        let locker = env.non_txn_locker().unwrap();
        assert!(db.get(&locker, b"k").unwrap().is_none());
        let outcome = db.put_no_overwrite(&locker, b"k", b"again").unwrap();
        assert!(matches!(outcome, PutOutcome::Inserted(_)));
        assert_eq!(&*db.get(&locker, b"k").unwrap().unwrap(), b"again");
        assert_eq!(db.leaf_stats().unwrap().slot_count, 1);
    }

    #[test]
    fn test_partial_insert_is_zero_filled() {
        let env = env();
        let db = env.open_database("a", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        cursor
            .put_with(
                b"k",
                NewValue::Partial {
                    offset: 2,
                    data: b"xy",
                },
                PutMode::Overwrite,
                None,
            )
            .unwrap();
        let record = cursor.current(ReadMode::Default).unwrap().unwrap();
        assert_eq!(&*record.value.unwrap(), b"\0\0xy");
    }

    #[test]
    fn test_oversized_partial_write_is_rejected() {
        let env = Environment::open(EnvConfig {
            max_value_len: 8,
            ..EnvConfig::default()
        });
        let db = env.open_database("a", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();

        let err = cursor
            .put_with(
                b"k",
                NewValue::Partial {
                    offset: usize::MAX,
                    data: b"x",
                },
                PutMode::Overwrite,
                None,
            )
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::ValueTooLarge {
                len: usize::MAX,
                max: 8
            }
        );
        assert!(env.is_valid());
        assert!(db.get(&locker, b"k").unwrap().is_none());

        cursor.put(b"k", b"v", PutMode::Overwrite).unwrap();
        let err = cursor
            .update_current(
                NewValue::Partial {
                    offset: 8,
                    data: b"x",
                },
                false,
            )
            .unwrap_err();
        assert_eq!(err, StoreError::ValueTooLarge { len: 9, max: 8 });
        assert_eq!(&*db.get(&locker, b"k").unwrap().unwrap(), b"v");
    }
}
