//! Database handles.
//!
//! A [`Database`] is one named tree inside an [`Environment`]. Handles are
//! cheap to clone; every handle for the same name shares one tree.
//!
//! The convenience methods ([`Database::get`], [`Database::put`],
//! [`Database::delete`]) open a short-lived cursor under the given locker,
//! so their locks follow the usual cursor rules: a non-transactional
//! locker's locks are gone when the call returns, a transaction keeps them.

use std::fmt as StdFmt;
use std::sync::Arc;

use crate::config::{CursorConfig, DatabaseConfig};
use crate::cursor::{Cursor, DeleteOutcome, PutMode, PutOutcome, ReadMode};
use crate::env::Environment;
use crate::error::Result;
use crate::locker::Locker;
use crate::lsn::Lsn;
use crate::tree::{CompressStats, LeafStats, Tree, TreeStats};

/// State shared by every handle of one database.
pub(crate) struct DbShared {
    id: u32,
    name: String,
    config: DatabaseConfig,
    tree: Arc<Tree>,
}

impl DbShared {
    pub(crate) fn new(id: u32, name: &str, config: DatabaseConfig, tree: Arc<Tree>) -> Self {
        Self {
            id,
            name: name.to_owned(),
            config,
            tree,
        }
    }
}

/// Handle to one database.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DbShared>,
    env: Environment,
}

impl StdFmt::Debug for Database {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Database")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Database {
    pub(crate) const fn new(shared: Arc<DbShared>, env: Environment) -> Self {
        Self { shared, env }
    }

    /// Database id, unique within the environment.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Settings the database was created with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.shared.config
    }

    /// Owning environment.
    #[must_use]
    pub const fn environment(&self) -> &Environment {
        &self.env
    }

    /// The underlying tree.
    #[must_use]
    pub fn tree(&self) -> &Arc<Tree> {
        &self.shared.tree
    }

    // ========================================================================
    //  Cursors and record operations
    // ========================================================================

    /// Open a cursor whose locks are owned by `locker`.
    ///
    /// # Errors
    /// - [`StoreError::EnvironmentInvalid`](crate::StoreError::EnvironmentInvalid)
    /// - [`StoreError::LockerInactive`](crate::StoreError::LockerInactive) if the
    ///   transaction already ended
    pub fn open_cursor(&self, locker: &Arc<Locker>, config: CursorConfig) -> Result<Cursor> {
        self.env.check_valid()?;
        locker.check_active()?;
        Ok(Cursor::new(self.clone(), Arc::clone(locker), config))
    }

    /// Value of `key` under the locker's default isolation.
    ///
    /// # Errors
    /// Lock conflicts, timeouts and interruption.
    pub fn get(&self, locker: &Arc<Locker>, key: &[u8]) -> Result<Option<Arc<[u8]>>> {
        let mut cursor = self.open_cursor(locker, CursorConfig::default())?;
        Ok(cursor
            .search(key, ReadMode::Default)?
            .and_then(|record| record.value))
    }

    /// Insert or overwrite `key`.
    ///
    /// # Errors
    /// Lock conflicts, durability failures, [`StoreError::KeyTooLarge`](crate::StoreError::KeyTooLarge).
    pub fn put(&self, locker: &Arc<Locker>, key: &[u8], value: &[u8]) -> Result<PutOutcome> {
        let mut cursor = self.open_cursor(locker, CursorConfig::default())?;
        cursor.put(key, value, PutMode::Overwrite)
    }

    /// Insert `key` only if it has no live record.
    ///
    /// # Errors
    /// As for [`Database::put`].
    pub fn put_no_overwrite(
        &self,
        locker: &Arc<Locker>,
        key: &[u8],
        value: &[u8],
    ) -> Result<PutOutcome> {
        let mut cursor = self.open_cursor(locker, CursorConfig::default())?;
        cursor.put(key, value, PutMode::NoOverwrite)
    }

    /// Delete `key`.
    ///
    /// A non-transactional delete on a database that allows blind deletion
    /// is applied to a leaf delta directly when the key is not in it.
    ///
    /// # Errors
    /// Lock conflicts and durability failures.
    pub fn delete(&self, locker: &Arc<Locker>, key: &[u8]) -> Result<DeleteOutcome> {
        let mut cursor = self.open_cursor(locker, CursorConfig::default())?;
        if let Some(outcome) = cursor.blind_delete(key)? {
            return Ok(outcome);
        }
        match cursor.search(key, ReadMode::Rmw)? {
            Some(_) => cursor.delete_current(),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    // ========================================================================
    //  Maintenance
    // ========================================================================

    /// Remove defunct slots and prune empty leaves.
    ///
    /// # Errors
    /// Log failures fetching non-resident leaves.
    pub fn compress(&self) -> Result<CompressStats> {
        self.env.check_valid()?;
        self.env.observe(self.shared.tree.compress())
    }

    /// Rewrite the record at `key` at a new locator, carrying its locks.
    ///
    /// # Errors
    /// Log failures; the record is unchanged.
    pub fn migrate_record(&self, key: &[u8]) -> Result<Option<Lsn>> {
        self.env.check_valid()?;
        self.env.observe(self.shared.tree.migrate_record(key))
    }

    /// Leaf-level statistics.
    ///
    /// # Errors
    /// Tree inconsistencies.
    pub fn leaf_stats(&self) -> Result<LeafStats> {
        self.env.observe(self.shared.tree.leaf_stats())
    }

    /// Structural counters.
    #[must_use]
    pub fn tree_stats(&self) -> TreeStats {
        self.shared.tree.stats()
    }

    /// Check key order and fence continuity across all leaves.
    ///
    /// # Errors
    /// [`StoreError::UnexpectedState`](crate::StoreError::UnexpectedState)
    /// describing the first violation.
    pub fn verify(&self) -> Result<()> {
        self.env.observe(self.shared.tree.verify_order())
    }
}
