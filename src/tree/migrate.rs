//! Record migration: re-writing an unchanged record at a new locator.
//!
//! Lock identity is the locator, so moving a record must move its locks.
//! Every owner of the old locator is granted the same mode on the new one
//! while the leaf is latched, and only then are the old locks released. No
//! reader can observe the new locator without also finding it locked by
//! whoever held the old one.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::hooks::FaultPoint;
use crate::lock::{LockMode, LockerId};
use crate::log::{LogEntry, LogEntryKind};
use crate::lsn::Lsn;
use crate::tracing_helpers::debug_log;

use super::Tree;

impl Tree {
    /// Move the record at `key` to a new locator.
    ///
    /// Returns the new locator, or `None` when there is no record to move
    /// (absent key, never-written or known-deleted slot).
    ///
    /// # Errors
    /// Log failures; the slot and its locks are unchanged.
    pub fn migrate_record(&self, key: &[u8]) -> Result<Option<Lsn>> {
        let mut leaf = self.search_for_read(key)?;
        let Ok(idx) = leaf.search(key) else {
            return Ok(None);
        };
        let slot = leaf.slot(idx);
        let old_lsn = slot.lsn();
        if old_lsn.is_null() || slot.is_known_deleted() {
            return Ok(None);
        }

        let cached: Option<Arc<[u8]>> = slot.data().bytes().cloned();
        let value: Option<Arc<[u8]>> = match &cached {
            Some(bytes) => Some(Arc::clone(bytes)),
            None => self.ctx.log.read_value(old_lsn)?,
        };
        let expiration = slot.expiration();
        let modified_at = slot.modified_at();

        self.hooks().check(FaultPoint::BeforeLogWrite)?;
        let logged = self.ctx.log.write_version(&LogEntry {
            kind: LogEntryKind::Migrate,
            database: self.database,
            key,
            value: value.as_deref(),
            prior: old_lsn,
            txn: None,
            expiration,
        })?;

        let owners: Vec<(LockerId, LockMode)> = self.ctx.locks.owners_of(old_lsn);
        self.ctx.locks.grant_migrated(old_lsn, logged.lsn, &owners);

        let delta = leaf.slot_mut(idx).install_version(
            logged.lsn,
            cached,
            self.config.max_embedded_value,
            logged.size,
            modified_at,
        );
        self.ctx.budget.charge(delta);

        for &(owner, _) in &owners {
            self.ctx.locks.release(old_lsn, owner);
        }
        drop(leaf);

        self.counters.migrations.fetch_add(1, Ordering::Relaxed);
        debug_log!(%old_lsn, new_lsn = %logged.lsn, owners = owners.len(), "record migrated");
        Ok(Some(logged.lsn))
    }
}
