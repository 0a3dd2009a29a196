//! Rolling back a transactional write.

use crate::error::Result;
use crate::lock::{LockMode, LockerId};
use crate::locker::UndoDescriptor;
use crate::lsn::Lsn;
use crate::tracing_helpers::trace_log;

use super::Tree;

impl Tree {
    /// Restore the slot for `key` to the state captured in `undo`.
    ///
    /// The slot must still carry the write's locator `new_lsn`, or a
    /// locator `locker` holds write-locked (the record was migrated since
    /// the write). Anything else means a later committed write replaced it,
    /// which the write lock rules out, so the slot is left alone.
    ///
    /// # Errors
    /// Navigation failures.
    pub(crate) fn undo_write(
        &self,
        key: &[u8],
        new_lsn: Lsn,
        locker: LockerId,
        undo: &UndoDescriptor,
    ) -> Result<()> {
        let mut leaf = self.search_for_read(key)?;
        let Ok(idx) = leaf.search(key) else {
            trace_log!(%new_lsn, "undo target slot is gone");
            return Ok(());
        };
        let current = leaf.slot(idx).lsn();
        let ours = current == new_lsn
            || self.ctx.locks.owner_mode(current, locker) == Some(LockMode::Write);
        if !ours {
            trace_log!(%new_lsn, %current, "undo target was overwritten");
            return Ok(());
        }

        let max_embedded = self.config.max_embedded_value;
        let slot = leaf.slot_mut(idx);
        slot.set_lsn(undo.abort_lsn());
        slot.restore_flags(
            undo.abort_known_deleted() || undo.abort_lsn().is_null(),
            undo.abort_pending_deleted(),
        );
        let delta = slot.set_data(undo.abort_data().cloned(), max_embedded);
        slot.set_expiration(undo.abort_expiration());
        self.ctx.budget.charge(delta);
        Ok(())
    }
}
