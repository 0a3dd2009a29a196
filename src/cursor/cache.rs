//! Cache-mode glue between cursor operations and the evictor.

use std::sync::Arc;

use crate::arena::NodeId;
use crate::evictor::{CacheMode, EvictOutcome};
use crate::leaf::{LeafBody, LeafNode};
use crate::tracing_helpers::{trace_log, warn_log};
use crate::tree::Tree;

use super::Cursor;

impl Cursor {
    /// Run a critical eviction pass if memory is short.
    ///
    /// Skipped for [`CacheMode::Unchanged`] operations that dirtied nothing.
    pub(super) fn critical_eviction(&self, dirties: bool) {
        if self.cache_mode == CacheMode::Unchanged && !dirties {
            return;
        }
        let reclaimed = self.db.environment().evictor().trigger_critical();
        if reclaimed > 0 {
            trace_log!(reclaimed, "critical eviction");
        }
    }

    pub(super) fn note_access(&self, leaf: &Arc<LeafNode>) {
        self.db
            .environment()
            .evictor()
            .note_access(leaf, self.cache_mode);
    }

    /// Drop the value just read or written, if the mode asks for it.
    pub(super) fn evict_value_after(&self, leaf: &mut LeafBody, idx: usize) {
        if self.cache_mode.evicts_value() {
            self.db.environment().evictor().evict_value(leaf, idx);
        }
    }

    /// Evict the leaf the cursor just left, under [`CacheMode::EvictLeaf`].
    ///
    /// Called with no latch held, once per move to a different leaf.
    pub(super) fn evict_prior_leaf(&self, tree: &Tree, id: NodeId) {
        if self.cache_mode != CacheMode::EvictLeaf {
            return;
        }
        let Ok(mut leaf) = tree.latch_leaf(id) else {
            // Pruned since the cursor left it.
            return;
        };
        let node = Arc::clone(leaf.node());
        match self.db.environment().evictor().evict_leaf(&node, &mut leaf) {
            Ok(EvictOutcome::Skipped) => {
                trace_log!(leaf = %id, "prior leaf still in use");
            }
            Ok(_) => {}
            Err(_err) => {
                warn_log!(leaf = %id, err = %_err, "evicting prior leaf failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CursorConfig, DatabaseConfig, EnvConfig};
    use crate::cursor::ReadMode;
    use crate::env::Environment;
    use crate::evictor::CacheMode;

    fn key(i: u32) -> Vec<u8> {
        format!("k{i:04}").into_bytes()
    }

    #[test]
    fn test_evict_value_mode_drops_cached_values() {
        let env = Environment::open(EnvConfig {
            leaf_capacity: 8,
            max_embedded_value: 0,
            ..EnvConfig::default()
        });
        let db = env.open_database("c", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        for i in 0..4 {
            db.put(&locker, &key(i), b"a value that is not embedded").unwrap();
        }

        let config = CursorConfig {
            cache_mode: Some(CacheMode::EvictValue),
            ..CursorConfig::default()
        };
        let mut cursor = db.open_cursor(&locker, config).unwrap();
        let record = cursor.first(ReadMode::Default).unwrap().unwrap();
        assert_eq!(&*record.value.unwrap(), b"a value that is not embedded");
        assert!(env.evictor_stats().values_evicted >= 1);

        // Still readable: the value comes back from the log.
        let again = cursor.current(ReadMode::Default).unwrap().unwrap();
        assert_eq!(&*again.value.unwrap(), b"a value that is not embedded");
    }

    #[test]
    fn test_evict_leaf_mode_evicts_left_leaves() {
        let env = Environment::open(EnvConfig {
            leaf_capacity: 4,
            internal_capacity: 4,
            ..EnvConfig::default()
        });
        let db = env.open_database("c", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        for i in 0..24 {
            db.put(&locker, &key(i), b"v").unwrap();
        }

        let config = CursorConfig {
            cache_mode: Some(CacheMode::EvictLeaf),
            ..CursorConfig::default()
        };
        let mut cursor = db.open_cursor(&locker, config).unwrap();
        let mut seen = 0;
        while cursor.next(ReadMode::Default).unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 24);
        let stats = db.leaf_stats().unwrap();
        assert!(stats.delta_leaves + stats.evicted_leaves > 0);

        // Evicted leaves are transparently re-read.
        cursor.reset();
        let mut again = 0;
        while cursor.next(ReadMode::Default).unwrap().is_some() {
            again += 1;
        }
        assert_eq!(again, 24);
    }
}
