//! The latched B+tree of one database.
//!
//! A [`Tree`] owns the nodes of one database and implements the structural
//! side of the cursor protocol: latch-coupled descents, preemptive splits on
//! the insert path, neighbour-leaf lookups by fence key, compression of
//! defunct slots, pruning of empty leaves, record migration and undo.
//!
//! # Latch Order
//! root pointer, then parent before child. Siblings are only latched with
//! `try_latch` while their parent is held, except in [`Tree::prune_leaf`],
//! which holds the parent, so no cursor can be mid-way between the two
//! siblings it touches.
//!
//! # Locks
//! The tree never waits for a record lock. It consults the lock table only to
//! avoid compressing or delta-omitting locked slots, and to move lock
//! ownership during migration.

mod compress;
mod leaf_iterator;
mod migrate;
mod navigate;
mod split;
mod undo;

use std::fmt as StdFmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::arena::{Node, NodeArena, NodeId};
use crate::clock::Clock;
use crate::config::EnvConfig;
use crate::error::{Result, StoreError};
use crate::evictor::MemoryBudget;
use crate::hooks::Hooks;
use crate::latch::Latch;
use crate::leaf::{LeafBody, LeafGuard, LeafNode, Residency};
use crate::lock::LockTable;
use crate::log::LogWriter;

pub use compress::CompressStats;
pub use leaf_iterator::{LeafIterator, LeafStats};

// ============================================================================
//  LatchedLeaf
// ============================================================================

/// A leaf together with the proof that it is latched.
pub struct LatchedLeaf {
    node: Arc<LeafNode>,
    guard: LeafGuard,
}

impl LatchedLeaf {
    pub(crate) fn latch(node: Arc<LeafNode>, slow: Duration) -> Self {
        let guard = node.latch().latch_timed(slow);
        Self { node, guard }
    }

    pub(crate) fn try_latch(node: Arc<LeafNode>) -> Option<Self> {
        let guard = node.latch().try_latch()?;
        Some(Self { node, guard })
    }

    /// The leaf node.
    #[must_use]
    pub const fn node(&self) -> &Arc<LeafNode> {
        &self.node
    }

    /// Leaf id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// Release the latch, keeping the node reference.
    pub fn unlatch(self) -> Arc<LeafNode> {
        drop(self.guard);
        self.node
    }
}

impl Deref for LatchedLeaf {
    type Target = LeafBody;

    fn deref(&self) -> &LeafBody {
        &self.guard
    }
}

impl DerefMut for LatchedLeaf {
    fn deref_mut(&mut self) -> &mut LeafBody {
        &mut self.guard
    }
}

impl StdFmt::Debug for LatchedLeaf {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("LatchedLeaf")
            .field("id", &self.node.id())
            .field("slots", &self.guard.len())
            .field("residency", &self.guard.residency())
            .finish()
    }
}

// ============================================================================
//  Tree
// ============================================================================

/// Node sizing and latch diagnostics for one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Slots per leaf before a split.
    pub leaf_capacity: usize,
    /// Children per internal node before a split.
    pub internal_capacity: usize,
    /// Values up to this size are embedded.
    pub max_embedded_value: usize,
    /// Latch waits beyond this are logged.
    pub slow_latch: Duration,
}

impl From<&EnvConfig> for TreeConfig {
    fn from(config: &EnvConfig) -> Self {
        Self {
            leaf_capacity: config.leaf_capacity,
            internal_capacity: config.internal_capacity,
            max_embedded_value: config.max_embedded_value,
            slow_latch: config.slow_latch_threshold(),
        }
    }
}

/// Structural counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Leaf splits.
    pub leaf_splits: u64,
    /// Internal node splits, root growth included.
    pub internal_splits: u64,
    /// Empty leaves removed.
    pub prunes: u64,
    /// Defunct slots removed.
    pub slots_compressed: u64,
    /// Delta or evicted leaves brought back to full.
    pub fetches: u64,
    /// Records moved to a new locator.
    pub migrations: u64,
}

#[derive(Debug, Default)]
struct TreeCounters {
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    prunes: AtomicU64,
    slots_compressed: AtomicU64,
    fetches: AtomicU64,
    migrations: AtomicU64,
}

/// Shared collaborators a tree needs.
#[derive(Debug, Clone)]
pub struct TreeContext {
    /// Log for versions and leaf images.
    pub log: Arc<dyn LogWriter>,
    /// Environment lock table.
    pub locks: Arc<LockTable>,
    /// Cache accounting.
    pub budget: Arc<dyn MemoryBudget>,
    /// Fault points.
    pub hooks: Arc<Hooks>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// One database's B+tree.
pub struct Tree {
    database: u32,
    config: TreeConfig,
    arena: NodeArena,
    root: Latch<NodeId>,
    ctx: TreeContext,
    counters: TreeCounters,
}

impl StdFmt::Debug for Tree {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Tree")
            .field("database", &self.database)
            .field("config", &self.config)
            .field("arena", &self.arena)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Tree {
    /// An empty tree: a single empty root leaf.
    #[must_use]
    pub fn new(database: u32, config: TreeConfig, ctx: TreeContext) -> Self {
        let arena = NodeArena::new();
        let root_id = arena.reserve();
        arena.install_leaf(Arc::new(LeafNode::new(root_id, LeafBody::empty_root())));
        Self {
            database,
            config,
            arena,
            root: Latch::new(root_id),
            ctx,
            counters: TreeCounters::default(),
        }
    }

    /// Owning database id.
    #[must_use]
    pub const fn database(&self) -> u32 {
        self.database
    }

    /// Sizing.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Collaborators.
    #[must_use]
    pub const fn context(&self) -> &TreeContext {
        &self.ctx
    }

    /// Fault points.
    #[must_use]
    pub fn hooks(&self) -> &Hooks {
        &self.ctx.hooks
    }

    /// Node storage.
    #[must_use]
    pub const fn arena(&self) -> &NodeArena {
        &self.arena
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let c = &self.counters;
        TreeStats {
            leaf_splits: c.leaf_splits.load(Ordering::Relaxed),
            internal_splits: c.internal_splits.load(Ordering::Relaxed),
            prunes: c.prunes.load(Ordering::Relaxed),
            slots_compressed: c.slots_compressed.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            migrations: c.migrations.load(Ordering::Relaxed),
        }
    }

    /// Tree height: 1 for a lone root leaf.
    #[must_use]
    pub fn height(&self) -> usize {
        let root_id = *self.root.latch();
        match self.arena.get(root_id) {
            Some(Node::Internal(node)) => usize::from(node.latch().latch().level()) + 1,
            _ => 1,
        }
    }

    pub(crate) fn resolve(&self, id: NodeId) -> Result<Node> {
        self.arena
            .get(id)
            .ok_or_else(|| StoreError::unexpected(format!("node {id} missing from arena")))
    }

    /// Latch a leaf by id.
    pub(crate) fn latch_leaf(&self, id: NodeId) -> Result<LatchedLeaf> {
        let node = self
            .arena
            .leaf(id)
            .ok_or_else(|| StoreError::unexpected(format!("leaf {id} missing from arena")))?;
        Ok(LatchedLeaf::latch(node, self.config.slow_latch))
    }

    /// Bring a delta or evicted leaf back to full residency.
    pub(crate) fn ensure_full(&self, leaf: &mut LeafBody) -> Result<()> {
        if leaf.residency() == Residency::Full {
            return Ok(());
        }
        let Some(image) = leaf.full_image() else {
            return Err(StoreError::unexpected(
                "non-resident leaf without a logged full image",
            ));
        };
        let slots = self.ctx.log.read_leaf_image(image.lsn())?;
        leaf.restore_full(slots);
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clock::ManualClock;
    use crate::evictor::CacheBudget;
    use crate::log::MemLog;
    use crate::lsn::Lsn;
    use crate::slot::Slot;

    pub(crate) fn tree(leaf_capacity: usize) -> Tree {
        let ctx = TreeContext {
            log: Arc::new(MemLog::new()),
            locks: Arc::new(LockTable::new()),
            budget: Arc::new(CacheBudget::new(u64::MAX)),
            hooks: Arc::new(Hooks::new()),
            clock: Arc::new(ManualClock::new(0)),
        };
        Tree::new(
            0,
            TreeConfig {
                leaf_capacity,
                internal_capacity: 4,
                max_embedded_value: 16,
                slow_latch: Duration::from_secs(1),
            },
            ctx,
        )
    }

    /// Insert a live slot for `key` directly, bypassing locking and logging.
    pub(crate) fn put_raw(tree: &Tree, key: &[u8], lsn: u64) {
        let mut leaf = tree.search_for_insert(key).unwrap();
        match leaf.search(key) {
            Ok(idx) => leaf.slot_mut(idx).set_lsn(Lsn::from_raw(lsn)),
            Err(idx) => {
                let mut slot = Slot::new(key);
                slot.set_lsn(Lsn::from_raw(lsn));
                leaf.insert_slot(idx, slot);
            }
        }
    }

    pub(crate) fn key(i: u32) -> Vec<u8> {
        format!("k{i:05}").into_bytes()
    }
}
