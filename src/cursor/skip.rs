//! Counting scans that take no locks.
//!
//! [`Cursor::skip`] walks slots with dirty-read semantics and counts the
//! live ones. The walk is anchored by the last key it passed rather than by
//! a registered position, so the caller's cursor is only moved once, onto
//! the last live record counted.
//!
//! At a leaf end the walk first tries the siblings under the same parent:
//! with the parent latched, each sibling is taken with a non-blocking latch
//! and scanned in place. A contended or non-resident sibling ends that and
//! the walk falls back to a full descent from the boundary key.

use std::ops::Range;
use std::sync::Arc;

use crate::arena::NodeId;
use crate::cancel::CancellationToken;
use crate::error::{Result, StoreError};
use crate::hooks::FaultPoint;
use crate::leaf::{LeafBody, Residency};
use crate::lsn::RecordVersion;
use crate::slot::Slot;
use crate::tracing_helpers::{debug_log, trace_log};
use crate::tree::{LatchedLeaf, Tree};

use super::{Anchor, Cursor, CursorState, Direction};

/// Why a skip stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipStop {
    /// `max_count` live records were counted.
    MaxCount,
    /// The bounds predicate rejected a live key.
    OutOfBounds,
    /// No more records in the direction of travel.
    EndOfData,
    /// The locker was interrupted at a leaf boundary.
    Interrupted,
}

/// Result of [`Cursor::skip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipOutcome {
    /// Live records counted.
    pub skipped: u64,
    /// Why the walk ended.
    pub stop: SkipStop,
}

/// Slots of one leaf a scan visits, in index order.
fn span(direction: Direction, len: usize, start: usize, inclusive: bool) -> Range<usize> {
    match direction {
        Direction::Forward => {
            let from = if inclusive { start } else { start + 1 };
            from.min(len)..len
        }
        Direction::Backward => {
            let to = if inclusive { start + 1 } else { start };
            0..to.min(len)
        }
    }
}

struct Scan<F> {
    direction: Direction,
    max_count: u64,
    in_bounds: F,
    skipped: u64,
    last_live: Option<Vec<u8>>,
    /// Key of the last slot passed, live or not.
    boundary: Vec<u8>,
}

impl<F: FnMut(&[u8]) -> bool> Scan<F> {
    fn leaf(
        &mut self,
        cursor: &Cursor,
        tree: &Tree,
        leaf: &LeafBody,
        mut span: Range<usize>,
    ) -> Option<SkipStop> {
        let direction = self.direction;
        let edge = (!span.is_empty()).then(|| match direction {
            Direction::Forward => span.end - 1,
            Direction::Backward => span.start,
        });
        let stop = match direction {
            Direction::Forward => span.find_map(|idx| self.visit(cursor, tree, leaf.slot(idx))),
            Direction::Backward => span.rev().find_map(|idx| self.visit(cursor, tree, leaf.slot(idx))),
        };
        if stop.is_none()
            && let Some(edge) = edge
        {
            self.boundary = leaf.slot(edge).key().to_vec();
        }
        stop
    }

    fn visit(&mut self, cursor: &Cursor, tree: &Tree, slot: &Slot) -> Option<SkipStop> {
        if cursor.is_defunct(tree, slot) {
            return None;
        }
        if !(self.in_bounds)(slot.key()) {
            return Some(SkipStop::OutOfBounds);
        }
        self.skipped += 1;
        self.last_live = Some(slot.key().to_vec());
        (self.max_count > 0 && self.skipped >= self.max_count).then_some(SkipStop::MaxCount)
    }
}

impl Cursor {
    /// Count live records in `direction` without locking them.
    ///
    /// An unpositioned cursor starts at the first (or last) record and
    /// counts it; a positioned one starts past its current record.
    /// `max_count == 0` means no limit. `in_bounds` sees every live key
    /// before it is counted and stops the walk by returning `false`.
    ///
    /// The cursor ends on the last record counted, or where it was if
    /// nothing was counted. Interruption is reported as
    /// [`SkipStop::Interrupted`], not as an error.
    ///
    /// # Errors
    /// [`StoreError::CursorClosed`], tree inconsistencies and log failures
    /// while re-reading an evicted leaf.
    pub fn skip<F>(&mut self, direction: Direction, max_count: u64, in_bounds: F) -> Result<SkipOutcome>
    where
        F: FnMut(&[u8]) -> bool,
    {
        self.run(false, |cursor| {
            let tree = Arc::clone(cursor.db.tree());
            let (leaf, span) = match &cursor.state {
                CursorState::Initialized(anchor) => {
                    let position = Arc::clone(&anchor.position);
                    let leaf = cursor.latch_position(&tree, &position)?;
                    let span = span(direction, leaf.len(), position.index(), false);
                    (leaf, span)
                }
                CursorState::Uninitialized => {
                    let start = match direction {
                        Direction::Forward => tree.first_position()?,
                        Direction::Backward => tree.last_position()?,
                    };
                    let Some((leaf, idx)) = start else {
                        return Ok(SkipOutcome {
                            skipped: 0,
                            stop: SkipStop::EndOfData,
                        });
                    };
                    let span = span(direction, leaf.len(), idx, true);
                    (leaf, span)
                }
                CursorState::Closed => return Err(StoreError::CursorClosed),
            };
            let boundary = match direction {
                Direction::Forward => span.start.checked_sub(1),
                Direction::Backward => Some(span.end),
            }
            .filter(|&idx| idx < leaf.len())
            .map(|idx| leaf.slot(idx).key().to_vec())
            .unwrap_or_default();

            let mut scan = Scan {
                direction,
                max_count,
                in_bounds,
                skipped: 0,
                last_live: None,
                boundary,
            };
            let stop = cursor.skip_leaves(&tree, leaf, span, &mut scan)?;
            if let Some(key) = scan.last_live.take() {
                cursor.reposition_on(&tree, &key)?;
            }
            debug_log!(skipped = scan.skipped, ?stop, "skip finished");
            Ok(SkipOutcome {
                skipped: scan.skipped,
                stop,
            })
        })
    }

    fn skip_leaves<F: FnMut(&[u8]) -> bool>(
        &self,
        tree: &Tree,
        mut leaf: LatchedLeaf,
        mut span: Range<usize>,
        scan: &mut Scan<F>,
    ) -> Result<SkipStop> {
        let token = self.locker.cancellation_token();
        loop {
            if let Some(stop) = scan.leaf(self, tree, &leaf, span) {
                return Ok(stop);
            }
            let from = leaf.id();
            drop(leaf);

            tree.hooks().check(FaultPoint::LeafBoundary)?;
            if token.is_cancelled() {
                return Ok(SkipStop::Interrupted);
            }
            if let Some(stop) = self.walk_siblings(tree, from, scan, &token)? {
                return Ok(stop);
            }

            let found = match scan.direction {
                Direction::Forward => tree.next_leaf(&scan.boundary)?,
                Direction::Backward => tree.prev_leaf(&scan.boundary)?,
            };
            let Some((next, idx)) = found else {
                return Ok(SkipStop::EndOfData);
            };
            span = self::span(scan.direction, next.len(), idx, true);
            leaf = next;
        }
    }

    /// Scan the siblings of `leaf_id` under their parent's latch.
    ///
    /// `None` when the walk must continue by descent: the parent could not
    /// be found, the siblings ran out, or one of them was contended or not
    /// fully resident.
    fn walk_siblings<F: FnMut(&[u8]) -> bool>(
        &self,
        tree: &Tree,
        leaf_id: NodeId,
        scan: &mut Scan<F>,
        token: &CancellationToken,
    ) -> Result<Option<SkipStop>> {
        let Some((_parent, guard, mut at)) = tree.parent_of(leaf_id, &scan.boundary)? else {
            return Ok(None);
        };
        loop {
            let next = match scan.direction {
                Direction::Forward => (at + 1 < guard.len()).then_some(at + 1),
                Direction::Backward => at.checked_sub(1),
            };
            let Some(next) = next else {
                return Ok(None);
            };
            at = next;
            let Some(node) = tree.arena().leaf(guard.child(at)) else {
                return Ok(None);
            };
            let Some(sibling) = LatchedLeaf::try_latch(node) else {
                trace_log!(leaf = %guard.child(at), "sibling contended; descending");
                return Ok(None);
            };
            if sibling.residency() != Residency::Full {
                return Ok(None);
            }
            if token.is_cancelled() {
                return Ok(Some(SkipStop::Interrupted));
            }
            let len = sibling.len();
            if let Some(stop) = scan.leaf(self, tree, &sibling, 0..len) {
                return Ok(Some(stop));
            }
        }
    }

    /// Make the live record at `key` the cursor's position.
    fn reposition_on(&mut self, tree: &Arc<Tree>, key: &[u8]) -> Result<()> {
        let mut leaf = tree.search_for_read(key)?;
        let Ok(idx) = leaf.search(key) else {
            // Compressed away after it was counted.
            debug_log!("skip target vanished; cursor left in place");
            return Ok(());
        };
        let position = self.new_position();
        let id = leaf.id();
        leaf.cursors_mut().register(&position, id, idx);
        let version = RecordVersion::unsequenced(leaf.slot(idx).lsn());
        self.install_anchor(
            tree,
            leaf,
            Anchor {
                position,
                version,
                release_on_move: Vec::new(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CursorConfig, DatabaseConfig, EnvConfig};
    use crate::cursor::{CursorStatus, ReadMode};
    use crate::database::Database;
    use crate::env::Environment;
    use crate::locker::Locker;

    fn key(i: u32) -> Vec<u8> {
        format!("k{i:04}").into_bytes()
    }

    fn setup(n: u32) -> (Environment, Database, Arc<Locker>) {
        let env = Environment::open(EnvConfig {
            leaf_capacity: 4,
            internal_capacity: 4,
            ..EnvConfig::default()
        });
        let db = env.open_database("skip", DatabaseConfig::default()).unwrap();
        let locker = env.non_txn_locker().unwrap();
        for i in 0..n {
            db.put(&locker, &key(i), b"v").unwrap();
        }
        (env, db, locker)
    }

    #[test]
    fn test_span_bounds() {
        assert_eq!(span(Direction::Forward, 4, 1, true), 1..4);
        assert_eq!(span(Direction::Forward, 4, 3, false), 4..4);
        assert_eq!(span(Direction::Backward, 4, 2, true), 0..3);
        assert_eq!(span(Direction::Backward, 4, 0, false), 0..0);
    }

    #[test]
    fn test_skip_counts_live_records_only() {
        let (_env, db, locker) = setup(7);
        // Five live, two defunct, interleaved.
        db.delete(&locker, &key(1)).unwrap();
        db.delete(&locker, &key(4)).unwrap();

        let mut seen = Vec::new();
        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        let outcome = cursor
            .skip(Direction::Forward, 3, |k| {
                seen.push(k.to_vec());
                true
            })
            .unwrap();
        assert_eq!(outcome, SkipOutcome { skipped: 3, stop: SkipStop::MaxCount });
        assert_eq!(seen, vec![key(0), key(2), key(3)]);
        let record = cursor.current(ReadMode::Default).unwrap().unwrap();
        assert_eq!(record.key, key(3));
    }

    #[test]
    fn test_skip_from_position_excludes_current() {
        let (_env, db, locker) = setup(20);
        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        cursor.search(&key(5), ReadMode::Default).unwrap().unwrap();

        let outcome = cursor.skip(Direction::Forward, 0, |_| true).unwrap();
        assert_eq!(outcome, SkipOutcome { skipped: 14, stop: SkipStop::EndOfData });
        assert_eq!(cursor.current(ReadMode::Default).unwrap().unwrap().key, key(19));

        let outcome = cursor.skip(Direction::Backward, 0, |k| k >= key(10).as_slice()).unwrap();
        assert_eq!(outcome, SkipOutcome { skipped: 9, stop: SkipStop::OutOfBounds });
        assert_eq!(cursor.current(ReadMode::Default).unwrap().unwrap().key, key(10));
    }

    #[test]
    fn test_skip_matches_cursor_walk() {
        let (_env, db, locker) = setup(60);
        for i in (0..60).step_by(3) {
            db.delete(&locker, &key(i)).unwrap();
        }
        let mut walked = Vec::new();
        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        while let Some(record) = cursor.next(ReadMode::Default).unwrap() {
            walked.push(record.key);
        }

        let mut skipped = Vec::new();
        let mut skipper = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        let outcome = skipper
            .skip(Direction::Forward, 0, |k| {
                skipped.push(k.to_vec());
                true
            })
            .unwrap();
        assert_eq!(outcome.stop, SkipStop::EndOfData);
        assert_eq!(skipped, walked);
    }

    #[test]
    fn test_skip_on_empty_database() {
        let (_env, db, locker) = setup(0);
        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        let outcome = cursor.skip(Direction::Backward, 5, |_| true).unwrap();
        assert_eq!(outcome, SkipOutcome { skipped: 0, stop: SkipStop::EndOfData });
        assert_eq!(cursor.status(), CursorStatus::Uninitialized);
    }

    #[test]
    fn test_interrupted_skip_keeps_last_position() {
        let (_env, db, locker) = setup(40);
        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        locker.interrupt();
        let outcome = cursor.skip(Direction::Forward, 0, |_| true).unwrap();
        assert_eq!(outcome.stop, SkipStop::Interrupted);
        assert!(outcome.skipped >= 1 && outcome.skipped < 40);
        assert_eq!(cursor.status(), CursorStatus::Initialized);
        assert_eq!(db.leaf_stats().unwrap().cursor_count, 1);
    }
}
