//! Property-based tests for databases and cursors.
//!
//! Differential testing against a `BTreeMap` oracle: any sequence of puts,
//! deletes and compressions must leave a database whose cursor scan, point
//! lookups and skip counts all agree with the oracle.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use latchkv::{
    CursorConfig, Database, DeleteOutcome, Direction, EnvConfig, Isolation, Locker, PutOutcome,
    ReadMode, SkipStop,
};
use proptest::prelude::*;

// ============================================================================
//  Strategies
// ============================================================================

/// Keys over a small alphabet, so operations collide often.
fn small_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(b'a'..=b'f', 1..=3)
}

fn value() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=24)
}

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    PutNoOverwrite(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    Get(Vec<u8>),
    Compress,
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            4 => (small_key(), value()).prop_map(|(k, v)| Op::Put(k, v)),
            1 => (small_key(), value()).prop_map(|(k, v)| Op::PutNoOverwrite(k, v)),
            3 => small_key().prop_map(Op::Delete),
            2 => small_key().prop_map(Op::Get),
            1 => Just(Op::Compress),
        ],
        0..=max_ops,
    )
}

// ============================================================================
//  Helpers
// ============================================================================

fn scan(db: &Database, locker: &Arc<Locker>) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut cursor = db.open_cursor(locker, CursorConfig::default()).unwrap();
    let mut out = BTreeMap::new();
    while let Some(record) = cursor.next(ReadMode::Default).unwrap() {
        out.insert(record.key, record.value.unwrap().to_vec());
    }
    out
}

fn scan_backward(db: &Database, locker: &Arc<Locker>) -> Vec<Vec<u8>> {
    let mut cursor = db.open_cursor(locker, CursorConfig::default()).unwrap();
    let mut out = Vec::new();
    while let Some(record) = cursor.prev(ReadMode::Default).unwrap() {
        out.push(record.key);
    }
    out
}

fn apply(
    db: &Database,
    locker: &Arc<Locker>,
    oracle: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    op: &Op,
) -> Result<(), TestCaseError> {
    match op {
        Op::Put(k, v) => {
            let outcome = db.put(locker, k, v).unwrap();
            let existed = oracle.insert(k.clone(), v.clone()).is_some();
            prop_assert_eq!(existed, matches!(outcome, PutOutcome::Updated(_)));
        }
        Op::PutNoOverwrite(k, v) => {
            let outcome = db.put_no_overwrite(locker, k, v).unwrap();
            if oracle.contains_key(k) {
                prop_assert_eq!(outcome, PutOutcome::KeyExists);
            } else {
                prop_assert!(matches!(outcome, PutOutcome::Inserted(_)));
                oracle.insert(k.clone(), v.clone());
            }
        }
        Op::Delete(k) => {
            let outcome = db.delete(locker, k).unwrap();
            let existed = oracle.remove(k).is_some();
            prop_assert_eq!(existed, outcome != DeleteOutcome::NotFound);
        }
        Op::Get(k) => {
            let got = db.get(locker, k).unwrap().map(|v| v.to_vec());
            prop_assert_eq!(got.as_ref(), oracle.get(k));
        }
        Op::Compress => {
            db.compress().unwrap();
        }
    }
    Ok(())
}

// ============================================================================
//  Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any operation sequence agrees with the oracle, op by op and at the end.
    #[test]
    fn prop_matches_btreemap(ops in operations(120)) {
        let (env, db) = common::small_env("oracle");
        let locker = env.non_txn_locker().unwrap();
        let mut oracle = BTreeMap::new();

        for op in &ops {
            apply(&db, &locker, &mut oracle, op)?;
        }

        prop_assert_eq!(scan(&db, &locker), oracle.clone());
        let mut backward = scan_backward(&db, &locker);
        backward.reverse();
        prop_assert_eq!(backward, oracle.keys().cloned().collect::<Vec<_>>());
        db.verify().unwrap();
        prop_assert_eq!(db.leaf_stats().unwrap().cursor_count, 0);
    }

    /// Skip counts exactly the live records, whatever is left defunct.
    #[test]
    fn prop_skip_counts_live_records(ops in operations(80), max in 0u64..6) {
        let (env, db) = common::small_env("skip");
        let locker = env.non_txn_locker().unwrap();
        let mut oracle = BTreeMap::new();
        for op in ops.iter().filter(|op| !matches!(op, Op::Compress)) {
            apply(&db, &locker, &mut oracle, op)?;
        }

        let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
        let mut seen = Vec::new();
        let outcome = cursor
            .skip(Direction::Forward, max, |k| {
                seen.push(k.to_vec());
                true
            })
            .unwrap();

        let live = oracle.len() as u64;
        let expected: Vec<Vec<u8>> = oracle.keys().cloned().collect();
        if max > 0 && live >= max {
            prop_assert_eq!(outcome.skipped, max);
            prop_assert_eq!(outcome.stop, SkipStop::MaxCount);
        } else {
            prop_assert_eq!(outcome.skipped, live);
            prop_assert_eq!(outcome.stop, SkipStop::EndOfData);
        }
        prop_assert_eq!(&seen[..], &expected[..seen.len()]);
        if let Some(last) = seen.last() {
            let current = cursor.current(ReadMode::Default).unwrap().unwrap();
            prop_assert_eq!(&current.key, last);
        }
    }

    /// Insert, delete, insert again: one slot, newest value.
    #[test]
    fn prop_defunct_slot_is_reused(k in small_key(), v1 in value(), v2 in value()) {
        let (env, db) = common::small_env("reuse");
        let locker = env.non_txn_locker().unwrap();

        db.put(&locker, &k, &v1).unwrap();
        let slots = db.leaf_stats().unwrap().slot_count;
        db.delete(&locker, &k).unwrap();
        prop_assert!(matches!(db.put_no_overwrite(&locker, &k, &v2).unwrap(), PutOutcome::Inserted(_)));

        prop_assert_eq!(db.get(&locker, &k).unwrap().unwrap().to_vec(), v2);
        prop_assert_eq!(db.leaf_stats().unwrap().slot_count, slots);
    }

    /// Writes followed by their inverses restore the visible state.
    #[test]
    fn prop_inverse_operations_round_trip(
        base in prop::collection::btree_map(small_key(), value(), 0..20),
        edits in prop::collection::vec((small_key(), value()), 0..20),
    ) {
        let (env, db) = common::small_env("inverse");
        let locker = env.non_txn_locker().unwrap();
        for (k, v) in &base {
            db.put(&locker, k, v).unwrap();
        }

        // Apply each edit, remembering how to undo it.
        let mut undo: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        for (k, v) in &edits {
            let old = db.get(&locker, k).unwrap().map(|v| v.to_vec());
            db.put(&locker, k, v).unwrap();
            undo.push((k.clone(), old));
        }
        for (k, old) in undo.into_iter().rev() {
            match old {
                Some(old) => {
                    db.put(&locker, &k, &old).unwrap();
                }
                None => {
                    db.delete(&locker, &k).unwrap();
                }
            }
        }

        prop_assert_eq!(scan(&db, &locker), base);
    }

    /// An aborted transaction leaves no trace, and its locks are gone.
    #[test]
    fn prop_abort_restores_state(
        base in prop::collection::btree_map(small_key(), value(), 0..20),
        ops in operations(40),
    ) {
        let (env, db) = common::small_env_with("abort", EnvConfig {
            lock_timeout_ms: 0,
            ..EnvConfig::default()
        });
        let auto = env.non_txn_locker().unwrap();
        for (k, v) in &base {
            db.put(&auto, k, v).unwrap();
        }

        let txn = env.begin_txn(Isolation::RepeatableRead).unwrap();
        let mut shadow = base.clone();
        for op in ops.iter().filter(|op| !matches!(op, Op::Compress)) {
            apply(&db, &txn, &mut shadow, op)?;
        }
        prop_assert_eq!(scan(&db, &txn), shadow);
        txn.abort().unwrap();

        prop_assert_eq!(scan(&db, &auto), base);
        prop_assert_eq!(env.lock_table().locked_count(), 0);
        db.compress().unwrap();
        db.verify().unwrap();
    }
}
