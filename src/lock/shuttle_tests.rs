//! Shuttle schedule exploration for the latch + locator-lock protocol.
//!
//! Run with: `cargo test --lib lock::shuttle_tests`
//!
//! The real lock table blocks on a `parking_lot` condition variable, which
//! shuttle cannot schedule, so these tests drive a reduced model built from
//! shuttle primitives. The model keeps the parts that matter for
//! correctness:
//! - a leaf latch guarding one slot's locator and value
//! - locks keyed by locator, with a new locator on every write
//! - unlatch before blocking, relatch and re-check the locator after waking
//! - lock elision on an uncontended locator, with the new locator locked
//!   before the latch is released

use shuttle::sync::{Arc, Mutex};
use shuttle::thread;
use std::collections::HashMap;

// ============================================================================
//  Model
// ============================================================================

#[derive(Debug)]
struct ModelSlot {
    lsn: u64,
    value: u64,
}

struct ModelStore {
    latch: Mutex<ModelSlot>,
    /// Locator -> owner.
    locks: Mutex<HashMap<u64, usize>>,
    next_lsn: Mutex<u64>,
    elide: bool,
}

impl ModelStore {
    fn new(elide: bool) -> Self {
        Self {
            latch: Mutex::new(ModelSlot { lsn: 1, value: 0 }),
            locks: Mutex::new(HashMap::new()),
            next_lsn: Mutex::new(2),
            elide,
        }
    }

    fn try_lock(&self, lsn: u64, owner: usize) -> bool {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(&lsn) {
            Some(&holder) => holder == owner,
            None => {
                locks.insert(lsn, owner);
                true
            }
        }
    }

    fn is_uncontended(&self, lsn: u64) -> bool {
        !self.locks.lock().unwrap().contains_key(&lsn)
    }

    fn release(&self, lsn: u64, owner: usize) {
        let mut locks = self.locks.lock().unwrap();
        if locks.get(&lsn) == Some(&owner) {
            locks.remove(&lsn);
        }
    }

    /// Read-modify-write one increment, non-transactionally.
    fn increment(&self, owner: usize) {
        loop {
            let mut slot = self.latch.lock().unwrap();
            let seen = slot.lsn;

            let elided = self.elide && self.is_uncontended(seen);
            if !elided && !self.try_lock(seen, owner) {
                // Never block on a record lock while latched.
                drop(slot);
                while !self.try_lock(seen, owner) {
                    thread::yield_now();
                }
                slot = self.latch.lock().unwrap();
                if slot.lsn != seen {
                    // Retry-on-change: the version we waited for is gone.
                    drop(slot);
                    self.release(seen, owner);
                    continue;
                }
            }

            let new_lsn = {
                let mut next = self.next_lsn.lock().unwrap();
                let lsn = *next;
                *next += 1;
                lsn
            };
            // The new locator is unknown to everyone else until the latch is
            // released, so this cannot fail.
            assert!(self.try_lock(new_lsn, owner));
            slot.lsn = new_lsn;
            slot.value += 1;
            drop(slot);

            if !elided {
                self.release(seen, owner);
            }
            self.release(new_lsn, owner);
            return;
        }
    }

    fn value(&self) -> u64 {
        self.latch.lock().unwrap().value
    }
}

fn run_increments(elide: bool, threads: usize, per_thread: u64) {
    let store = Arc::new(ModelStore::new(elide));
    let handles: Vec<_> = (0..threads)
        .map(|owner| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..per_thread {
                    store.increment(owner);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.value(), threads as u64 * per_thread);
    assert!(store.locks.lock().unwrap().is_empty(), "leaked locks");
}

// ============================================================================
//  Tests
// ============================================================================

/// Conflicting writers never lose an update.
#[test]
fn test_shuttle_no_lost_update() {
    shuttle::check_random(|| run_increments(false, 2, 3), 200);
}

/// Elided locks are still safe because the new locator is locked before the
/// latch is released.
#[test]
fn test_shuttle_no_lost_update_with_elision() {
    shuttle::check_random(|| run_increments(true, 3, 2), 200);
}

/// A waiter that wakes up to a changed locator releases what it waited for
/// and retries instead of writing over the newer version.
#[test]
fn test_shuttle_retry_on_change() {
    shuttle::check_random(
        || {
            let store = Arc::new(ModelStore::new(false));

            // Owner 0 holds the current version's lock while it writes.
            let held = store.latch.lock().unwrap().lsn;
            assert!(store.try_lock(held, 0));

            let s = Arc::clone(&store);
            let waiter = thread::spawn(move || s.increment(1));

            {
                let mut slot = store.latch.lock().unwrap();
                slot.lsn = 99;
                slot.value = 10;
            }
            store.release(held, 0);

            waiter.join().unwrap();
            assert_eq!(store.value(), 11);
        },
        200,
    );
}
