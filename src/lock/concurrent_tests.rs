//! Threaded tests for [`LockTable`] waits.

use super::*;
use std::sync::atomic::AtomicBool;
use std::thread;

const A: LockerId = LockerId::from_raw(1);
const B: LockerId = LockerId::from_raw(2);
const C: LockerId = LockerId::from_raw(3);

#[test]
fn test_waiter_granted_on_release() {
    let table = Arc::new(LockTable::new());
    let lsn = Lsn::from_raw(7);
    let _ = table.try_lock(lsn, A, LockMode::Write);

    let released = Arc::new(AtomicBool::new(false));
    let t = Arc::clone(&table);
    let r = Arc::clone(&released);
    let waiter = thread::spawn(move || {
        let grant = t
            .lock(lsn, B, LockMode::Write, Duration::from_secs(5), &CancellationToken::new())
            .expect("lock");
        assert!(r.load(Ordering::Acquire), "granted before release");
        grant
    });

    thread::sleep(Duration::from_millis(30));
    released.store(true, Ordering::Release);
    assert!(table.release(lsn, A));

    assert_eq!(waiter.join().expect("waiter panicked"), LockGrant::New);
    assert_eq!(table.owners_of(lsn), vec![(B, LockMode::Write)]);
    assert_eq!(table.stats().waits, 1);
}

#[test]
fn test_queued_writer_blocks_new_readers() {
    let table = Arc::new(LockTable::new());
    let lsn = Lsn::from_raw(8);
    let _ = table.try_lock(lsn, A, LockMode::Read);

    let t = Arc::clone(&table);
    let writer = thread::spawn(move || {
        t.lock(lsn, B, LockMode::Write, Duration::from_secs(5), &CancellationToken::new())
    });

    // Wait for the writer to queue.
    while table.stats().waits == 0 {
        thread::yield_now();
    }

    // A fresh reader must not jump the queued writer.
    assert_eq!(table.try_lock(lsn, C, LockMode::Read), LockAttempt::Denied);

    assert!(table.release(lsn, A));
    assert_eq!(writer.join().expect("writer panicked"), Ok(LockGrant::New));
}

#[test]
fn test_cancel_wakes_waiter() {
    let table = Arc::new(LockTable::new());
    let lsn = Lsn::from_raw(9);
    let _ = table.try_lock(lsn, A, LockMode::Write);

    let token = CancellationToken::new();
    let t = Arc::clone(&table);
    let tok = token.clone();
    let waiter =
        thread::spawn(move || t.lock(lsn, B, LockMode::Read, Duration::from_secs(30), &tok));

    thread::sleep(Duration::from_millis(20));
    token.cancel();

    assert_eq!(
        waiter.join().expect("waiter panicked"),
        Err(StoreError::Interrupted)
    );
    assert!(table.release(lsn, A));
    assert!(table.is_uncontended(lsn));
}

#[test]
fn test_many_lockers_serialize_on_one_locator() {
    let table = Arc::new(LockTable::new());
    let lsn = Lsn::from_raw(11);
    let counter = Arc::new(parking_lot::Mutex::new(0_u64));

    let handles: Vec<_> = (0..4_u64)
        .map(|id| {
            let table = Arc::clone(&table);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let locker = LockerId::from_raw(100 + id);
                for _ in 0..50 {
                    table
                        .lock(lsn, locker, LockMode::Write, Duration::from_secs(10), &CancellationToken::new())
                        .expect("lock");
                    *counter.lock() += 1;
                    assert!(table.release(lsn, locker));
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }

    assert_eq!(*counter.lock(), 200);
    assert_eq!(table.locked_count(), 0);
}
