//! Concurrent tests for [`Latch`].
//!
//! Guarded with `#[cfg(not(miri))]` because Miri does not handle the thread
//! counts used here well.

use super::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[test]
fn test_concurrent_latch_increments_are_serialized() {
    let latch = Arc::new(Latch::new(0_u64));
    let iterations = 1000;
    let num_threads = 4;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                for _ in 0..iterations {
                    let mut guard = latch.latch();
                    *guard += 1;
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }

    assert_eq!(*latch.latch(), iterations * num_threads);
    assert!(!latch.is_latched());
}

#[test]
fn test_waiter_blocks_until_release() {
    let latch = Arc::new(Latch::new(Vec::<&'static str>::new()));
    let holder_done = Arc::new(AtomicBool::new(false));

    let mut guard = latch.latch();

    let l = Arc::clone(&latch);
    let done = Arc::clone(&holder_done);
    let waiter = thread::spawn(move || {
        let mut guard = l.latch();
        // The holder pushed before releasing, so we must observe it.
        assert!(done.load(Ordering::Acquire));
        guard.push("waiter");
    });

    thread::sleep(Duration::from_millis(30));
    guard.push("holder");
    holder_done.store(true, Ordering::Release);
    drop(guard);

    waiter.join().expect("waiter panicked");
    assert_eq!(*latch.latch(), vec!["holder", "waiter"]);
}

#[test]
fn test_try_latch_never_blocks() {
    let latch = Arc::new(Latch::new(()));
    let guard = latch.latch();

    let l = Arc::clone(&latch);
    let attempts = thread::spawn(move || (0..100).filter(|_| l.try_latch().is_some()).count());

    assert_eq!(attempts.join().expect("thread panicked"), 0);
    drop(guard);
}
