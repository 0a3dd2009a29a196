//! Exclusive per-node latch.
//!
//! A [`Latch<T>`] owns the mutable body of one tree node. The body is only
//! reachable through a [`LatchGuard`], so every node-mutating call takes the
//! guard as proof that the latch is held:
//!
//! ```rust
//! use latchkv::latch::Latch;
//!
//! let latch = Latch::new(Vec::<u32>::new());
//! let mut guard = latch.latch();
//! guard.push(7);
//! assert!(latch.try_latch().is_none());
//! drop(guard);
//! assert!(!latch.is_latched());
//! ```
//!
//! # Type-State
//! Guards own an `Arc` of the latch cell, so a latched node can be returned
//! from the navigator and carried across calls without borrowing the tree.
//! Guards are `!Send`: a latch is always released by the thread that took it.
//!
//! # Ordering
//! Latches are taken parent-then-child. The only exception is
//! [`Latch::try_latch`] on a sibling while a parent is held, which never
//! blocks and therefore cannot deadlock.

use std::fmt as StdFmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::tracing_helpers::warn_log;

// ============================================================================
//  Latch
// ============================================================================

/// An exclusive latch protecting a node body of type `T`.
pub struct Latch<T> {
    cell: Arc<Mutex<T>>,
}

impl<T> Latch<T> {
    /// Wrap a node body.
    #[must_use]
    pub fn new(body: T) -> Self {
        Self {
            cell: Arc::new(Mutex::new(body)),
        }
    }

    /// Acquire the latch, waiting as long as necessary.
    #[must_use = "dropping the guard releases the latch immediately"]
    pub fn latch(&self) -> LatchGuard<T> {
        LatchGuard {
            guard: self.cell.lock_arc(),
        }
    }

    /// Acquire the latch, logging a warning if the wait exceeds `warn_after`.
    #[must_use = "dropping the guard releases the latch immediately"]
    pub fn latch_timed(&self, warn_after: Duration) -> LatchGuard<T> {
        if let Some(guard) = self.try_latch() {
            return guard;
        }

        let started: Instant = Instant::now();
        let guard: LatchGuard<T> = self.latch();
        let waited: Duration = started.elapsed();

        if waited > warn_after {
            warn_log!(waited_ms = waited.as_millis() as u64, "SLOW_LATCH");
        }

        guard
    }

    /// Acquire the latch only if it is free.
    #[must_use]
    pub fn try_latch(&self) -> Option<LatchGuard<T>> {
        self.cell
            .try_lock_arc()
            .map(|guard| LatchGuard { guard })
    }

    /// Whether some thread currently holds the latch.
    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.cell.is_locked()
    }
}

impl<T> StdFmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Latch")
            .field("latched", &self.is_latched())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  LatchGuard
// ============================================================================

/// Proof that a node latch is held. Releases the latch on drop.
#[must_use = "dropping the guard releases the latch immediately"]
pub struct LatchGuard<T> {
    guard: ArcMutexGuard<RawMutex, T>,
}

impl<T> LatchGuard<T> {
    /// Release the latch explicitly.
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Deref for LatchGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LatchGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: StdFmt::Debug> StdFmt::Debug for LatchGuard<T> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_tuple("LatchGuard").field(&*self.guard).finish()
    }
}

#[cfg(all(test, not(miri)))]
mod concurrent_tests;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_and_release() {
        let latch = Latch::new(0_u32);
        {
            let mut guard = latch.latch();
            *guard += 1;
            assert!(latch.is_latched());
        }
        assert!(!latch.is_latched());
        assert_eq!(*latch.latch(), 1);
    }

    #[test]
    fn test_try_latch_fails_while_held() {
        let latch = Latch::new(());
        let guard = latch.try_latch();
        assert!(guard.is_some());
        assert!(latch.try_latch().is_none());

        drop(guard);
        assert!(latch.try_latch().is_some());
    }

    #[test]
    fn test_guard_outlives_borrow_of_latch() {
        let guard = {
            let latch = Latch::new(String::from("leaf"));
            latch.latch()
        };
        assert_eq!(guard.as_str(), "leaf");
    }

    #[test]
    fn test_latch_timed_uncontended() {
        let latch = Latch::new(5_u8);
        let guard = latch.latch_timed(Duration::from_millis(1));
        assert_eq!(*guard, 5);
        guard.release();
        assert!(!latch.is_latched());
    }
}
