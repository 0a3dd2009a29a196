//! Fault points for deterministic concurrency and failure testing.
//!
//! Hooks are owned by the [`Environment`](crate::Environment) and passed down
//! to the components that fire them; nothing here is process-global, so
//! concurrently running tests cannot observe each other's hooks.
//!
//! ```rust,ignore
//! let barrier = Arc::new(Barrier::new(2));
//! let b = Arc::clone(&barrier);
//! env.hooks().set(FaultPoint::BeforeBlockingLock, move || {
//!     b.wait(); // let the writer overwrite the slot while we are unlatched
//!     b.wait();
//!     HookOutcome::Continue
//! });
//! ```

use std::collections::HashMap;
use std::fmt as StdFmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, StoreError};

/// Points in the protocol where a hook may run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Just before a record version is handed to the log writer.
    BeforeLogWrite,
    /// After a cursor released its latch and before it blocks on a lock.
    BeforeBlockingLock,
    /// After a cursor re-latched its leaf following a lock wait.
    AfterRelatch,
    /// When a scan crosses from one leaf to the next.
    LeafBoundary,
    /// Before a leaf split moves slots into a new sibling.
    BeforeLeafSplit,
}

/// What the protocol should do after a hook runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookOutcome {
    /// Carry on normally.
    Continue,
    /// Fail the step with the given reason.
    Fail(String),
}

/// A hook body.
pub type HookFn = Arc<dyn Fn() -> HookOutcome + Send + Sync>;

/// Registry of installed hooks.
#[derive(Default)]
pub struct Hooks {
    installed: Mutex<HashMap<FaultPoint, HookFn>>,
}

impl StdFmt::Debug for Hooks {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        let points: Vec<FaultPoint> = self.installed.lock().keys().copied().collect();
        f.debug_struct("Hooks").field("installed", &points).finish()
    }
}

impl Hooks {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a hook, replacing any previous one at the same point.
    pub fn set<F>(&self, point: FaultPoint, hook: F)
    where
        F: Fn() -> HookOutcome + Send + Sync + 'static,
    {
        self.installed.lock().insert(point, Arc::new(hook));
    }

    /// Remove the hook at `point`.
    pub fn clear(&self, point: FaultPoint) {
        self.installed.lock().remove(&point);
    }

    /// Remove every hook.
    pub fn clear_all(&self) {
        self.installed.lock().clear();
    }

    /// Run the hook at `point`, if any.
    ///
    /// The registry mutex is not held while the hook runs, so a hook may
    /// block on a barrier that another thread's hook releases.
    pub(crate) fn fire(&self, point: FaultPoint) -> HookOutcome {
        let hook: Option<HookFn> = self.installed.lock().get(&point).cloned();
        hook.map_or(HookOutcome::Continue, |hook| hook())
    }

    /// Run the hook at `point` and turn a failure into an error: a durability
    /// error before log writes, an unexpected-state error elsewhere.
    pub(crate) fn check(&self, point: FaultPoint) -> Result<()> {
        match self.fire(point) {
            HookOutcome::Continue => Ok(()),
            HookOutcome::Fail(reason) if point == FaultPoint::BeforeLogWrite => {
                Err(StoreError::durability(reason))
            }
            HookOutcome::Fail(reason) => Err(StoreError::unexpected(format!(
                "injected failure at {point:?}: {reason}"
            ))),
        }
    }
}
