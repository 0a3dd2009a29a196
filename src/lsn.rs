//! Record locators.
//!
//! An [`Lsn`] names one physical version of a record. Every write produces a
//! new one, which is why record locks are keyed by it rather than by key.

use std::fmt as StdFmt;

/// Physical identifier of a record version.
///
/// [`Lsn::NULL`] is the "known absent" sentinel carried by slots whose
/// record was never durably written.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lsn(u64);

impl Lsn {
    /// Sentinel for "no version exists".
    pub const NULL: Self = Self(u64::MAX);

    /// Wrap a raw locator value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw locator value.
    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Whether this is the absent sentinel.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for Lsn {
    fn default() -> Self {
        Self::NULL
    }
}

impl StdFmt::Debug for Lsn {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        if self.is_null() {
            f.write_str("Lsn(NULL)")
        } else {
            write!(f, "Lsn({:#x})", self.0)
        }
    }
}

impl StdFmt::Display for Lsn {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        if self.is_null() {
            f.write_str("NULL")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// Locator plus the log sequence number assigned when it was written.
///
/// Cursors cache this for the last slot they visited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordVersion {
    /// Locator of the version.
    pub lsn: Lsn,
    /// Monotonic sequence number of the write; 0 if unknown.
    pub seq: u64,
}

impl RecordVersion {
    /// Version with an unknown sequence number.
    #[must_use]
    pub const fn unsequenced(lsn: Lsn) -> Self {
        Self { lsn, seq: 0 }
    }
}
