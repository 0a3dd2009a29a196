//! Error taxonomy for cursor, lock and tree operations.
//!
//! Defunct-record races are deliberately absent: they are resolved inside the
//! locking protocol and never reach the caller. Absence of a record is
//! reported as `Ok(None)`, not as an error.

use std::time::Duration;

use thiserror::Error;

use crate::lsn::Lsn;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the storage core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A lock could not be granted without waiting and the locker does not wait.
    #[error("lock conflict on record {locator}")]
    LockConflict {
        /// Locator of the record whose lock was denied.
        locator: Lsn,
    },

    /// A blocking lock request was not granted within the locker's timeout.
    #[error("lock on record {locator} not granted within {timeout:?}")]
    LockTimeout {
        /// Locator of the record being waited on.
        locator: Lsn,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A lock wait or a long scan was cancelled through its token.
    #[error("operation interrupted")]
    Interrupted,

    /// The log collaborator failed to make a record version durable.
    #[error("durability failure: {reason}")]
    Durability {
        /// Collaborator-supplied description.
        reason: String,
    },

    /// A tree or cursor invariant was found violated.
    ///
    /// Fatal: the environment is invalidated when this is raised.
    #[error("unexpected state: {detail}")]
    UnexpectedState {
        /// Which invariant failed.
        detail: String,
    },

    /// The environment was invalidated by an earlier fatal error.
    #[error("environment invalid: {reason}")]
    EnvironmentInvalid {
        /// The fatal error that invalidated it.
        reason: String,
    },

    /// The operation needs a positioned cursor.
    #[error("cursor is not initialized")]
    CursorNotInitialized,

    /// The cursor was closed.
    #[error("cursor is closed")]
    CursorClosed,

    /// The locker has already committed or aborted.
    #[error("locker {locker} is no longer active")]
    LockerInactive {
        /// Id of the finished locker.
        locker: u64,
    },

    /// Key exceeds the configured maximum.
    #[error("key of {len} bytes exceeds the {max} byte limit")]
    KeyTooLarge {
        /// Offending length.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// Value, or the end of a partial write, exceeds the configured maximum.
    #[error("value of {len} bytes exceeds the {max} byte limit")]
    ValueTooLarge {
        /// Resulting length, saturated at `usize::MAX`.
        len: usize,
        /// Configured limit.
        max: usize,
    },
}

impl StoreError {
    /// Whether this error must invalidate the environment.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::UnexpectedState { .. })
    }

    /// Whether the transaction layer may retry the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockConflict { .. } | Self::LockTimeout { .. })
    }

    pub(crate) fn unexpected(detail: impl Into<String>) -> Self {
        Self::UnexpectedState {
            detail: detail.into(),
        }
    }

    pub(crate) fn durability(reason: impl Into<String>) -> Self {
        Self::Durability {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unexpected_state_is_fatal() {
        assert!(StoreError::unexpected("cursor missing from leaf").is_fatal());
        assert!(!StoreError::Interrupted.is_fatal());
        assert!(!StoreError::durability("disk full").is_fatal());
    }

    #[test]
    fn test_lock_errors_are_retryable() {
        let conflict = StoreError::LockConflict {
            locator: Lsn::from_raw(7),
        };
        assert!(conflict.is_retryable());
        assert!(!StoreError::Interrupted.is_retryable());
    }

    #[test]
    fn test_display_names_locator() {
        let err = StoreError::LockTimeout {
            locator: Lsn::from_raw(0x42),
            timeout: Duration::from_millis(5),
        };
        assert!(err.to_string().contains("0x42"));
    }
}
