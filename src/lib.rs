//! # `latchkv`
//!
//! A concurrent latched B+tree with cursors and record locking keyed by
//! record locator.
//!
//! Every write to a record produces a new *locator* ([`Lsn`]) for it, and
//! record locks are taken on locators rather than on keys. Cursors combine
//! the two levels of concurrency control:
//!
//! - **latches** are short, per-node, and never held across a blocking lock
//!   wait
//! - **locks** are per-locator, owned by a [`Locker`], and may be held to
//!   the end of a transaction
//!
//! A lock that has to wait is taken with the leaf unlatched; afterwards the
//! slot is re-latched and its locator re-read, and if a writer got in
//! first the lock is reverted and the attempt repeated on the new locator.
//!
//! ## Example
//!
//! ```rust
//! use latchkv::{CursorConfig, DatabaseConfig, EnvConfig, Environment, ReadMode};
//!
//! let env = Environment::open(EnvConfig::default());
//! let db = env.open_database("users", DatabaseConfig::default()).unwrap();
//! let locker = env.non_txn_locker().unwrap();
//!
//! db.put(&locker, b"alice", b"1").unwrap();
//! db.put(&locker, b"bob", b"2").unwrap();
//!
//! let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
//! let mut keys = Vec::new();
//! while let Some(record) = cursor.next(ReadMode::Default).unwrap() {
//!     keys.push(record.key);
//! }
//! assert_eq!(keys, vec![b"alice".to_vec(), b"bob".to_vec()]);
//! ```
//!
//! ## Transactions
//!
//! ```rust
//! use latchkv::{DatabaseConfig, EnvConfig, Environment, Isolation};
//!
//! let env = Environment::open(EnvConfig::default());
//! let db = env.open_database("accounts", DatabaseConfig::default()).unwrap();
//!
//! let txn = env.begin_txn(Isolation::RepeatableRead).unwrap();
//! db.put(&txn, b"acct", b"100").unwrap();
//! txn.abort().unwrap();
//!
//! let reader = env.non_txn_locker().unwrap();
//! assert!(db.get(&reader, b"acct").unwrap().is_none());
//! ```
//!
//! ## Collaborators
//!
//! The durable log ([`LogWriter`]), the time source ([`Clock`]), the memory
//! budget ([`MemoryBudget`]) and fault points ([`Hooks`]) are injected
//! through [`EnvironmentBuilder`]. In-memory defaults are provided.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod tracing_helpers;

pub mod arena;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod database;
pub mod env;
pub mod error;
pub mod evictor;
pub mod hooks;
pub mod internode;
pub mod latch;
pub mod leaf;
pub mod lock;
pub mod locker;
pub mod log;
pub mod lsn;
pub mod slot;
pub mod tree;

// Re-export main types for convenience
pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CursorConfig, DatabaseConfig, EnvConfig};
pub use cursor::{
    Cursor, CursorStatus, DeleteOutcome, Direction, NewValue, PutMode, PutOutcome, ReadMode,
    Record, SkipOutcome, SkipStop, Updated,
};
pub use database::Database;
pub use env::{Environment, EnvironmentBuilder};
pub use error::{Result, StoreError};
pub use evictor::{CacheBudget, CacheMode, EvictorStats, MemoryBudget};
pub use hooks::{FaultPoint, HookOutcome, Hooks};
pub use lock::{LockMode, LockStatsSnapshot, LockerId};
pub use locker::{Isolation, Locker};
pub use log::{LogWriter, MemLog};
pub use lsn::{Lsn, RecordVersion};
