//! The environment: shared lock table, log, evictor and database registry.
//!
//! An [`Environment`] is a cheap handle (`Arc` inside) that every database,
//! cursor and locker refers back to. Collaborators are injected through
//! [`EnvironmentBuilder`]; nothing is process-global.
//!
//! # Invalidation
//! An [`StoreError::UnexpectedState`] raised anywhere means an invariant was
//! found broken. The first one invalidates the environment: from then on
//! every operation fails with [`StoreError::EnvironmentInvalid`] carrying the
//! original reason.

use std::collections::HashMap;
use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::config::{DatabaseConfig, EnvConfig};
use crate::database::{Database, DbShared};
use crate::error::{Result, StoreError};
use crate::evictor::{CacheBudget, Evictor, EvictorStats, MemoryBudget};
use crate::hooks::Hooks;
use crate::leaf::registry::CursorId;
use crate::lock::{LockStatsSnapshot, LockTable, LockerId};
use crate::locker::{Isolation, Locker, LockerKind};
use crate::log::{LogWriter, MemLog};
use crate::tracing_helpers::{error_log, info_log};
use crate::tree::{Tree, TreeConfig, TreeContext};

pub(crate) struct EnvInner {
    config: EnvConfig,
    locks: Arc<LockTable>,
    log: Arc<dyn LogWriter>,
    evictor: Evictor,
    hooks: Arc<Hooks>,
    clock: Arc<dyn Clock>,
    invalid: Mutex<Option<String>>,
    databases: Mutex<HashMap<String, Arc<DbShared>>>,
    next_database: AtomicU32,
    next_locker: AtomicU64,
    next_cursor: AtomicU64,
}

/// Handle to a storage environment.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl StdFmt::Debug for Environment {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.inner.config)
            .field("valid", &self.is_valid())
            .field("databases", &self.inner.databases.lock().len())
            .finish_non_exhaustive()
    }
}

/// Builder for an [`Environment`] with injected collaborators.
#[derive(Debug, Default)]
pub struct EnvironmentBuilder {
    config: EnvConfig,
    clock: Option<Arc<dyn Clock>>,
    hooks: Option<Arc<Hooks>>,
    log: Option<Arc<dyn LogWriter>>,
    budget: Option<Arc<dyn MemoryBudget>>,
}

impl EnvironmentBuilder {
    /// Start from `EnvConfig::default()` and in-memory collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: EnvConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source for expiration and lock bookkeeping.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Fault-point hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<Hooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Log collaborator.
    #[must_use]
    pub fn log_writer(mut self, log: Arc<dyn LogWriter>) -> Self {
        self.log = Some(log);
        self
    }

    /// Memory-pressure signal. Defaults to a [`CacheBudget`] sized by
    /// `cache_budget_bytes`.
    #[must_use]
    pub fn memory_budget(mut self, budget: Arc<dyn MemoryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Build the environment.
    #[must_use]
    pub fn open(self) -> Environment {
        let config = self.config.normalized();
        let locks = Arc::new(LockTable::new());
        let log: Arc<dyn LogWriter> = self.log.unwrap_or_else(|| Arc::new(MemLog::new()));
        let budget: Arc<dyn MemoryBudget> = self
            .budget
            .unwrap_or_else(|| Arc::new(CacheBudget::new(config.cache_budget_bytes)));
        let evictor = Evictor::new(
            budget,
            Arc::clone(&log),
            Arc::clone(&locks),
            config.critical_eviction_batch,
            config.delta_max_dirty_percent,
        );
        info_log!(?config, "environment opened");
        Environment {
            inner: Arc::new(EnvInner {
                config,
                locks,
                log,
                evictor,
                hooks: self.hooks.unwrap_or_default(),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                invalid: Mutex::new(None),
                databases: Mutex::new(HashMap::new()),
                next_database: AtomicU32::new(0),
                next_locker: AtomicU64::new(1),
                next_cursor: AtomicU64::new(1),
            }),
        }
    }
}

impl Environment {
    /// Environment with `config` and default collaborators.
    #[must_use]
    pub fn open(config: EnvConfig) -> Self {
        EnvironmentBuilder::new().config(config).open()
    }

    /// See [`EnvironmentBuilder`].
    #[must_use]
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &EnvConfig {
        &self.inner.config
    }

    // ========================================================================
    //  Databases
    // ========================================================================

    /// Open `name`, creating it with `config` if it does not exist. An
    /// existing database keeps the configuration it was created with.
    ///
    /// # Errors
    /// [`StoreError::EnvironmentInvalid`] after a fatal error.
    pub fn open_database(&self, name: &str, config: DatabaseConfig) -> Result<Database> {
        self.check_valid()?;
        let mut databases = self.inner.databases.lock();
        if let Some(shared) = databases.get(name) {
            return Ok(Database::new(Arc::clone(shared), self.clone()));
        }
        let id = self.inner.next_database.fetch_add(1, Ordering::Relaxed);
        let tree = Arc::new(Tree::new(
            id,
            TreeConfig::from(&self.inner.config),
            TreeContext {
                log: Arc::clone(&self.inner.log),
                locks: Arc::clone(&self.inner.locks),
                budget: Arc::clone(self.inner.evictor.budget()),
                hooks: Arc::clone(&self.inner.hooks),
                clock: Arc::clone(&self.inner.clock),
            },
        ));
        let shared = Arc::new(DbShared::new(id, name, config, tree));
        databases.insert(name.to_owned(), Arc::clone(&shared));
        info_log!(name, id, "database opened");
        Ok(Database::new(shared, self.clone()))
    }

    /// Names of open databases.
    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.databases.lock().keys().cloned().collect();
        names.sort();
        names
    }

    // ========================================================================
    //  Lockers
    // ========================================================================

    fn new_locker(&self, kind: LockerKind, isolation: Isolation) -> Result<Arc<Locker>> {
        self.check_valid()?;
        let id = LockerId::from_raw(self.inner.next_locker.fetch_add(1, Ordering::Relaxed));
        Ok(Arc::new(Locker::new(
            id,
            kind,
            isolation,
            Arc::clone(&self.inner.locks),
            Arc::clone(&self.inner.clock),
            self.inner.config.lock_timeout(),
        )))
    }

    /// Begin a transaction.
    ///
    /// # Errors
    /// [`StoreError::EnvironmentInvalid`] after a fatal error.
    pub fn begin_txn(&self, isolation: Isolation) -> Result<Arc<Locker>> {
        self.new_locker(LockerKind::Transactional, isolation)
    }

    /// A non-transactional, auto-commit locker.
    ///
    /// # Errors
    /// [`StoreError::EnvironmentInvalid`] after a fatal error.
    pub fn non_txn_locker(&self) -> Result<Arc<Locker>> {
        self.new_locker(LockerKind::NonTransactional, Isolation::ReadCommitted)
    }

    pub(crate) fn next_cursor_id(&self) -> CursorId {
        CursorId::from_raw(self.inner.next_cursor.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    //  Collaborators and statistics
    // ========================================================================

    /// Fault-point hooks.
    #[must_use]
    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.inner.hooks
    }

    /// Time source.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Lock table.
    #[must_use]
    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.inner.locks
    }

    /// Log collaborator.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn LogWriter> {
        &self.inner.log
    }

    /// Evictor.
    #[must_use]
    pub fn evictor(&self) -> &Evictor {
        &self.inner.evictor
    }

    /// Lock counters.
    #[must_use]
    pub fn lock_stats(&self) -> LockStatsSnapshot {
        self.inner.locks.stats()
    }

    /// Eviction counters.
    #[must_use]
    pub fn evictor_stats(&self) -> EvictorStats {
        self.inner.evictor.stats()
    }

    // ========================================================================
    //  Validity
    // ========================================================================

    /// No fatal error has been observed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner.invalid.lock().is_none()
    }

    /// The fatal error that invalidated the environment.
    #[must_use]
    pub fn invalid_reason(&self) -> Option<String> {
        self.inner.invalid.lock().clone()
    }

    pub(crate) fn check_valid(&self) -> Result<()> {
        match &*self.inner.invalid.lock() {
            None => Ok(()),
            Some(reason) => Err(StoreError::EnvironmentInvalid {
                reason: reason.clone(),
            }),
        }
    }

    /// Invalidate on a fatal error, then hand the result back.
    pub(crate) fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result
            && err.is_fatal()
        {
            let mut invalid = self.inner.invalid.lock();
            if invalid.is_none() {
                error_log!(error = %err, "environment invalidated");
                *invalid = Some(err.to_string());
            }
        }
        result
    }
}
