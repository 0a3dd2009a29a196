//! Environment, database and cursor configuration.
//!
//! [`EnvConfig`] deserializes from whatever format the host application
//! loads (`#[serde(default)]` on every field), and [`EnvConfig::from_env`]
//! overlays `LATCHKV_*` environment variables on top of the defaults.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::evictor::CacheMode;
use crate::locker::Isolation;

/// Smallest leaf or internal node capacity accepted.
pub const MIN_NODE_CAPACITY: usize = 4;

/// Environment-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Maximum slots per leaf before it is split.
    pub leaf_capacity: usize,
    /// Maximum children per internal node before it is split.
    pub internal_capacity: usize,
    /// Largest key accepted, in bytes.
    pub max_key_len: usize,
    /// Largest value accepted, in bytes, after a partial write is applied.
    pub max_value_len: usize,
    /// Values up to this size are embedded in their slot.
    pub max_embedded_value: usize,
    /// How long a blocking lock request waits. Zero means no-wait.
    pub lock_timeout_ms: u64,
    /// Grace window after expiry during which a record stays visible to a
    /// locker that locked it before it expired.
    pub ttl_grace_ms: u64,
    /// Number of leaves examined per critical-eviction pass.
    pub critical_eviction_batch: usize,
    /// Cached value bytes above which critical eviction reclaims memory.
    pub cache_budget_bytes: u64,
    /// Latch waits longer than this are logged at warn level.
    pub slow_latch_warn_ms: u64,
    /// A dirty leaf may be reduced to a delta when at most this percentage of
    /// its slots are dirty.
    pub delta_max_dirty_percent: u8,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            leaf_capacity: 64,
            internal_capacity: 64,
            max_key_len: 4096,
            max_value_len: 64 * 1024 * 1024,
            max_embedded_value: 16,
            lock_timeout_ms: 500,
            ttl_grace_ms: 60_000,
            critical_eviction_batch: 8,
            cache_budget_bytes: 64 * 1024 * 1024,
            slow_latch_warn_ms: 100,
            delta_max_dirty_percent: 25,
        }
    }
}

impl EnvConfig {
    /// Defaults with `LATCHKV_*` overrides from the process environment.
    ///
    /// Unparseable values are ignored in favour of the default.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        override_from_env("LATCHKV_LEAF_CAPACITY", &mut config.leaf_capacity);
        override_from_env("LATCHKV_INTERNAL_CAPACITY", &mut config.internal_capacity);
        override_from_env("LATCHKV_MAX_KEY_LEN", &mut config.max_key_len);
        override_from_env("LATCHKV_MAX_VALUE_LEN", &mut config.max_value_len);
        override_from_env("LATCHKV_MAX_EMBEDDED_VALUE", &mut config.max_embedded_value);
        override_from_env("LATCHKV_LOCK_TIMEOUT_MS", &mut config.lock_timeout_ms);
        override_from_env("LATCHKV_TTL_GRACE_MS", &mut config.ttl_grace_ms);
        override_from_env(
            "LATCHKV_CRITICAL_EVICTION_BATCH",
            &mut config.critical_eviction_batch,
        );
        override_from_env("LATCHKV_CACHE_BUDGET_BYTES", &mut config.cache_budget_bytes);
        override_from_env("LATCHKV_SLOW_LATCH_WARN_MS", &mut config.slow_latch_warn_ms);
        override_from_env(
            "LATCHKV_DELTA_MAX_DIRTY_PERCENT",
            &mut config.delta_max_dirty_percent,
        );

        config.normalized()
    }

    /// Clamp out-of-range values.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.leaf_capacity = self.leaf_capacity.max(MIN_NODE_CAPACITY);
        self.internal_capacity = self.internal_capacity.max(MIN_NODE_CAPACITY);
        self.delta_max_dirty_percent = self.delta_max_dirty_percent.min(100);
        self
    }

    /// Lock wait limit as a [`Duration`].
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Slow-latch threshold as a [`Duration`].
    #[must_use]
    pub const fn slow_latch_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_latch_warn_ms)
    }
}

fn override_from_env<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(raw) = env::var(var)
        && let Ok(parsed) = raw.trim().parse::<T>()
    {
        *slot = parsed;
    }
}

/// Per-database settings supplied by the metadata collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Superseded record versions are obsolete immediately (secondary-index
    /// style databases). Required for blind deletion.
    pub immediately_obsolete: bool,
    /// A custom partial-key comparator is configured. Disables blind deletion.
    pub partial_comparator: bool,
    /// Cache mode used when a cursor does not set one.
    pub cache_mode: CacheMode,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            immediately_obsolete: false,
            partial_comparator: false,
            cache_mode: CacheMode::Default,
        }
    }
}

impl DatabaseConfig {
    /// Whether deletes may be applied blindly to leaf deltas.
    #[must_use]
    pub const fn allows_blind_deletion(&self) -> bool {
        self.immediately_obsolete && !self.partial_comparator
    }
}

/// Per-cursor settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorConfig {
    /// Overrides the locker's isolation for reads through this cursor.
    pub isolation: Option<Isolation>,
    /// Keep non-transactional locks when the cursor moves.
    pub retain_non_txn_locks: bool,
    /// Dirty reads also expose records whose deletion is not yet committed.
    pub read_uncommitted_all: bool,
    /// Overrides the database's default cache mode.
    pub cache_mode: Option<CacheMode>,
}
