//! Shared fixtures and tracing setup for integration tests.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     let (env, db) = common::small_env("t");
//!     // ...
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: filter directives (e.g. `latchkv=debug,latchkv::cursor=trace`)
//! - `LATCHKV_LOG_DIR`: log directory (default: `logs/`)
//! - `LATCHKV_LOG_CONSOLE`: set to "0" to disable console output
//!
//! Library events are only emitted when the crate is built with the
//! `tracing` feature. Logs go to `logs/latchkv.jsonl` as NDJSON:
//!
//! ```bash
//! # Lock waits that had to retry on a changed locator
//! cat logs/latchkv.jsonl | jq 'select(.fields.message == "locator changed during wait")'
//!
//! # Show only warnings and errors
//! cat logs/latchkv.jsonl | jq 'select(.level == "WARN" or .level == "ERROR")'
//! ```

#![allow(dead_code)]

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Once;

use latchkv::{Database, DatabaseConfig, EnvConfig, Environment};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static INIT: Once = Once::new();

/// Initialize console and file logging. Only the first call has an effect.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

/// Fixed-width key that sorts numerically.
pub fn key(i: u32) -> Vec<u8> {
    format!("key{i:06}").into_bytes()
}

/// Environment with tiny nodes, so a few dozen records span several
/// leaves and levels.
pub fn small_env(name: &str) -> (Environment, Database) {
    small_env_with(name, EnvConfig::default())
}

/// [`small_env`] starting from `base` instead of the defaults.
pub fn small_env_with(name: &str, base: EnvConfig) -> (Environment, Database) {
    let env = Environment::open(EnvConfig {
        leaf_capacity: 4,
        internal_capacity: 4,
        ..base
    });
    let db = env.open_database(name, DatabaseConfig::default()).unwrap();
    (env, db)
}

#[derive(Debug, Clone)]
struct TracingConfig {
    log_dir: PathBuf,
    log_file: String,
    console_enabled: bool,
    default_level: Level,
}

impl TracingConfig {
    fn from_env() -> Self {
        Self {
            log_dir: env::var("LATCHKV_LOG_DIR").map_or_else(|_| PathBuf::from("logs"), PathBuf::from),
            log_file: "latchkv.jsonl".to_string(),
            console_enabled: !env::var("LATCHKV_LOG_CONSOLE").is_ok_and(|v| v == "0"),
            default_level: Level::INFO,
        }
    }
}

fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{default_level}")))
}

#[expect(clippy::expect_used)]
fn setup_tracing() {
    let config = TracingConfig::from_env();
    std::fs::create_dir_all(&config.log_dir).expect("Failed to create log directory");

    // Append: nextest runs each test in its own process.
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_dir.join(&config.log_file))
        .expect("Failed to open log file");

    let console_layer = config.console_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_target(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .compact()
            .with_filter(make_filter(config.default_level))
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .with_filter(make_filter(config.default_level));

    let _ = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
