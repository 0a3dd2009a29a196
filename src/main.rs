//! Hang detector for concurrent cursor workloads.
//!
//! Runs writers, read-modify-write transactions and counting scans against
//! one database while a watchdog reports any thread that stops making
//! progress. A stuck thread usually means a latch held across a lock wait.
//!
//! Run with:
//! ```bash
//! RUST_LOG=latchkv=debug cargo run --release --features tracing
//! ```

#![allow(clippy::unwrap_used)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use latchkv::{
    CursorConfig, Database, DatabaseConfig, Direction, EnvConfig, Environment, Isolation,
    NewValue, ReadMode, StoreError,
};

fn key(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

// =============================================================================
// Hang detection
// =============================================================================

/// Last reported position of one worker thread.
#[derive(Default)]
struct Heartbeat {
    op: AtomicUsize,
    key: AtomicU64,
    at_ms: AtomicU64,
    done: AtomicBool,
}

/// A worker that has not reported within the stall limit.
struct Stall {
    worker: usize,
    op: usize,
    key: u64,
    silent_ms: u64,
}

struct ThreadProgress {
    beats: Box<[Heartbeat]>,
    start: Instant,
}

impl ThreadProgress {
    fn new(workers: usize) -> Self {
        Self {
            beats: (0..workers).map(|_| Heartbeat::default()).collect(),
            start: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn update(&self, worker: usize, op: usize, key: u64) {
        let beat = &self.beats[worker];
        beat.op.store(op, Ordering::Relaxed);
        beat.key.store(key, Ordering::Relaxed);
        beat.at_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn mark_done(&self, worker: usize) {
        self.beats[worker].done.store(true, Ordering::Relaxed);
    }

    fn stalled(&self, limit_ms: u64) -> Vec<Stall> {
        let now = self.now_ms();
        self.beats
            .iter()
            .enumerate()
            .filter(|(_, beat)| !beat.done.load(Ordering::Relaxed))
            .filter_map(|(worker, beat)| {
                let silent_ms = now.saturating_sub(beat.at_ms.load(Ordering::Relaxed));
                (silent_ms > limit_ms).then(|| Stall {
                    worker,
                    op: beat.op.load(Ordering::Relaxed),
                    key: beat.key.load(Ordering::Relaxed),
                    silent_ms,
                })
            })
            .collect()
    }

    fn all_done(&self) -> bool {
        self.beats.iter().all(|beat| beat.done.load(Ordering::Relaxed))
    }
}

/// Poll `progress` until every worker is done or `stop` is raised,
/// reporting stalls along with the lock table's wait counters.
fn spawn_watchdog(
    env: &Environment,
    progress: &Arc<ThreadProgress>,
    stop: &Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let env = env.clone();
    let progress = Arc::clone(progress);
    let stop = Arc::clone(stop);
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) && !progress.all_done() {
            thread::sleep(Duration::from_millis(500));
            let stalls = progress.stalled(2000);
            if stalls.is_empty() {
                continue;
            }
            let locks = env.lock_stats();
            for stall in &stalls {
                eprintln!(
                    "!!! STUCK: worker {} at op {} key=0x{:016x} silent {}ms (waits={} timeouts={} retries={})",
                    stall.worker, stall.op, stall.key, stall.silent_ms, locks.waits, locks.timeouts, locks.relock_retries
                );
            }
        }
    })
}

fn open(leaf_capacity: usize) -> (Environment, Database) {
    let env = Environment::open(EnvConfig {
        leaf_capacity,
        internal_capacity: 16,
        lock_timeout_ms: 200,
        ..EnvConfig::default()
    });
    let db = env.open_database("workload", DatabaseConfig::default()).unwrap();
    (env, db)
}

// =============================================================================
// 01: Disjoint inserts
// =============================================================================

fn run_01_disjoint_puts(threads: usize, ops_per_thread: usize) {
    println!("\n{}", "=".repeat(80));
    println!("01: DISJOINT PUTS ({threads} threads, {ops_per_thread} ops/thread)");
    println!("{}", "=".repeat(80));

    let (env, db) = open(32);
    let progress = Arc::new(ThreadProgress::new(threads));
    let stop_watchdog = Arc::new(AtomicBool::new(false));
    let watchdog = spawn_watchdog(&env, &progress, &stop_watchdog);
    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let db = db.clone();
            let env = env.clone();
            let progress = Arc::clone(&progress);
            thread::spawn(move || {
                let locker = env.non_txn_locker().unwrap();
                let base = (t * ops_per_thread) as u64;
                for i in 0..ops_per_thread {
                    let k = base + i as u64;
                    progress.update(t, i, k);
                    let op_start = Instant::now();
                    if let Err(e) = db.put(&locker, &key(k), &k.to_le_bytes()) {
                        eprintln!("[T{t:02}] ERROR op {i} key=0x{k:016x}: {e}");
                    }
                    let op_elapsed = op_start.elapsed();
                    if op_elapsed > Duration::from_millis(100) {
                        eprintln!("[T{t:02}] SLOW op {i} key=0x{k:016x} took {op_elapsed:?}");
                    }
                }
                progress.mark_done(t);
            })
        })
        .collect();

    for h in handles {
        let _ = h.join();
    }
    stop_watchdog.store(true, Ordering::Relaxed);
    let _ = watchdog.join();

    let elapsed = start.elapsed();
    let stats = db.leaf_stats().unwrap();
    println!(
        "01 DONE: {} ops in {:?} ({:.0} ops/sec), slots={} leaves={}",
        threads * ops_per_thread,
        elapsed,
        (threads * ops_per_thread) as f64 / elapsed.as_secs_f64(),
        stats.slot_count,
        stats.leaf_count,
    );
    db.verify().unwrap();
}

// =============================================================================
// 02: Contended read-modify-write transactions
// =============================================================================

fn run_02_contended_counters(threads: usize, ops_per_thread: usize, key_space: u64) {
    println!("\n{}", "=".repeat(80));
    println!("02: CONTENDED RMW ({threads} threads, {ops_per_thread} ops/thread, {key_space} keys)");
    println!("{}", "=".repeat(80));

    let (env, db) = open(16);
    {
        let locker = env.non_txn_locker().unwrap();
        for k in 0..key_space {
            db.put(&locker, &key(k), &0u64.to_le_bytes()).unwrap();
        }
    }

    let progress = Arc::new(ThreadProgress::new(threads));
    let stop_watchdog = Arc::new(AtomicBool::new(false));
    let watchdog = spawn_watchdog(&env, &progress, &stop_watchdog);
    let committed = Arc::new(AtomicU64::new(0));
    let retries = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let db = db.clone();
            let env = env.clone();
            let progress = Arc::clone(&progress);
            let committed = Arc::clone(&committed);
            let retries = Arc::clone(&retries);
            thread::spawn(move || {
                let mut state = (t as u64 + 1).wrapping_mul(0x517c_c1b7_2722_0a95);
                for op in 0..ops_per_thread {
                    state = state
                        .wrapping_mul(6_364_136_223_846_793_005)
                        .wrapping_add(1);
                    let k = (state >> 33) % key_space;
                    progress.update(t, op, k);
                    loop {
                        match increment(&env, &db, k) {
                            Ok(()) => {
                                committed.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                            Err(e) if e.is_retryable() => {
                                retries.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                eprintln!("[T{t:02}] ERROR op {op} key={k}: {e}");
                                break;
                            }
                        }
                    }
                }
                progress.mark_done(t);
            })
        })
        .collect();

    for h in handles {
        let _ = h.join();
    }
    stop_watchdog.store(true, Ordering::Relaxed);
    let _ = watchdog.join();

    let locker = env.non_txn_locker().unwrap();
    let mut total = 0u64;
    let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
    while let Some(record) = cursor.next(ReadMode::Default).unwrap() {
        let bytes: [u8; 8] = record.value.unwrap()[..8].try_into().unwrap();
        total += u64::from_le_bytes(bytes);
    }
    let committed = committed.load(Ordering::Relaxed);
    println!(
        "02 DONE: {committed} commits, {} retries in {:?}; sum={total} {}",
        retries.load(Ordering::Relaxed),
        start.elapsed(),
        if total == committed { "(consistent)" } else { "(LOST UPDATES)" }
    );
    println!("lock stats: {:?}", env.lock_stats());
}

fn increment(env: &Environment, db: &Database, k: u64) -> Result<(), StoreError> {
    let txn = env.begin_txn(Isolation::RepeatableRead)?;
    let result = (|| {
        let mut cursor = db.open_cursor(&txn, CursorConfig::default())?;
        let Some(record) = cursor.search(&key(k), ReadMode::Rmw)? else {
            return Ok(());
        };
        let old = record
            .value
            .and_then(|v| v.get(..8).and_then(|b| <[u8; 8]>::try_from(b).ok()))
            .map_or(0, u64::from_le_bytes);
        cursor.update_current(NewValue::Full(&(old + 1).to_le_bytes()), false)?;
        Ok(())
    })();
    match result {
        Ok(()) => txn.commit(),
        Err(e) => {
            txn.abort()?;
            Err(e)
        }
    }
}

// =============================================================================
// 03: Counting scans against concurrent writers
// =============================================================================

fn run_03_scans_with_writers(writers: usize, ops_per_writer: usize) {
    println!("\n{}", "=".repeat(80));
    println!("03: SKIP SCANS + WRITERS ({writers} writers, {ops_per_writer} ops/writer)");
    println!("{}", "=".repeat(80));

    let (env, db) = open(32);
    let threads = writers + 1;
    let progress = Arc::new(ThreadProgress::new(threads));
    let stop_watchdog = Arc::new(AtomicBool::new(false));
    let watchdog = spawn_watchdog(&env, &progress, &stop_watchdog);
    let writers_done = Arc::new(AtomicBool::new(false));

    let scanner = {
        let db = db.clone();
        let env = env.clone();
        let progress = Arc::clone(&progress);
        let writers_done = Arc::clone(&writers_done);
        thread::spawn(move || {
            let locker = env.non_txn_locker().unwrap();
            let mut passes = 0usize;
            while !writers_done.load(Ordering::Relaxed) {
                progress.update(0, passes, 0);
                let mut cursor = db.open_cursor(&locker, CursorConfig::default()).unwrap();
                let mut last: Option<Vec<u8>> = None;
                let outcome = cursor
                    .skip(Direction::Forward, 0, |k| {
                        let ordered = last.as_deref().is_none_or(|prev| prev < k);
                        if !ordered {
                            eprintln!("[SCAN] ORDER VIOLATION at {k:?}");
                        }
                        last = Some(k.to_vec());
                        true
                    })
                    .unwrap();
                passes += 1;
                if passes % 50 == 0 {
                    eprintln!("[SCAN] pass {passes}: {} records", outcome.skipped);
                }
            }
            progress.mark_done(0);
        })
    };

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let db = db.clone();
            let env = env.clone();
            let progress = Arc::clone(&progress);
            thread::spawn(move || {
                let t = w + 1;
                let locker = env.non_txn_locker().unwrap();
                for i in 0..ops_per_writer {
                    let k = (i * writers + w) as u64;
                    progress.update(t, i, k);
                    db.put(&locker, &key(k), b"v").unwrap();
                    if i % 4 == 3 {
                        db.delete(&locker, &key(k - writers as u64)).unwrap();
                    }
                    if i % 1000 == 999 {
                        db.compress().unwrap();
                    }
                }
                progress.mark_done(t);
            })
        })
        .collect();

    for h in handles {
        let _ = h.join();
    }
    writers_done.store(true, Ordering::Relaxed);
    let _ = scanner.join();
    stop_watchdog.store(true, Ordering::Relaxed);
    let _ = watchdog.join();

    db.verify().unwrap();
    println!("03 DONE: {:?}", db.tree_stats());
}

// =============================================================================
// Main
// =============================================================================

fn main() {
    eprintln!("latchkv Concurrent Cursor Hang Detector");
    eprintln!("=======================================");
    eprintln!("Watchdog will report any thread stuck for >2 seconds.");
    eprintln!();

    for run in 1..=3 {
        eprintln!("\n--- Run {run}/3 ---");
        run_01_disjoint_puts(8, 20_000);
        run_02_contended_counters(8, 2_000, 64);
        run_03_scans_with_writers(4, 10_000);
    }

    eprintln!("\nAll workloads completed!");
}
