#![cfg(feature = "metrics")]

use once_cell::sync::Lazy;
use std::{
    collections::HashMap,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

/* ───────────── Roh‑Latenzen ─────────────────────────── */

static TIMES: Lazy<Mutex<Vec<(&'static str, u128)>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Call at the end of an operation: `record("reduce", start);`
pub fn record(name: &'static str, start: Instant) {
    let dur = start.elapsed().as_micros();
    TIMES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push((name, dur));
}

/* ───────────── Buffer‑Allokationen ───────────────────── */

/// Device buffers currently alive.
pub static ALLOCS:      AtomicUsize = AtomicUsize::new(0);
/// Bytes held by the live device buffers.
pub static ALLOC_BYTES: AtomicUsize = AtomicUsize::new(0);
/// Device buffers created since process start.
pub static ALLOCS_TOTAL: AtomicUsize = AtomicUsize::new(0);

/* ───────────── Zusammenfassung ausgeben ─────────────── */

/// Prints and drains the recorded latencies, grouped by operation.
pub fn summary() {
    let mut map: HashMap<&str, Vec<u128>> = HashMap::new();
    {
        let mut times = TIMES.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, us) in times.drain(..) {
            map.entry(name).or_default().push(us);
        }
    }

    println!("── metrics summary ──");
    let mut names: Vec<_> = map.into_iter().collect();
    names.sort_unstable_by_key(|(name, _)| *name);
    for (name, mut v) in names {
        v.sort_unstable();
        let mean = v.iter().sum::<u128>() / v.len() as u128;
        let p95  = v[((v.len() * 95) / 100).saturating_sub(1)];
        println!("{:<18} n={:<6} mean={:>7} µs   p95={:>7} µs", name, v.len(), mean, p95);
    }

    let live  = ALLOCS.load(Ordering::Relaxed);
    let bytes = ALLOC_BYTES.load(Ordering::Relaxed);
    let total = ALLOCS_TOTAL.load(Ordering::Relaxed);
    println!("device buffers: {} created, {} live ({} KiB)", total, live, bytes / 1024);
}
