//! Lightweight global metrics for the vacuum engine.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Heap scan (pages scanned / skipped)
//! - Reclaim (tuples removed / frozen, index scans)
//! - Visibility map self-healing
//! - Truncate
//! - WAL
//! - Parallel barrier

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Runs -----
static VACUUM_RUNS: AtomicU64 = AtomicU64::new(0);
static VACUUM_PARALLEL_RUNS: AtomicU64 = AtomicU64::new(0);

// ----- Heap scan -----
static PAGES_SCANNED: AtomicU64 = AtomicU64::new(0);
static PAGES_PINSKIPPED: AtomicU64 = AtomicU64::new(0);
static PAGES_FROZENSKIPPED: AtomicU64 = AtomicU64::new(0);

// ----- Reclaim -----
static TUPLES_REMOVED: AtomicU64 = AtomicU64::new(0);
static TUPLES_FROZEN: AtomicU64 = AtomicU64::new(0);
static INDEX_SCANS: AtomicU64 = AtomicU64::new(0);
static DEAD_TUPLES_DROPPED: AtomicU64 = AtomicU64::new(0);

// ----- Visibility map -----
static VM_BITS_SET: AtomicU64 = AtomicU64::new(0);
static VM_ANOMALIES: AtomicU64 = AtomicU64::new(0);

// ----- Truncate -----
static PAGES_TRUNCATED: AtomicU64 = AtomicU64::new(0);
static TRUNCATE_ABANDONED: AtomicU64 = AtomicU64::new(0);

// ----- WAL -----
static WAL_APPENDS_TOTAL: AtomicU64 = AtomicU64::new(0);
static WAL_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static WAL_FSYNC_CALLS: AtomicU64 = AtomicU64::new(0);

// ----- Parallel -----
static BARRIER_WAITS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Runs
    pub vacuum_runs: u64,
    pub vacuum_parallel_runs: u64,

    // Heap scan
    pub pages_scanned: u64,
    pub pages_pinskipped: u64,
    pub pages_frozenskipped: u64,

    // Reclaim
    pub tuples_removed: u64,
    pub tuples_frozen: u64,
    pub index_scans: u64,
    pub dead_tuples_dropped: u64,

    // Visibility map
    pub vm_bits_set: u64,
    pub vm_anomalies: u64,

    // Truncate
    pub pages_truncated: u64,
    pub truncate_abandoned: u64,

    // WAL
    pub wal_appends_total: u64,
    pub wal_bytes_written: u64,
    pub wal_fsync_calls: u64,

    // Parallel
    pub barrier_waits: u64,
}

impl MetricsSnapshot {
    /// Доля пропущенных страниц от всех просмотренных (scan + skip).
    pub fn skip_ratio(&self) -> f64 {
        let skipped = self.pages_pinskipped + self.pages_frozenskipped;
        let total = self.pages_scanned + skipped;
        if total == 0 {
            0.0
        } else {
            skipped as f64 / total as f64
        }
    }
}

// ----- Recorders (runs) -----
pub fn record_vacuum_run(parallel: bool) {
    VACUUM_RUNS.fetch_add(1, Ordering::Relaxed);
    if parallel {
        VACUUM_PARALLEL_RUNS.fetch_add(1, Ordering::Relaxed);
    }
}

// ----- Recorders (heap scan) -----
pub fn record_page_scanned() {
    PAGES_SCANNED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_page_pinskipped() {
    PAGES_PINSKIPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_page_frozenskipped() {
    PAGES_FROZENSKIPPED.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (reclaim) -----
pub fn record_tuples_removed(n: u64) {
    TUPLES_REMOVED.fetch_add(n, Ordering::Relaxed);
}
pub fn record_tuples_frozen(n: u64) {
    TUPLES_FROZEN.fetch_add(n, Ordering::Relaxed);
}
pub fn record_index_scan() {
    INDEX_SCANS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_dead_tuple_dropped() {
    DEAD_TUPLES_DROPPED.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (visibility map) -----
pub fn record_vm_set() {
    VM_BITS_SET.fetch_add(1, Ordering::Relaxed);
}
pub fn record_vm_anomaly() {
    VM_ANOMALIES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (truncate) -----
pub fn record_pages_truncated(n: u64) {
    PAGES_TRUNCATED.fetch_add(n, Ordering::Relaxed);
}
pub fn record_truncate_abandoned() {
    TRUNCATE_ABANDONED.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (WAL) -----
pub fn record_wal_append(bytes: usize) {
    WAL_APPENDS_TOTAL.fetch_add(1, Ordering::Relaxed);
    WAL_BYTES_WRITTEN.fetch_add(bytes as u64, Ordering::Relaxed);
}
pub fn record_wal_fsync() {
    WAL_FSYNC_CALLS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (parallel) -----
pub fn record_barrier_wait() {
    BARRIER_WAITS.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        vacuum_runs: VACUUM_RUNS.load(Ordering::Relaxed),
        vacuum_parallel_runs: VACUUM_PARALLEL_RUNS.load(Ordering::Relaxed),

        pages_scanned: PAGES_SCANNED.load(Ordering::Relaxed),
        pages_pinskipped: PAGES_PINSKIPPED.load(Ordering::Relaxed),
        pages_frozenskipped: PAGES_FROZENSKIPPED.load(Ordering::Relaxed),

        tuples_removed: TUPLES_REMOVED.load(Ordering::Relaxed),
        tuples_frozen: TUPLES_FROZEN.load(Ordering::Relaxed),
        index_scans: INDEX_SCANS.load(Ordering::Relaxed),
        dead_tuples_dropped: DEAD_TUPLES_DROPPED.load(Ordering::Relaxed),

        vm_bits_set: VM_BITS_SET.load(Ordering::Relaxed),
        vm_anomalies: VM_ANOMALIES.load(Ordering::Relaxed),

        pages_truncated: PAGES_TRUNCATED.load(Ordering::Relaxed),
        truncate_abandoned: TRUNCATE_ABANDONED.load(Ordering::Relaxed),

        wal_appends_total: WAL_APPENDS_TOTAL.load(Ordering::Relaxed),
        wal_bytes_written: WAL_BYTES_WRITTEN.load(Ordering::Relaxed),
        wal_fsync_calls: WAL_FSYNC_CALLS.load(Ordering::Relaxed),

        barrier_waits: BARRIER_WAITS.load(Ordering::Relaxed),
    }
}

/// Сброс всех счётчиков (для CLI/бенчей).
pub fn reset() {
    for c in [
        &VACUUM_RUNS,
        &VACUUM_PARALLEL_RUNS,
        &PAGES_SCANNED,
        &PAGES_PINSKIPPED,
        &PAGES_FROZENSKIPPED,
        &TUPLES_REMOVED,
        &TUPLES_FROZEN,
        &INDEX_SCANS,
        &DEAD_TUPLES_DROPPED,
        &VM_BITS_SET,
        &VM_ANOMALIES,
        &PAGES_TRUNCATED,
        &TRUNCATE_ABANDONED,
        &WAL_APPENDS_TOTAL,
        &WAL_BYTES_WRITTEN,
        &WAL_FSYNC_CALLS,
        &BARRIER_WAITS,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_ratio_handles_empty() {
        let s = MetricsSnapshot::default();
        assert_eq!(s.skip_ratio(), 0.0);
        let s = MetricsSnapshot {
            pages_scanned: 3,
            pages_frozenskipped: 1,
            ..Default::default()
        };
        assert!((s.skip_ratio() - 0.25).abs() < 1e-9);
    }
}
