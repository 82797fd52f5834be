//! Centralized configuration for the vacuum engine.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - VacuumConfig::from_env() reads P1_VACUUM_* env vars (same conventions as the storage layer).
//! - Build the three run inputs of vacuum_relation: options(), budget(), horizons_policy().
//!
//! Defaults:
//! - work_mem_kb = 65536 (dead-tuple budget)
//! - workers = 0 (serial run)
//! - skip_pages_threshold = 32
//! - truncate lock timings 20/50/5000 ms
//! - old_snapshot_threshold disabled
//!   All of the above can be overridden via ENV or builder.

use std::fmt;
use std::time::Duration;

use crate::consts::{
    DEFAULT_FREEZE_MIN_AGE, DEFAULT_FREEZE_TABLE_AGE, DEFAULT_MULTIXACT_FREEZE_MIN_AGE,
    DEFAULT_MULTIXACT_FREEZE_TABLE_AGE, DEFAULT_WORK_MEM_KB, SKIP_PAGES_THRESHOLD,
    TRUNCATE_LOCK_CHECK_INTERVAL_MS, TRUNCATE_LOCK_TIMEOUT_MS, TRUNCATE_LOCK_WAIT_INTERVAL_MS,
};
use crate::types::{MultiXactId, Xid};
use crate::vacuum::{HorizonsPolicy, ResourceBudget, VacuumOptions};

/// Top-level configuration for vacuum runs.
#[derive(Clone, Debug)]
pub struct VacuumConfig {
    /// Memory budget for dead tuple ids, KiB.
    /// Env: P1_VACUUM_WORK_MEM_KB (default 65536)
    pub work_mem_kb: usize,

    /// Parallel workers (0 = serial).
    /// Env: P1_VACUUM_WORKERS (default 0)
    pub workers: usize,

    /// Minimal run of skippable pages before skipping kicks in.
    /// Env: P1_VACUUM_SKIP_PAGES_THRESHOLD (default 32)
    pub skip_pages_threshold: u32,

    /// Env: P1_VACUUM_TRUNCATE_CHECK_MS (default 20)
    pub truncate_check_ms: u64,
    /// Env: P1_VACUUM_TRUNCATE_WAIT_MS (default 50)
    pub truncate_wait_ms: u64,
    /// Env: P1_VACUUM_TRUNCATE_TIMEOUT_MS (default 5000)
    pub truncate_timeout_ms: u64,

    /// Early pruning ("snapshot too old"); truncation is disabled while set.
    /// Env: P1_OLD_SNAPSHOT_THRESHOLD_MIN (default unset)
    pub old_snapshot_threshold_min: Option<u64>,

    /// Env: P1_VACUUM_VERBOSE = 0|1|true|false (default false)
    pub verbose: bool,
    /// Env: P1_VACUUM_DISABLE_PAGE_SKIPPING (default false)
    pub disable_page_skipping: bool,
    /// Env: P1_VACUUM_AGGRESSIVE (default false)
    pub aggressive: bool,

    // ---------- freeze ages ----------
    /// Env: P1_VACUUM_FREEZE_MIN_AGE
    pub freeze_min_age: u32,
    /// Env: P1_VACUUM_FREEZE_TABLE_AGE
    pub freeze_table_age: u32,
    /// Env: P1_VACUUM_MULTIXACT_FREEZE_MIN_AGE
    pub multixact_freeze_min_age: u32,
    /// Env: P1_VACUUM_MULTIXACT_FREEZE_TABLE_AGE
    pub multixact_freeze_table_age: u32,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            work_mem_kb: DEFAULT_WORK_MEM_KB,
            workers: 0,
            skip_pages_threshold: SKIP_PAGES_THRESHOLD,

            truncate_check_ms: TRUNCATE_LOCK_CHECK_INTERVAL_MS,
            truncate_wait_ms: TRUNCATE_LOCK_WAIT_INTERVAL_MS,
            truncate_timeout_ms: TRUNCATE_LOCK_TIMEOUT_MS,

            old_snapshot_threshold_min: None,

            verbose: false,
            disable_page_skipping: false,
            aggressive: false,

            freeze_min_age: DEFAULT_FREEZE_MIN_AGE,
            freeze_table_age: DEFAULT_FREEZE_TABLE_AGE,
            multixact_freeze_min_age: DEFAULT_MULTIXACT_FREEZE_MIN_AGE,
            multixact_freeze_table_age: DEFAULT_MULTIXACT_FREEZE_TABLE_AGE,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "on" || s == "yes"
    })
}

fn env_num<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl VacuumConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        // ----- memory / workers -----
        if let Some(n) = env_num::<usize>("P1_VACUUM_WORK_MEM_KB") {
            cfg.work_mem_kb = n;
        }
        if let Some(n) = env_num::<usize>("P1_VACUUM_WORKERS") {
            cfg.workers = n;
        }
        if let Some(n) = env_num::<u32>("P1_VACUUM_SKIP_PAGES_THRESHOLD") {
            cfg.skip_pages_threshold = n;
        }

        // ----- truncate -----
        if let Some(n) = env_num::<u64>("P1_VACUUM_TRUNCATE_CHECK_MS") {
            cfg.truncate_check_ms = n;
        }
        if let Some(n) = env_num::<u64>("P1_VACUUM_TRUNCATE_WAIT_MS") {
            cfg.truncate_wait_ms = n;
        }
        if let Some(n) = env_num::<u64>("P1_VACUUM_TRUNCATE_TIMEOUT_MS") {
            cfg.truncate_timeout_ms = n;
        }
        if let Some(n) = env_num::<u64>("P1_OLD_SNAPSHOT_THRESHOLD_MIN") {
            cfg.old_snapshot_threshold_min = Some(n);
        }

        // ----- flags -----
        if let Some(on) = env_flag("P1_VACUUM_VERBOSE") {
            cfg.verbose = on;
        }
        if let Some(on) = env_flag("P1_VACUUM_DISABLE_PAGE_SKIPPING") {
            cfg.disable_page_skipping = on;
        }
        if let Some(on) = env_flag("P1_VACUUM_AGGRESSIVE") {
            cfg.aggressive = on;
        }

        // ----- freeze ages -----
        if let Some(n) = env_num::<u32>("P1_VACUUM_FREEZE_MIN_AGE") {
            cfg.freeze_min_age = n;
        }
        if let Some(n) = env_num::<u32>("P1_VACUUM_FREEZE_TABLE_AGE") {
            cfg.freeze_table_age = n;
        }
        if let Some(n) = env_num::<u32>("P1_VACUUM_MULTIXACT_FREEZE_MIN_AGE") {
            cfg.multixact_freeze_min_age = n;
        }
        if let Some(n) = env_num::<u32>("P1_VACUUM_MULTIXACT_FREEZE_TABLE_AGE") {
            cfg.multixact_freeze_table_age = n;
        }

        cfg
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_work_mem_kb(mut self, kb: usize) -> Self {
        self.work_mem_kb = kb;
        self
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn with_skip_pages_threshold(mut self, n: u32) -> Self {
        self.skip_pages_threshold = n;
        self
    }

    /// Override truncate lock timings (check interval, retry interval, overall timeout).
    pub fn with_truncate_timings(mut self, check_ms: u64, wait_ms: u64, timeout_ms: u64) -> Self {
        self.truncate_check_ms = check_ms;
        self.truncate_wait_ms = wait_ms;
        self.truncate_timeout_ms = timeout_ms;
        self
    }

    pub fn with_old_snapshot_threshold_min(mut self, min: Option<u64>) -> Self {
        self.old_snapshot_threshold_min = min;
        self
    }

    pub fn with_verbose(mut self, on: bool) -> Self {
        self.verbose = on;
        self
    }

    pub fn with_disable_page_skipping(mut self, on: bool) -> Self {
        self.disable_page_skipping = on;
        self
    }

    pub fn with_aggressive(mut self, on: bool) -> Self {
        self.aggressive = on;
        self
    }

    pub fn with_freeze_ages(
        mut self,
        min_age: u32,
        table_age: u32,
        multi_min_age: u32,
        multi_table_age: u32,
    ) -> Self {
        self.freeze_min_age = min_age;
        self.freeze_table_age = table_age;
        self.multixact_freeze_min_age = multi_min_age;
        self.multixact_freeze_table_age = multi_table_age;
        self
    }

    // ----- run inputs -----

    pub fn options(&self) -> VacuumOptions {
        VacuumOptions {
            verbose: self.verbose,
            aggressive: self.aggressive,
            disable_page_skipping: self.disable_page_skipping,
            parallel_workers: if self.workers == 0 {
                None
            } else {
                Some(self.workers)
            },
            old_snapshot_threshold: self
                .old_snapshot_threshold_min
                .map(|m| Duration::from_secs(m * 60)),
        }
    }

    pub fn budget(&self) -> ResourceBudget {
        ResourceBudget {
            work_mem_kb: self.work_mem_kb,
            skip_pages_threshold: self.skip_pages_threshold,
            truncate_check_interval: Duration::from_millis(self.truncate_check_ms),
            truncate_wait_interval: Duration::from_millis(self.truncate_wait_ms),
            truncate_lock_timeout: Duration::from_millis(self.truncate_timeout_ms),
        }
    }

    /// Horizons policy for the given snapshot of the transaction system.
    pub fn horizons_policy(
        &self,
        oldest_xmin: Xid,
        next_xid: Xid,
        oldest_multi: MultiXactId,
        next_multi: MultiXactId,
    ) -> HorizonsPolicy {
        HorizonsPolicy {
            oldest_xmin,
            next_xid,
            oldest_multi,
            next_multi,
            freeze_min_age: self.freeze_min_age,
            freeze_table_age: self.freeze_table_age,
            multixact_freeze_min_age: self.multixact_freeze_min_age,
            multixact_freeze_table_age: self.multixact_freeze_table_age,
        }
    }
}

impl fmt::Display for VacuumConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "VacuumConfig {{")?;
        writeln!(f, "  work_mem_kb: {}", self.work_mem_kb)?;
        writeln!(f, "  workers: {}", self.workers)?;
        writeln!(f, "  skip_pages_threshold: {}", self.skip_pages_threshold)?;
        writeln!(
            f,
            "  truncate_ms: check={} wait={} timeout={}",
            self.truncate_check_ms, self.truncate_wait_ms, self.truncate_timeout_ms
        )?;
        writeln!(
            f,
            "  old_snapshot_threshold_min: {:?}",
            self.old_snapshot_threshold_min
        )?;
        writeln!(f, "  verbose: {}", self.verbose)?;
        writeln!(f, "  disable_page_skipping: {}", self.disable_page_skipping)?;
        writeln!(f, "  aggressive: {}", self.aggressive)?;
        writeln!(
            f,
            "  freeze ages: min={} table={} multi_min={} multi_table={}",
            self.freeze_min_age,
            self.freeze_table_age,
            self.multixact_freeze_min_age,
            self.multixact_freeze_table_age
        )?;
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_zero_means_serial() {
        let cfg = VacuumConfig::default();
        assert!(cfg.options().parallel_workers.is_none());
        let cfg = cfg.with_workers(3);
        assert_eq!(cfg.options().parallel_workers, Some(3));
    }

    #[test]
    fn budget_carries_truncate_timings() {
        let b = VacuumConfig::default()
            .with_truncate_timings(1, 2, 30)
            .budget();
        assert_eq!(b.truncate_check_interval, Duration::from_millis(1));
        assert_eq!(b.truncate_wait_interval, Duration::from_millis(2));
        assert_eq!(b.truncate_lock_timeout, Duration::from_millis(30));
    }

    #[test]
    fn display_mentions_every_section() {
        let s = VacuumConfig::default().to_string();
        assert!(s.contains("work_mem_kb: 65536"));
        assert!(s.contains("freeze ages"));
    }
}
