use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;

use quiver_vacuum::metrics;
use quiver_vacuum::progress::ProgressSnapshot;
use quiver_vacuum::sim::TableFixture;
use quiver_vacuum::wal::VacuumWal;
use quiver_vacuum::{RelationRunStats, VacuumConfig};

pub struct SimulateArgs {
    pub pages: u32,
    pub live_per_page: usize,
    pub dead_per_page: usize,
    pub churn: f64,
    pub seed: u64,
    pub indexes: usize,
    pub workers: Option<usize>,
    pub work_mem_kb: Option<usize>,
    pub disable_page_skipping: bool,
    pub aggressive: bool,
    pub verbose: bool,
    pub prune: bool,
    pub runs: u32,
    pub wal_dir: Option<PathBuf>,
    pub json: bool,
}

#[derive(Serialize)]
struct SimulateReport {
    runs: Vec<RelationRunStats>,
    progress: ProgressSnapshot,
    live_rows: usize,
    dangling_index_refs: usize,
    metrics: metrics::MetricsSnapshot,
}

/// CLI: simulate - таблица в памяти, N прогонов vacuum подряд.
///
/// Флаги перекрывают P1_VACUUM_* из окружения. Вывод - текст/JSON.
pub fn exec(a: SimulateArgs) -> Result<()> {
    let mut cfg = VacuumConfig::from_env();
    if let Some(n) = a.workers {
        cfg = cfg.with_workers(n);
    }
    if let Some(kb) = a.work_mem_kb {
        cfg = cfg.with_work_mem_kb(kb);
    }
    if a.disable_page_skipping {
        cfg = cfg.with_disable_page_skipping(true);
    }
    if a.aggressive {
        cfg = cfg.with_aggressive(true);
    }
    if a.verbose {
        cfg = cfg.with_verbose(true);
    }

    let fx = TableFixture::builder("sim")
        .pages(a.pages)
        .live_per_page(a.live_per_page)
        .dead_per_page(a.dead_per_page)
        .churn(a.seed, a.churn)
        .indexes(a.indexes)
        .prune_dead_items(a.prune)
        .config(cfg)
        .build()
        .context("build simulated table")?;

    let wal = match &a.wal_dir {
        Some(dir) => Some(
            VacuumWal::open(dir).with_context(|| format!("open WAL at {}", dir.display()))?,
        ),
        None => None,
    };

    metrics::reset();
    let mut runs = Vec::with_capacity(a.runs as usize);
    for i in 0..a.runs {
        let stats = match &wal {
            Some(w) => fx.run_with_wal(w),
            None => fx.run(),
        }
        .with_context(|| format!("vacuum run {}", i + 1))?;
        runs.push(stats);
    }

    let report = SimulateReport {
        runs,
        progress: fx.progress.snapshot(),
        live_rows: fx.live_rows()?,
        dangling_index_refs: fx.dangling_index_refs()?,
        metrics: metrics::snapshot(),
    };

    if a.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
        return Ok(());
    }

    for (i, s) in report.runs.iter().enumerate() {
        println!("Run {}:", i + 1);
        println!("  rel_pages            = {}", s.rel_pages);
        println!("  scanned_pages        = {}", s.scanned_pages);
        println!("  pinskipped_pages     = {}", s.pinskipped_pages);
        println!("  frozenskipped_pages  = {}", s.frozenskipped_pages);
        println!("  tuples_deleted       = {}", s.tuples_deleted);
        println!("  tuples_frozen        = {}", s.tuples_frozen);
        println!("  new_dead_tuples      = {}", s.new_dead_tuples);
        println!("  num_index_scans      = {}", s.num_index_scans);
        println!("  pages_removed        = {}", s.pages_removed);
        println!("  new_rel_tuples       = {}", s.new_rel_tuples);
        println!("  new_rel_allvisible   = {}", s.new_rel_allvisible);
    }
    println!("Table:");
    println!("  live_rows            = {}", report.live_rows);
    println!("  dangling_index_refs  = {}", report.dangling_index_refs);
    if let Some(w) = &wal {
        println!("  wal                  = {}", w.path().display());
    }
    println!("Metrics:");
    println!("  pages_scanned        = {}", report.metrics.pages_scanned);
    println!("  skip_ratio           = {:.3}", report.metrics.skip_ratio());
    println!("  vm_bits_set          = {}", report.metrics.vm_bits_set);
    println!("  wal_appends_total    = {}", report.metrics.wal_appends_total);
    println!("  barrier_waits        = {}", report.metrics.barrier_waits);
    Ok(())
}
