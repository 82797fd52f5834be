//! vacuum - lazy vacuum одного отношения.
//!
//! Прогон:
//! 1) горизонты (oldest xmin, freeze limit, агрессивность) - horizons.rs;
//! 2) скан heap с циклами очистки индексов/heap - worker.rs (последовательно)
//!    или parallel/ (N воркеров с барьером фаз);
//! 3) отрезание пустого хвоста - truncate.rs;
//! 4) финальная статистика в каталог: relpages, reltuples, relallvisible,
//!    relfrozenxid/relminmxid (только если просмотрены все незамороженные страницы).
//!
//! Подмодули:
//! - context.rs     - RunContext: всё неизменяемое на время прогона;
//! - dead_tuples.rs - DeadTupleStore (арена TupleId по партициям);
//! - scan.rs        - HeapScanner: SerialScan / ParallelScan;
//! - page_proc.rs   - обработка страницы при скане;
//! - reclaim.rs     - цикл очистки (индексы, затем heap);
//! - indexes.rs     - IndexReconciler;
//! - stats.rs       - RelationRunStats, оценка reltuples.

use anyhow::{Context, Result};
use log::{info, log};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{Catalog, RelationMeta, RelationStatsUpdate};
use crate::consts::{
    DEFAULT_WORK_MEM_KB, SKIP_PAGES_THRESHOLD, TRUNCATE_LOCK_CHECK_INTERVAL_MS,
    TRUNCATE_LOCK_TIMEOUT_MS, TRUNCATE_LOCK_WAIT_INTERVAL_MS,
};
use crate::index::IndexAm;
use crate::interrupt::CancelToken;
use crate::metrics::record_vacuum_run;
use crate::progress::{VacuumPhase, VacuumProgress};
use crate::store::{HeapStore, RelationLock, VisibilityMap};
use crate::types::{MultiXactId, Xid};
use crate::visibility::{PagePruner, VisibilityOracle};
use crate::wal::WalSink;

pub mod context;
pub mod dead_tuples;
pub mod horizons;
pub mod indexes;
pub mod page_proc;
pub mod reclaim;
pub mod scan;
pub mod stats;
pub mod truncate;
pub mod worker;

pub use context::RunContext;
pub use dead_tuples::{capacity_for, DeadTupleStore, Partition};
pub use horizons::{HorizonsPolicy, RunHorizons};
pub use indexes::{apply_index_stats, IndexReconciler, IndexRunStats};
pub use scan::{HeapScanner, NextPage, PageCursor, ParallelScan, SerialScan};
pub use stats::{estimate_reltuples, RelationRunStats};
pub use truncate::{should_attempt_truncation, Truncator};
pub use worker::{CleanupPlan, CycleSync, HeapWorker, SerialSync};

/// Параметры прогона, заданные вызывающим.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VacuumOptions {
    /// Итоговые сообщения на уровне info (иначе debug).
    pub verbose: bool,
    pub aggressive: bool,
    /// Читать все страницы; подразумевает aggressive.
    pub disable_page_skipping: bool,
    /// None - последовательный прогон.
    pub parallel_workers: Option<usize>,
    /// Включена ранняя чистка снимков: truncate не выполняется.
    pub old_snapshot_threshold: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBudget {
    pub work_mem_kb: usize,
    pub skip_pages_threshold: u32,
    pub truncate_check_interval: Duration,
    pub truncate_wait_interval: Duration,
    pub truncate_lock_timeout: Duration,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            work_mem_kb: DEFAULT_WORK_MEM_KB,
            skip_pages_threshold: SKIP_PAGES_THRESHOLD,
            truncate_check_interval: Duration::from_millis(TRUNCATE_LOCK_CHECK_INTERVAL_MS),
            truncate_wait_interval: Duration::from_millis(TRUNCATE_LOCK_WAIT_INTERVAL_MS),
            truncate_lock_timeout: Duration::from_millis(TRUNCATE_LOCK_TIMEOUT_MS),
        }
    }
}

/// Отношение и его коллабораторы на время прогона.
pub struct Relation<'a> {
    pub meta: RelationMeta,
    pub store: &'a dyn HeapStore,
    pub vm: &'a dyn VisibilityMap,
    pub lock: &'a dyn RelationLock,
    pub indexes: Vec<&'a dyn IndexAm>,
}

/// Сервисы хост-системы, которыми пользуется прогон.
pub struct RunServices<'a> {
    pub oracle: &'a dyn VisibilityOracle,
    pub pruner: &'a dyn PagePruner,
    pub wal: &'a dyn WalSink,
    pub catalog: &'a dyn Catalog,
    pub cancel: CancelToken,
    pub progress: Arc<VacuumProgress>,
}

/// Vacuum одного отношения.
pub fn vacuum_relation(
    relation: &Relation<'_>,
    options: &VacuumOptions,
    horizons_policy: &HorizonsPolicy,
    resource_budget: &ResourceBudget,
    services: &RunServices<'_>,
) -> Result<RelationRunStats> {
    let ctx = RunContext::new(relation, services, options, horizons_policy, resource_budget);
    let workers = options.parallel_workers.filter(|&n| n > 0);
    let nblocks = ctx.nblocks;

    record_vacuum_run(workers.is_some());
    log!(
        ctx.level,
        "{}vacuuming \"{}\" ({} pages, {} workers)",
        if ctx.aggressive() { "aggressively " } else { "" },
        ctx.name(),
        nblocks,
        workers.unwrap_or(0)
    );
    services.progress.set_phase(VacuumPhase::Initializing);
    services
        .progress
        .start_scan(nblocks as u64, ctx.max_dead_tuples as u64);

    let (mut stats, index_results) = match workers {
        Some(n) => crate::parallel::run(&ctx, n)?,
        None => run_serial(&ctx)?,
    };

    finalize(&ctx, &mut stats, index_results)?;
    services.wal.flush().context("flush vacuum WAL")?;
    Ok(stats)
}

fn run_serial(ctx: &RunContext<'_>) -> Result<(RelationRunStats, Vec<IndexRunStats>)> {
    let dead = DeadTupleStore::new(1, ctx.max_dead_tuples);
    let indexes = IndexReconciler::new(ctx.nindexes());
    let sync = SerialSync;
    let mut scan = SerialScan::new(ctx.nblocks);

    let worker = HeapWorker::new(ctx, &dead, dead.partition(0)?, &indexes, &sync);
    let stats = worker.run(&mut scan)?;
    Ok((stats, indexes.take_results()?))
}

fn finalize(
    ctx: &RunContext<'_>,
    stats: &mut RelationRunStats,
    index_results: Vec<IndexRunStats>,
) -> Result<()> {
    let rel = ctx.rel;
    let svc = ctx.svc;

    stats.new_rel_tuples = estimate_reltuples(
        stats.old_rel_pages,
        stats.old_rel_tuples,
        stats.rel_pages,
        stats.scanned_pages,
        stats.scanned_tuples,
    );

    // до truncate: сравнение идёт с длиной, которую видел скан
    stats.scanned_all_unfrozen = stats.covers_all_unfrozen();

    if should_attempt_truncation(
        stats.rel_pages,
        stats.nonempty_pages,
        ctx.early_pruning_enabled(),
    ) {
        Truncator::new(ctx).run(stats)?;
    }

    svc.progress.set_phase(VacuumPhase::FinalCleanup);

    apply_index_stats(svc.catalog, &index_results)?;
    stats.indexes = index_results;

    // ничего не просмотрели: новая статистика была бы бессмысленной
    let mut new_rel_pages = stats.rel_pages;
    let mut new_rel_tuples = stats.new_rel_tuples;
    if stats.scanned_pages == 0 && new_rel_pages > 0 {
        new_rel_pages = stats.old_rel_pages;
        new_rel_tuples = stats.old_rel_tuples;
    }

    let (all_visible, _) = rel.vm.count();
    let new_rel_allvisible = all_visible.min(new_rel_pages);

    let (frozen_xid, min_multi) = if stats.scanned_all_unfrozen {
        (ctx.horizons.freeze_limit, ctx.horizons.multixact_cutoff)
    } else {
        (Xid::INVALID, MultiXactId::INVALID)
    };
    stats.new_rel_allvisible = new_rel_allvisible;
    stats.new_frozen_xid = frozen_xid;
    stats.new_min_multi = min_multi;

    svc.catalog
        .update_relation(
            ctx.name(),
            &RelationStatsUpdate {
                relpages: new_rel_pages,
                reltuples: new_rel_tuples,
                relallvisible: new_rel_allvisible,
                has_indexes: ctx.has_indexes(),
                frozen_xid,
                min_multi,
            },
        )
        .with_context(|| format!("update stats of relation \"{}\"", ctx.name()))?;

    stats.new_live_tuples = (new_rel_tuples - stats.new_dead_tuples).max(0.0);
    svc.catalog
        .report_vacuum(ctx.name(), stats.new_live_tuples, stats.new_dead_tuples)?;

    info!(
        "vacuum \"{}\": pages {} removed, {} remain, {} skipped due to pins, {} skipped frozen; tuples {} removed, {} remain, {} dead but not yet removable; index scans {}",
        ctx.name(),
        stats.pages_removed,
        stats.rel_pages,
        stats.pinskipped_pages,
        stats.frozenskipped_pages,
        stats.tuples_deleted,
        stats.new_rel_tuples,
        stats.new_dead_tuples,
        stats.num_index_scans
    );
    Ok(())
}
