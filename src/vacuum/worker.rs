//! vacuum/worker - цикл одного воркера: скан страниц, циклы очистки, финальный cleanup индексов.
//!
//! Последовательный и параллельный прогоны отличаются только точками
//! синхронизации (CycleSync) и выбором страниц (HeapScanner):
//! - SerialSync - без ожиданий, все индексы свои, партиция одна;
//! - parallel::WorkerSync - барьер фаз между воркерами.

use anyhow::Result;
use log::log;

use crate::progress::VacuumPhase;
use crate::types::TupleId;

use super::context::RunContext;
use super::dead_tuples::{DeadTupleStore, Partition};
use super::indexes::IndexReconciler;
use super::scan::HeapScanner;
use super::stats::{estimate_reltuples, RelationRunStats};

/// Что воркер делает в финальном cleanup индексов.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupPlan {
    pub indexes: Vec<usize>,
    pub num_heap_tuples: f64,
    pub estimated_count: bool,
}

/// Точки синхронизации цикла очистки.
pub trait CycleSync: Sync {
    fn start(&self) -> Result<()>;

    /// Мёртвые версии цикла собраны (у всех участников). Возвращает индексы,
    /// которые чистит этот воркер.
    fn prepared(&self, nindexes: usize) -> Result<Vec<usize>>;

    /// Индексные ссылки цикла удалены; можно освобождать слоты heap.
    fn reclaiming(&self) -> Result<()>;

    /// Слоты heap освобождены; после возврата партиции цикла пусты.
    fn finished(&self, dead: &DeadTupleStore, part: Partition<'_>) -> Result<()>;

    fn complete(&self, stats: &RelationRunStats) -> Result<()>;

    fn cleanup_plan(&self, ctx: &RunContext<'_>, stats: &RelationRunStats) -> Result<CleanupPlan>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SerialSync;

impl CycleSync for SerialSync {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn prepared(&self, nindexes: usize) -> Result<Vec<usize>> {
        Ok((0..nindexes).collect())
    }

    fn reclaiming(&self) -> Result<()> {
        Ok(())
    }

    fn finished(&self, _dead: &DeadTupleStore, part: Partition<'_>) -> Result<()> {
        part.clear();
        Ok(())
    }

    fn complete(&self, _stats: &RelationRunStats) -> Result<()> {
        Ok(())
    }

    fn cleanup_plan(&self, ctx: &RunContext<'_>, stats: &RelationRunStats) -> Result<CleanupPlan> {
        Ok(CleanupPlan {
            indexes: (0..ctx.nindexes()).collect(),
            num_heap_tuples: estimate_reltuples(
                stats.old_rel_pages,
                stats.old_rel_tuples,
                stats.rel_pages,
                stats.scanned_pages,
                stats.scanned_tuples,
            ),
            estimated_count: stats.scanned_pages < stats.rel_pages,
        })
    }
}

pub struct HeapWorker<'c, 'r> {
    pub(super) ctx: &'c RunContext<'r>,
    pub(super) dead: &'c DeadTupleStore,
    pub(super) part: Partition<'c>,
    pub(super) indexes: &'c IndexReconciler,
    pub(super) sync: &'c dyn CycleSync,
    pub(super) stats: RelationRunStats,
}

impl<'c, 'r> HeapWorker<'c, 'r> {
    pub fn new(
        ctx: &'c RunContext<'r>,
        dead: &'c DeadTupleStore,
        part: Partition<'c>,
        indexes: &'c IndexReconciler,
        sync: &'c dyn CycleSync,
    ) -> Self {
        Self {
            ctx,
            dead,
            part,
            indexes,
            sync,
            stats: ctx.new_stats(),
        }
    }

    pub(super) fn record_dead(&self, tid: TupleId) {
        if self.part.record(tid) {
            self.ctx.svc.progress.dead_tuples_recorded(1);
        }
    }

    pub fn run(mut self, scanner: &mut dyn HeapScanner) -> Result<RelationRunStats> {
        let ctx = self.ctx;
        self.sync.start()?;

        while let Some(np) = scanner.next_page(ctx, &mut self.stats) {
            ctx.svc.cancel.check()?;

            // места может не хватить на ещё одну страницу
            if self.part.needs_reclaim() {
                self.reclaim_cycle()?;
            }

            self.process_page(np)?;
            ctx.svc.progress.page_scanned(np.page);
        }

        if !self.part.is_empty() {
            self.reclaim_cycle()?;
        }
        self.sync.complete(&self.stats)?;

        let plan = self.sync.cleanup_plan(ctx, &self.stats)?;
        if !plan.indexes.is_empty() {
            ctx.svc.progress.set_phase(VacuumPhase::IndexCleanup);
        }
        for i in plan.indexes {
            self.indexes
                .cleanup(ctx, i, plan.num_heap_tuples, plan.estimated_count)?;
        }

        let s = &self.stats;
        // при индексах то же пишет второй проход по heap
        if !ctx.has_indexes() && s.vacuumed_pages > 0 {
            log!(
                ctx.level,
                "\"{}\": removed {} row versions in {} pages",
                ctx.name(),
                s.tuples_deleted,
                s.vacuumed_pages
            );
        }
        log!(
            ctx.level,
            "\"{}\": found {} removable, {} nonremovable row versions in {} out of {} pages",
            ctx.name(),
            s.tuples_deleted,
            s.scanned_tuples,
            s.scanned_pages,
            s.rel_pages
        );
        log!(
            ctx.level,
            "{} dead row versions cannot be removed yet, oldest xmin: {}; {} unused item pointers; skipped {} pages due to buffer pins, {} frozen pages; {} pages are entirely empty",
            s.new_dead_tuples,
            ctx.horizons.oldest_xmin,
            s.unused_items,
            s.pinskipped_pages,
            s.frozenskipped_pages,
            s.empty_pages
        );

        Ok(self.stats)
    }
}
