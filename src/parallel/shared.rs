//! parallel/shared - общее состояние параллельного прогона и точки синхронизации воркера.

use anyhow::{anyhow, Result};
use std::sync::{Mutex, PoisonError};

use crate::types::PageNo;
use crate::vacuum::{
    estimate_reltuples, CleanupPlan, CycleSync, DeadTupleStore, IndexReconciler, PageCursor,
    Partition, RelationRunStats, RunContext,
};

use super::barrier::{PhaseBarrier, Rendezvous, WorkerPhase};

/// Сумма по завершившим скан воркерам (для финального cleanup индексов).
#[derive(Debug, Default, Clone, Copy)]
struct ScanTotals {
    scanned_pages: PageNo,
    scanned_tuples: f64,
}

#[derive(Debug)]
pub struct ParallelShared {
    pub cursor: PageCursor,
    pub dead: DeadTupleStore,
    pub barrier: PhaseBarrier,
    pub indexes: IndexReconciler,
    nworkers: usize,
    totals: Mutex<ScanTotals>,
    first_failure: Mutex<Option<usize>>,
}

impl ParallelShared {
    pub fn new(ctx: &RunContext<'_>, nworkers: usize) -> Self {
        Self {
            cursor: PageCursor::new(ctx.nblocks),
            dead: DeadTupleStore::new(nworkers, ctx.max_dead_tuples),
            barrier: PhaseBarrier::new(nworkers).with_progress(ctx.svc.progress.clone()),
            indexes: IndexReconciler::new(ctx.nindexes()),
            nworkers,
            totals: Mutex::new(ScanTotals::default()),
            first_failure: Mutex::new(None),
        }
    }

    pub fn nworkers(&self) -> usize {
        self.nworkers
    }

    /// Запомнить первого упавшего воркера (его ошибка - причина остальных).
    pub fn note_failure(&self, id: usize) {
        let mut g = self
            .first_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        g.get_or_insert(id);
    }

    pub fn first_failure(&self) -> Option<usize> {
        *self
            .first_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// CycleSync одного параллельного воркера.
pub struct WorkerSync<'s> {
    shared: &'s ParallelShared,
    id: usize,
}

impl<'s> WorkerSync<'s> {
    pub fn new(shared: &'s ParallelShared, id: usize) -> Self {
        Self { shared, id }
    }
}

impl CycleSync for WorkerSync<'_> {
    fn start(&self) -> Result<()> {
        self.shared
            .barrier
            .advance(self.id, WorkerPhase::Scanning)
            .map(|_| ())
    }

    fn prepared(&self, nindexes: usize) -> Result<Vec<usize>> {
        let snap = self
            .shared
            .barrier
            .arrive_and_wait(self.id, Rendezvous::Prepared, || {})?;

        // индексы делятся между участниками раунда; завершившие скан не участвуют
        let participants: Vec<usize> = snap
            .iter()
            .enumerate()
            .filter(|(_, w)| !w.is_complete())
            .map(|(i, _)| i)
            .collect();
        if participants.is_empty() {
            return Err(anyhow!(
                "parallel vacuum worker {} is not a participant of its own round",
                self.id
            ));
        }
        Ok((0..nindexes)
            .filter(|i| participants[i % participants.len()] == self.id)
            .collect())
    }

    fn reclaiming(&self) -> Result<()> {
        self.shared
            .barrier
            .arrive_and_wait(self.id, Rendezvous::Reclaiming, || {})
            .map(|_| ())
    }

    fn finished(&self, dead: &DeadTupleStore, _part: Partition<'_>) -> Result<()> {
        // последний прибывший очищает все партиции до того, как кто-то продолжит скан
        self.shared
            .barrier
            .arrive_and_wait(self.id, Rendezvous::Finished, || dead.clear_all())?;
        self.shared
            .barrier
            .advance(self.id, WorkerPhase::Scanning)
            .map(|_| ())
    }

    fn complete(&self, stats: &RelationRunStats) -> Result<()> {
        {
            let mut t = self
                .shared
                .totals
                .lock()
                .map_err(|_| anyhow!("parallel vacuum totals poisoned"))?;
            t.scanned_pages += stats.scanned_pages;
            t.scanned_tuples += stats.scanned_tuples;
        }
        self.shared.barrier.complete(self.id)
    }

    fn cleanup_plan(&self, ctx: &RunContext<'_>, stats: &RelationRunStats) -> Result<CleanupPlan> {
        self.shared.barrier.wait_all_complete()?;
        let t = *self
            .shared
            .totals
            .lock()
            .map_err(|_| anyhow!("parallel vacuum totals poisoned"))?;
        let n = self.shared.nworkers;
        Ok(CleanupPlan {
            indexes: (0..ctx.nindexes()).filter(|i| i % n == self.id).collect(),
            num_heap_tuples: estimate_reltuples(
                stats.old_rel_pages,
                stats.old_rel_tuples,
                ctx.nblocks,
                t.scanned_pages,
                t.scanned_tuples,
            ),
            estimated_count: t.scanned_pages < ctx.nblocks,
        })
    }
}
