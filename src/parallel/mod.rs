//! parallel - параллельный прогон: N воркеров делят скан одного отношения.
//!
//! - barrier.rs - PhaseBarrier: фазы воркеров и кворумы раундов очистки;
//! - shared.rs  - ParallelShared (курсор страниц, арена мёртвых версий, барьер,
//!   статистика индексов) и WorkerSync (CycleSync воркера).
//!
//! Воркеры - scoped-потоки. Ошибка или паника любого воркера прерывает барьер:
//! остальные получают Err на ближайшем ожидании, прогон возвращает ошибку
//! первого упавшего.

use anyhow::{anyhow, Context, Result};
use log::{debug, log, warn};
use std::thread;

use crate::vacuum::{HeapWorker, IndexRunStats, ParallelScan, RelationRunStats, RunContext};

pub mod barrier;
pub mod shared;

pub use barrier::{PhaseBarrier, Rendezvous, WorkerPhase, WorkerState};
pub use shared::{ParallelShared, WorkerSync};

/// Прерывает барьер, если воркер вышел не через disarm (ошибка или паника).
struct AbortOnDrop<'s> {
    shared: &'s ParallelShared,
    id: usize,
    armed: bool,
}

impl AbortOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.note_failure(self.id);
            self.shared.barrier.abort();
        }
    }
}

fn run_worker(ctx: &RunContext<'_>, shared: &ParallelShared, id: usize) -> Result<RelationRunStats> {
    let guard = AbortOnDrop {
        shared,
        id,
        armed: true,
    };
    let sync = WorkerSync::new(shared, id);
    let mut scan = ParallelScan::new(&shared.cursor);
    let part = shared.dead.partition(id)?;

    let stats = HeapWorker::new(ctx, &shared.dead, part, &shared.indexes, &sync)
        .run(&mut scan)
        .with_context(|| format!("parallel vacuum worker {}", id))?;
    guard.disarm();
    debug!(
        "parallel vacuum worker {} done: {} pages scanned, {} index scans",
        id, stats.scanned_pages, stats.num_index_scans
    );
    Ok(stats)
}

/// Параллельный прогон; возвращает сложенные счётчики воркеров и отложенную
/// статистику индексов.
pub fn run(ctx: &RunContext<'_>, nworkers: usize) -> Result<(RelationRunStats, Vec<IndexRunStats>)> {
    let shared = ParallelShared::new(ctx, nworkers);
    log!(
        ctx.level,
        "launched {} parallel vacuum workers for \"{}\"",
        nworkers,
        ctx.name()
    );

    let results: Vec<Result<RelationRunStats>> = thread::scope(|s| {
        let mut handles = Vec::with_capacity(nworkers);
        for id in 0..nworkers {
            let shared = &shared;
            let h = thread::Builder::new()
                .name(format!("vacuum-worker-{}", id))
                .spawn_scoped(s, move || run_worker(ctx, shared, id));
            if h.is_err() {
                // без этого воркера остальные не дождутся кворума
                shared.note_failure(id);
                shared.barrier.abort();
            }
            handles.push(h);
        }

        handles
            .into_iter()
            .enumerate()
            .map(|(id, h)| match h {
                Ok(h) => h
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("parallel vacuum worker {} panicked", id))),
                Err(e) => Err(anyhow!(e).context(format!("spawn parallel vacuum worker {}", id))),
            })
            .collect()
    });

    if let Some(id) = shared.first_failure() {
        let mut results = results;
        for (i, r) in results.iter().enumerate() {
            if let Err(e) = r {
                if i != id {
                    warn!("parallel vacuum worker {}: {:#}", i, e);
                }
            }
        }
        return match results.swap_remove(id) {
            Err(e) => Err(e),
            Ok(_) => Err(anyhow!("parallel vacuum aborted")),
        };
    }

    let mut stats = ctx.new_stats();
    stats.workers = nworkers;
    for r in results {
        stats.merge(&r?);
    }
    Ok((stats, shared.indexes.take_results()?))
}
