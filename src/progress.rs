//! progress - счётчики прогресса одного прогона vacuum (advisory, без влияния на корректность).
//!
//! Разделяется всеми воркерами прогона (Arc<VacuumProgress>). Счётчики - атомики;
//! фазы параллельных воркеров - вектор под коротким мьютексом.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::parallel::WorkerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VacuumPhase {
    Initializing,
    ScanHeap,
    VacuumIndex,
    VacuumHeap,
    IndexCleanup,
    Truncate,
    FinalCleanup,
}

impl VacuumPhase {
    fn as_u8(self) -> u8 {
        match self {
            VacuumPhase::Initializing => 0,
            VacuumPhase::ScanHeap => 1,
            VacuumPhase::VacuumIndex => 2,
            VacuumPhase::VacuumHeap => 3,
            VacuumPhase::IndexCleanup => 4,
            VacuumPhase::Truncate => 5,
            VacuumPhase::FinalCleanup => 6,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => VacuumPhase::ScanHeap,
            2 => VacuumPhase::VacuumIndex,
            3 => VacuumPhase::VacuumHeap,
            4 => VacuumPhase::IndexCleanup,
            5 => VacuumPhase::Truncate,
            6 => VacuumPhase::FinalCleanup,
            _ => VacuumPhase::Initializing,
        }
    }
}

#[derive(Debug, Default)]
pub struct VacuumProgress {
    phase: AtomicU8,
    heap_blks_total: AtomicU64,
    heap_blks_scanned: AtomicU64,
    heap_blks_vacuumed: AtomicU64,
    index_vacuum_count: AtomicU64,
    max_dead_tuples: AtomicU64,
    num_dead_tuples: AtomicU64,
    workers: Mutex<Vec<WorkerState>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub phase: VacuumPhase,
    pub heap_blks_total: u64,
    pub heap_blks_scanned: u64,
    pub heap_blks_vacuumed: u64,
    pub index_vacuum_count: u64,
    pub max_dead_tuples: u64,
    pub num_dead_tuples: u64,
    /// Пусто для однопоточного прогона.
    pub workers: Vec<WorkerState>,
}

impl VacuumProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_phase(&self, phase: VacuumPhase) {
        self.phase.store(phase.as_u8(), Ordering::Relaxed);
    }

    pub fn start_scan(&self, total_blocks: u64, max_dead_tuples: u64) {
        self.set_phase(VacuumPhase::ScanHeap);
        self.heap_blks_total.store(total_blocks, Ordering::Relaxed);
        self.max_dead_tuples.store(max_dead_tuples, Ordering::Relaxed);
    }

    /// Номер последней просмотренной страницы + 1 (в параллельном режиме - максимум по воркерам).
    pub fn page_scanned(&self, page: u32) {
        self.heap_blks_scanned
            .fetch_max(page as u64 + 1, Ordering::Relaxed);
    }

    pub fn page_vacuumed(&self, page: u32) {
        self.heap_blks_vacuumed
            .fetch_max(page as u64 + 1, Ordering::Relaxed);
    }

    /// Число завершённых циклов очистки индексов (воркеры сообщают свой счётчик).
    pub fn index_passes_done(&self, n: u64) {
        self.index_vacuum_count.fetch_max(n, Ordering::Relaxed);
    }

    pub fn dead_tuples_recorded(&self, n: u64) {
        self.num_dead_tuples.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dead_tuples_cleared(&self) {
        self.num_dead_tuples.store(0, Ordering::Relaxed);
    }

    /// Опубликовать состояние параллельного воркера id (зовёт барьер при каждом переходе).
    pub fn publish_worker(&self, id: usize, state: WorkerState) {
        let mut g = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if g.len() <= id {
            g.resize(id + 1, state);
        }
        g[id] = state;
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: VacuumPhase::from_u8(self.phase.load(Ordering::Relaxed)),
            heap_blks_total: self.heap_blks_total.load(Ordering::Relaxed),
            heap_blks_scanned: self.heap_blks_scanned.load(Ordering::Relaxed),
            heap_blks_vacuumed: self.heap_blks_vacuumed.load(Ordering::Relaxed),
            index_vacuum_count: self.index_vacuum_count.load(Ordering::Relaxed),
            max_dead_tuples: self.max_dead_tuples.load(Ordering::Relaxed),
            num_dead_tuples: self.num_dead_tuples.load(Ordering::Relaxed),
            workers: self.worker_states(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanned_is_monotonic_across_workers() {
        let p = VacuumProgress::new();
        p.start_scan(10, 291);
        p.page_scanned(7);
        p.page_scanned(3);
        let s = p.snapshot();
        assert_eq!(s.phase, VacuumPhase::ScanHeap);
        assert_eq!(s.heap_blks_scanned, 8);
        assert_eq!(s.max_dead_tuples, 291);
        assert!(s.workers.is_empty());
    }

    #[test]
    fn worker_states_grow_on_demand() {
        use crate::parallel::WorkerPhase;

        let p = VacuumProgress::new();
        let st = |phase, round| WorkerState { phase, round };
        p.publish_worker(2, st(WorkerPhase::Scanning, 0));
        p.publish_worker(0, st(WorkerPhase::ReclaimPrepared, 1));
        let ws = p.worker_states();
        assert_eq!(ws.len(), 3);
        assert_eq!(ws[0], st(WorkerPhase::ReclaimPrepared, 1));
        assert_eq!(ws[2].phase, WorkerPhase::Scanning);
    }
}
