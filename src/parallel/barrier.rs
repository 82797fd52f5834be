//! parallel/barrier - барьер фаз параллельного vacuum.
//!
//! Каждый воркер публикует (phase, round) под общим мьютексом; ожидание -
//! condvar, будится broadcast'ом при любой смене состояния. Мьютекс никогда не
//! держится во время I/O: под ним только чтение/запись состояний и (для
//! последнего прибывшего на Finished) очистка общего DeadTupleStore.
//!
//! Кворумы для раунда r (Complete-воркеры всегда засчитываются):
//! - Prepared:   все в {ReclaimPrepared, Reclaiming, ReclaimFinished}@r;
//! - Reclaiming: все в {Reclaiming, ReclaimFinished}@r;
//! - Finished:   все в ReclaimFinished@r либо уже в {Scanning, ReclaimPrepared}@r+1
//!   (тот, кто прошёл Finished раньше, мог успеть уйти в следующий раунд);
//! - AllComplete: все в Complete.
//!
//! Переход ReclaimFinished -> Scanning увеличивает round.

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::metrics::record_barrier_wait;
use crate::progress::VacuumProgress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerPhase {
    Startup,
    Scanning,
    ReclaimPrepared,
    Reclaiming,
    ReclaimFinished,
    Complete,
}

impl WorkerPhase {
    /// Таблица допустимых переходов.
    pub fn can_transition(self, to: WorkerPhase) -> bool {
        use WorkerPhase::*;
        matches!(
            (self, to),
            (Startup, Scanning)
                | (Scanning, ReclaimPrepared)
                | (ReclaimPrepared, Reclaiming)
                | (Reclaiming, ReclaimFinished)
                | (ReclaimFinished, Scanning)
                | (Startup, Complete)
                | (Scanning, Complete)
                | (ReclaimFinished, Complete)
        )
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerState {
    pub phase: WorkerPhase,
    pub round: u64,
}

impl WorkerState {
    fn startup() -> Self {
        Self {
            phase: WorkerPhase::Startup,
            round: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == WorkerPhase::Complete
    }
}

/// Точка встречи внутри цикла очистки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rendezvous {
    Prepared,
    Reclaiming,
    Finished,
}

impl Rendezvous {
    pub fn phase(self) -> WorkerPhase {
        match self {
            Rendezvous::Prepared => WorkerPhase::ReclaimPrepared,
            Rendezvous::Reclaiming => WorkerPhase::Reclaiming,
            Rendezvous::Finished => WorkerPhase::ReclaimFinished,
        }
    }

    /// Засчитывается ли состояние другого воркера в кворум раунда r.
    pub fn satisfied_by(self, w: &WorkerState, r: u64) -> bool {
        use WorkerPhase::*;
        if w.is_complete() {
            return true;
        }
        match self {
            Rendezvous::Prepared => {
                w.round == r && matches!(w.phase, ReclaimPrepared | Reclaiming | ReclaimFinished)
            }
            Rendezvous::Reclaiming => w.round == r && matches!(w.phase, Reclaiming | ReclaimFinished),
            Rendezvous::Finished => {
                (w.round == r && w.phase == ReclaimFinished)
                    || (w.round == r + 1 && matches!(w.phase, Scanning | ReclaimPrepared))
            }
        }
    }
}

#[derive(Debug)]
struct BarrierState {
    workers: Vec<WorkerState>,
    aborted: bool,
}

#[derive(Debug)]
pub struct PhaseBarrier {
    state: Mutex<BarrierState>,
    changed: Condvar,
    progress: Option<Arc<VacuumProgress>>,
}

impl PhaseBarrier {
    pub fn new(nworkers: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                workers: vec![WorkerState::startup(); nworkers],
                aborted: false,
            }),
            changed: Condvar::new(),
            progress: None,
        }
    }

    /// Дублировать каждый переход воркера в progress (наблюдение снаружи).
    pub fn with_progress(mut self, progress: Arc<VacuumProgress>) -> Self {
        if let Ok(st) = self.state.get_mut() {
            for (id, w) in st.workers.iter().enumerate() {
                progress.publish_worker(id, *w);
            }
        }
        self.progress = Some(progress);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, BarrierState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("parallel vacuum barrier poisoned"))
    }

    pub fn nworkers(&self) -> Result<usize> {
        Ok(self.lock()?.workers.len())
    }

    pub fn snapshot(&self) -> Result<Vec<WorkerState>> {
        Ok(self.lock()?.workers.clone())
    }

    pub fn state(&self, id: usize) -> Result<WorkerState> {
        self.lock()?
            .workers
            .get(id)
            .copied()
            .ok_or_else(|| anyhow!("no parallel vacuum worker {}", id))
    }

    fn transition(&self, st: &mut BarrierState, id: usize, to: WorkerPhase) -> Result<WorkerState> {
        if st.aborted {
            bail!("parallel vacuum aborted");
        }
        let w = st
            .workers
            .get_mut(id)
            .ok_or_else(|| anyhow!("no parallel vacuum worker {}", id))?;
        if !w.phase.can_transition(to) {
            bail!(
                "parallel vacuum worker {}: invalid phase transition {} -> {}",
                id,
                w.phase,
                to
            );
        }
        if w.phase == WorkerPhase::ReclaimFinished && to == WorkerPhase::Scanning {
            w.round += 1;
        }
        w.phase = to;
        if let Some(p) = &self.progress {
            p.publish_worker(id, *w);
        }
        Ok(*w)
    }

    /// Сменить фазу без ожидания (Scanning, Complete).
    pub fn advance(&self, id: usize, to: WorkerPhase) -> Result<WorkerState> {
        let mut st = self.lock()?;
        let w = self.transition(&mut st, id, to)?;
        drop(st);
        self.changed.notify_all();
        Ok(w)
    }

    /// Перейти в фазу точки встречи и ждать кворума своего раунда.
    ///
    /// on_last вызывается (под мьютексом) ровно одним воркером - тем, чьё
    /// прибытие замкнуло кворум; остальные выходят только после него.
    /// Возвращает снимок состояний на момент прохождения.
    pub fn arrive_and_wait(
        &self,
        id: usize,
        rv: Rendezvous,
        on_last: impl FnOnce(),
    ) -> Result<Vec<WorkerState>> {
        let mut st = self.lock()?;
        let me = self.transition(&mut st, id, rv.phase())?;
        let round = me.round;
        let quorum = |st: &BarrierState| st.workers.iter().all(|w| rv.satisfied_by(w, round));

        if quorum(&*st) {
            on_last();
            let snap = st.workers.clone();
            drop(st);
            self.changed.notify_all();
            return Ok(snap);
        }

        self.changed.notify_all();
        record_barrier_wait();
        loop {
            st = self
                .changed
                .wait(st)
                .map_err(|_| anyhow!("parallel vacuum barrier poisoned"))?;
            if st.aborted {
                bail!("parallel vacuum aborted while waiting at {:?}", rv);
            }
            if quorum(&*st) {
                return Ok(st.workers.clone());
            }
        }
    }

    /// Перейти в Complete и сообщить ожидающим.
    pub fn complete(&self, id: usize) -> Result<()> {
        self.advance(id, WorkerPhase::Complete).map(|_| ())
    }

    /// Ждать, пока все воркеры не завершат скан.
    pub fn wait_all_complete(&self) -> Result<()> {
        let mut st = self.lock()?;
        let mut waited = false;
        loop {
            if st.aborted {
                bail!("parallel vacuum aborted while waiting for completion");
            }
            if st.workers.iter().all(WorkerState::is_complete) {
                return Ok(());
            }
            if !waited {
                record_barrier_wait();
                waited = true;
            }
            st = self
                .changed
                .wait(st)
                .map_err(|_| anyhow!("parallel vacuum barrier poisoned"))?;
        }
    }

    /// Прервать прогон: все текущие и будущие ожидания вернут ошибку.
    pub fn abort(&self) {
        let mut st = match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        st.aborted = true;
        drop(st);
        self.changed.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        match self.state.lock() {
            Ok(g) => g.aborted,
            Err(p) => p.into_inner().aborted,
        }
    }
}
