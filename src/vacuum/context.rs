//! vacuum/context - неизменяемый контекст прогона, общий для всех воркеров.

use anyhow::Result;
use std::time::Duration;

use crate::metrics::record_vm_set;
use crate::page::HeapPage;
use crate::store::VmBits;
use crate::types::{PageNo, Xid};
use crate::visibility::FreezeCutoffs;
use crate::wal::WalRecord;

use super::dead_tuples::capacity_for;
use super::horizons::{HorizonsPolicy, RunHorizons};
use super::stats::RelationRunStats;
use super::{Relation, ResourceBudget, RunServices, VacuumOptions};

pub struct RunContext<'r> {
    pub rel: &'r Relation<'r>,
    pub svc: &'r RunServices<'r>,
    pub horizons: RunHorizons,
    pub budget: ResourceBudget,
    pub level: log::Level,
    pub disable_page_skipping: bool,
    pub old_snapshot_threshold: Option<Duration>,
    /// Число страниц на старте прогона; скан дальше не идёт.
    pub nblocks: PageNo,
    pub max_dead_tuples: usize,
}

impl<'r> RunContext<'r> {
    pub fn new(
        rel: &'r Relation<'r>,
        svc: &'r RunServices<'r>,
        options: &VacuumOptions,
        policy: &HorizonsPolicy,
        budget: &ResourceBudget,
    ) -> Self {
        let horizons = policy.compute(&rel.meta, options);
        Self {
            rel,
            svc,
            horizons,
            budget: *budget,
            level: if options.verbose {
                log::Level::Info
            } else {
                log::Level::Debug
            },
            disable_page_skipping: options.disable_page_skipping,
            old_snapshot_threshold: options.old_snapshot_threshold,
            nblocks: rel.store.nblocks(),
            max_dead_tuples: capacity_for(rel.indexes.len(), budget.work_mem_kb, rel.meta.relpages),
        }
    }

    pub fn name(&self) -> &str {
        &self.rel.meta.name
    }

    pub fn nindexes(&self) -> usize {
        self.rel.indexes.len()
    }

    pub fn has_indexes(&self) -> bool {
        !self.rel.indexes.is_empty()
    }

    pub fn needs_wal(&self) -> bool {
        self.rel.store.needs_wal()
    }

    pub fn aggressive(&self) -> bool {
        self.horizons.aggressive
    }

    pub fn cutoffs(&self) -> FreezeCutoffs {
        self.horizons.cutoffs()
    }

    /// Счётчики воркера/прогона, заполненные стартовыми значениями.
    pub fn new_stats(&self) -> RelationRunStats {
        RelationRunStats {
            relation: self.name().to_string(),
            aggressive: self.aggressive(),
            has_indexes: self.has_indexes(),
            old_rel_pages: self.rel.meta.relpages,
            old_rel_tuples: self.rel.meta.reltuples,
            max_dead_tuples: self.max_dead_tuples,
            rel_pages: self.nblocks,
            ..RelationRunStats::default()
        }
    }

    pub fn early_pruning_enabled(&self) -> bool {
        self.old_snapshot_threshold.is_some()
    }

    /// Журналирует (если нужно) и возвращает LSN записи, 0 - без WAL.
    pub fn log(&self, rec: &WalRecord) -> Result<u64> {
        if !self.needs_wal() {
            return Ok(0);
        }
        self.svc.wal.append(rec)
    }

    /// Выставить биты VM по странице, которую держим под cleanup lock.
    /// Запись VISIBLE идёт в WAL, LSN проставляется на страницу.
    pub fn set_vm(&self, page: &mut HeapPage, bits: VmBits, cutoff: Xid) -> Result<()> {
        let lsn = self.log(&WalRecord::Visible {
            page: page.page_no,
            cutoff,
            flags: bits.bits(),
        })?;
        if lsn != 0 {
            page.lsn = lsn;
        }
        self.rel.vm.set(page.page_no, bits);
        record_vm_set();
        Ok(())
    }
}
