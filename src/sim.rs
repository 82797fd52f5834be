//! sim - таблица в памяти со всеми коллабораторами движка.
//!
//! TableFixture собирает MemHeapStore, VM, блокировку, commit log, каталог,
//! WAL и индексы вокруг одного отношения и умеет гонять по нему vacuum.
//! Используется тестами и подкомандой `simulate` CLI.
//!
//! Модель транзакций фиксирована:
//! - LOADER_XID  - вставил исходные строки (committed, старше oldest xmin);
//! - DELETER_XID - удалил строки давно (committed, старше oldest xmin): Dead;
//! - RECENT_XID  - удалил недавно (committed, новее oldest xmin): RecentlyDead;
//! - RUNNING_XID - ещё идёт: InsertInProgress / DeleteInProgress.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use crate::catalog::{MemCatalog, RelationMeta};
use crate::config::VacuumConfig;
use crate::consts::DEFAULT_PAGE_SIZE;
use crate::index::{IndexAm, MemIndex};
use crate::interrupt::CancelToken;
use crate::page::item::{TupleHeader, XMAX_INVALID};
use crate::page::{HeapPage, HeapTuple, ItemId};
use crate::progress::VacuumProgress;
use crate::store::{HeapStore, MemHeapStore, MemRelationLock, MemVisibilityMap, VisibilityMap, VmBits};
use crate::types::{MultiXactId, OffsetNo, PageNo, TupleId, Xid};
use crate::vacuum::{
    vacuum_relation, HorizonsPolicy, Relation, RelationRunStats, ResourceBudget, RunContext,
    RunServices, VacuumOptions,
};
use crate::visibility::{CommitLogOracle, DeadItemPruner, NoopPruner, PagePruner};
use crate::wal::{MemWal, WalSink};

pub const LOADER_XID: Xid = Xid(100);
pub const DELETER_XID: Xid = Xid(200);
pub const RECENT_XID: Xid = Xid(1050);
pub const RUNNING_XID: Xid = Xid(1070);
pub const OLDEST_XMIN: Xid = Xid(1000);
pub const NEXT_XID: Xid = Xid(1100);
pub const NEXT_MULTI: MultiXactId = MultiXactId(10_000_000);

/// Полезная нагрузка строки фикстуры.
const ROW_BYTES: usize = 32;

pub struct TableFixtureBuilder {
    name: String,
    pages: PageNo,
    spare_pages: PageNo,
    live_per_page: usize,
    dead_per_page: usize,
    indexes: usize,
    page_size: usize,
    seed: Option<u64>,
    churn: f64,
    prune_dead_items: bool,
    without_wal: bool,
    config: VacuumConfig,
}

impl TableFixtureBuilder {
    pub fn pages(mut self, n: PageNo) -> Self {
        self.pages = n;
        self
    }

    /// Сколько страниц можно добавить после сборки (append_*_pages).
    pub fn spare_pages(mut self, n: PageNo) -> Self {
        self.spare_pages = n;
        self
    }

    pub fn live_per_page(mut self, n: usize) -> Self {
        self.live_per_page = n;
        self
    }

    /// Строки, удалённые DELETER_XID (мертвы для любого снимка).
    pub fn dead_per_page(mut self, n: usize) -> Self {
        self.dead_per_page = n;
        self
    }

    pub fn indexes(mut self, n: usize) -> Self {
        self.indexes = n;
        self
    }

    pub fn page_size(mut self, n: usize) -> Self {
        self.page_size = n;
        self
    }

    /// Случайное удаление: каждая живая строка удаляется с вероятностью churn.
    pub fn churn(mut self, seed: u64, churn: f64) -> Self {
        self.seed = Some(seed);
        self.churn = churn.clamp(0.0, 1.0);
        self
    }

    pub fn prune_dead_items(mut self, on: bool) -> Self {
        self.prune_dead_items = on;
        self
    }

    pub fn without_wal(mut self) -> Self {
        self.without_wal = true;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config = self.config.with_workers(n);
        self
    }

    pub fn work_mem_kb(mut self, kb: usize) -> Self {
        self.config = self.config.with_work_mem_kb(kb);
        self
    }

    pub fn skip_pages_threshold(mut self, n: u32) -> Self {
        self.config = self.config.with_skip_pages_threshold(n);
        self
    }

    pub fn disable_page_skipping(mut self, on: bool) -> Self {
        self.config = self.config.with_disable_page_skipping(on);
        self
    }

    pub fn aggressive(mut self, on: bool) -> Self {
        self.config = self.config.with_aggressive(on);
        self
    }

    pub fn freeze_min_age(mut self, age: u32) -> Self {
        let c = &self.config;
        let (table, mmin, mtable) = (
            c.freeze_table_age,
            c.multixact_freeze_min_age,
            c.multixact_freeze_table_age,
        );
        self.config = self.config.with_freeze_ages(age, table, mmin, mtable);
        self
    }

    pub fn truncate_timings(mut self, check_ms: u64, wait_ms: u64, timeout_ms: u64) -> Self {
        self.config = self.config.with_truncate_timings(check_ms, wait_ms, timeout_ms);
        self
    }

    pub fn old_snapshot_threshold_min(mut self, min: Option<u64>) -> Self {
        self.config = self.config.with_old_snapshot_threshold_min(min);
        self
    }

    pub fn verbose(mut self, on: bool) -> Self {
        self.config = self.config.with_verbose(on);
        self
    }

    /// Взять настройки прогона целиком (CLI: VacuumConfig::from_env + флаги).
    pub fn config(mut self, config: VacuumConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<TableFixture> {
        let mut store = MemHeapStore::new(
            self.name.clone(),
            self.page_size,
            self.pages + self.spare_pages,
        );
        if self.without_wal {
            store = store.without_wal();
        }

        let clog = CommitLogOracle::new();
        clog.commit(LOADER_XID);
        clog.commit(DELETER_XID);
        clog.commit(RECENT_XID);
        clog.begin(RUNNING_XID);

        let indexes: Vec<MemIndex> = (0..self.indexes)
            .map(|i| MemIndex::new(format!("{}_idx{}", self.name, i)))
            .collect();

        let mut rng = self.seed.map(StdRng::seed_from_u64);
        let mut ntuples = 0usize;
        for _ in 0..self.pages {
            let p = store.extend_initialized()?;
            let tids = store.with_page_mut(p, |page| -> Result<Vec<TupleId>> {
                let mut tids = Vec::with_capacity(self.live_per_page + self.dead_per_page);
                for i in 0..self.live_per_page + self.dead_per_page {
                    let mut h = TupleHeader::inserted(LOADER_XID);
                    let churned = rng.as_mut().map_or(false, |r| r.gen_bool(self.churn));
                    if i >= self.live_per_page || churned {
                        h = TupleHeader::deleted(LOADER_XID, DELETER_XID);
                    }
                    let off = page.add_tuple(HeapTuple::new(h, vec![0u8; ROW_BYTES]))?;
                    tids.push(TupleId::new(p, off));
                }
                Ok(tids)
            })??;
            ntuples += tids.len();
            for tid in tids {
                for idx in &indexes {
                    idx.insert(tid);
                }
            }
        }

        let catalog = MemCatalog::new();
        let mut meta = RelationMeta::new(self.name.clone());
        meta.relpages = self.pages;
        meta.reltuples = ntuples as f64;
        meta.relfrozenxid = LOADER_XID;
        meta.relminmxid = MultiXactId::FIRST;
        catalog.register(meta);

        let policy = self
            .config
            .horizons_policy(OLDEST_XMIN, NEXT_XID, NEXT_MULTI, NEXT_MULTI);
        let pruner: Box<dyn PagePruner> = if self.prune_dead_items {
            Box::new(DeadItemPruner)
        } else {
            Box::new(NoopPruner)
        };

        Ok(TableFixture {
            name: self.name,
            store,
            vm: MemVisibilityMap::new(),
            lock: MemRelationLock::new(),
            clog,
            catalog,
            wal: MemWal::new(),
            indexes,
            progress: Arc::new(VacuumProgress::new()),
            cancel: CancelToken::new(),
            options: self.config.options(),
            budget: self.config.budget(),
            policy,
            pruner,
        })
    }
}

pub struct TableFixture {
    pub name: String,
    pub store: MemHeapStore,
    pub vm: MemVisibilityMap,
    pub lock: MemRelationLock,
    pub clog: CommitLogOracle,
    pub catalog: MemCatalog,
    pub wal: MemWal,
    pub indexes: Vec<MemIndex>,
    pub progress: Arc<VacuumProgress>,
    pub cancel: CancelToken,
    pub options: VacuumOptions,
    pub budget: ResourceBudget,
    pub policy: HorizonsPolicy,
    pub pruner: Box<dyn PagePruner>,
}

impl TableFixture {
    pub fn builder(name: impl Into<String>) -> TableFixtureBuilder {
        TableFixtureBuilder {
            name: name.into(),
            pages: 10,
            spare_pages: 16,
            live_per_page: 4,
            dead_per_page: 0,
            indexes: 0,
            page_size: DEFAULT_PAGE_SIZE,
            seed: None,
            churn: 0.0,
            prune_dead_items: false,
            without_wal: false,
            config: VacuumConfig::default(),
        }
    }

    // ----- изменение данных -----

    fn add_rows(&self, page: PageNo, n: usize, header: TupleHeader) -> Result<Vec<TupleId>> {
        let tids = self.store.with_page_mut(page, |pg| -> Result<Vec<TupleId>> {
            // вставка снимает all-visible, как в обычном heap insert
            pg.clear_all_visible();
            (0..n)
                .map(|_| {
                    pg.add_tuple(HeapTuple::new(header, vec![0u8; ROW_BYTES]))
                        .map(|off| TupleId::new(page, off))
                })
                .collect()
        })??;
        self.vm.clear(page, VmBits::VALID);
        for tid in &tids {
            for idx in &self.indexes {
                idx.insert(*tid);
            }
        }
        Ok(tids)
    }

    /// Вставить n зафиксированных строк.
    pub fn insert(&self, page: PageNo, n: usize) -> Result<Vec<TupleId>> {
        self.add_rows(page, n, TupleHeader::inserted(LOADER_XID))
    }

    /// Вставить n строк незавершённой транзакцией.
    pub fn insert_in_progress(&self, page: PageNo, n: usize) -> Result<Vec<TupleId>> {
        self.add_rows(page, n, TupleHeader::inserted(RUNNING_XID))
    }

    fn delete_with(&self, page: PageNo, n: usize, xmax: Xid) -> Result<Vec<TupleId>> {
        let tids = self.store.with_page_mut(page, |pg| {
            pg.clear_all_visible();
            let mut out = Vec::new();
            for (i, it) in pg.items.iter_mut().enumerate() {
                if out.len() == n {
                    break;
                }
                if let ItemId::Normal(t) = it {
                    if t.header.xmax_unset() {
                        t.header.xmax = xmax.0;
                        t.header.clear(XMAX_INVALID);
                        out.push(TupleId::new(page, (i + 1) as OffsetNo));
                    }
                }
            }
            out
        })?;
        self.vm.clear(page, VmBits::VALID);
        if tids.len() < n {
            return Err(anyhow!(
                "page {} has only {} live rows, {} requested",
                page,
                tids.len(),
                n
            ));
        }
        Ok(tids)
    }

    /// Удалить n живых строк давно завершённой транзакцией.
    pub fn delete(&self, page: PageNo, n: usize) -> Result<Vec<TupleId>> {
        self.delete_with(page, n, DELETER_XID)
    }

    /// Удалить n живых строк транзакцией новее oldest xmin.
    pub fn delete_recent(&self, page: PageNo, n: usize) -> Result<Vec<TupleId>> {
        self.delete_with(page, n, RECENT_XID)
    }

    /// Выставить all-visible на странице и в VM (как сделал бы прошлый vacuum).
    pub fn mark_all_visible(&self, page: PageNo, frozen: bool) -> Result<()> {
        self.store.with_page_mut(page, |pg| pg.set_all_visible())?;
        let bits = if frozen { VmBits::VALID } else { VmBits::ALL_VISIBLE };
        self.vm.set(page, bits);
        Ok(())
    }

    /// Дописать n пустых инициализированных страниц в конец.
    pub fn append_empty_pages(&self, n: PageNo) -> Result<()> {
        for _ in 0..n {
            self.store.extend_initialized()?;
        }
        Ok(())
    }

    /// Дописать n неинициализированных ("новых") страниц.
    pub fn append_new_pages(&self, n: PageNo) -> Result<()> {
        for _ in 0..n {
            self.store.extend()?;
        }
        Ok(())
    }

    pub fn pin(&self, page: PageNo) {
        self.store.pin(page);
    }

    pub fn unpin(&self, page: PageNo) {
        self.store.unpin(page);
    }

    // ----- прогон -----

    pub fn meta(&self) -> RelationMeta {
        self.catalog
            .relation(&self.name)
            .unwrap_or_else(|| RelationMeta::new(self.name.clone()))
    }

    pub fn relation(&self) -> Relation<'_> {
        Relation {
            meta: self.meta(),
            store: &self.store,
            vm: &self.vm,
            lock: &self.lock,
            indexes: self.indexes.iter().map(|i| i as &dyn IndexAm).collect(),
        }
    }

    pub fn services<'a>(&'a self, wal: &'a dyn WalSink) -> RunServices<'a> {
        RunServices {
            oracle: &self.clog,
            pruner: self.pruner.as_ref(),
            wal,
            catalog: &self.catalog,
            cancel: self.cancel.clone(),
            progress: Arc::clone(&self.progress),
        }
    }

    /// Vacuum с WAL в памяти (self.wal).
    pub fn run(&self) -> Result<RelationRunStats> {
        self.run_with_wal(&self.wal)
    }

    pub fn run_with_wal(&self, wal: &dyn WalSink) -> Result<RelationRunStats> {
        let rel = self.relation();
        let svc = self.services(wal);
        vacuum_relation(&rel, &self.options, &self.policy, &self.budget, &svc)
    }

    /// Контекст прогона без самого прогона (проверки отдельных шагов).
    pub fn with_context<R>(&self, f: impl FnOnce(&RunContext<'_>) -> R) -> R {
        let rel = self.relation();
        let svc = self.services(&self.wal);
        let ctx = RunContext::new(&rel, &svc, &self.options, &self.policy, &self.budget);
        f(&ctx)
    }

    // ----- проверки -----

    pub fn nblocks(&self) -> PageNo {
        self.store.nblocks()
    }

    pub fn page(&self, page: PageNo) -> Result<HeapPage> {
        self.store.with_page(page, |p| p.clone())
    }

    /// Число строк, видимых всем (xmin зафиксирован, xmax не выставлен).
    pub fn live_rows(&self) -> Result<usize> {
        let mut n = 0;
        for p in 0..self.nblocks() {
            n += self.store.with_page(p, |pg| {
                pg.items
                    .iter()
                    .filter(|it| match it {
                        ItemId::Normal(t) => t.header.xmax_unset(),
                        _ => false,
                    })
                    .count()
            })?;
        }
        Ok(n)
    }

    /// Индексные ссылки на слоты, которых больше нет (Unused или за концом
    /// отношения). После корректного прогона всегда 0.
    pub fn dangling_index_refs(&self) -> Result<usize> {
        let nblocks = self.nblocks();
        let mut n = 0;
        for idx in &self.indexes {
            for tid in idx.entries() {
                if tid.page >= nblocks {
                    n += 1;
                    continue;
                }
                let used = self
                    .store
                    .with_page(tid.page, |pg| pg.item(tid.offset).map_or(false, ItemId::is_used))?;
                if !used {
                    n += 1;
                }
            }
        }
        Ok(n)
    }

    /// Страницы, где VM утверждает all-visible, а на странице есть не видимые
    /// всем строки. После корректного прогона всегда пусто.
    pub fn vm_violations(&self) -> Result<Vec<PageNo>> {
        let mut out = Vec::new();
        for p in 0..self.nblocks() {
            if !self.vm.status(p).contains(VmBits::ALL_VISIBLE) {
                continue;
            }
            let bad = self.store.with_page(p, |pg| {
                pg.items.iter().any(|it| match it {
                    ItemId::Normal(t) => !t.header.xmax_unset() || t.header.xmin == RUNNING_XID,
                    ItemId::Dead => true,
                    _ => false,
                })
            })?;
            if bad {
                out.push(p);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_registers_relation_and_indexes_every_row() -> Result<()> {
        let fx = TableFixture::builder("t")
            .pages(3)
            .live_per_page(2)
            .dead_per_page(1)
            .indexes(2)
            .build()?;
        assert_eq!(fx.nblocks(), 3);
        assert_eq!(fx.meta().relpages, 3);
        assert_eq!(fx.meta().reltuples, 9.0);
        assert_eq!(fx.live_rows()?, 6);
        assert!(fx.indexes.iter().all(|i| i.len() == 9));
        assert_eq!(fx.dangling_index_refs()?, 0);
        Ok(())
    }

    #[test]
    fn churn_is_reproducible_per_seed() -> Result<()> {
        let a = TableFixture::builder("a").pages(8).churn(7, 0.3).build()?;
        let b = TableFixture::builder("b").pages(8).churn(7, 0.3).build()?;
        assert_eq!(a.live_rows()?, b.live_rows()?);
        Ok(())
    }

    #[test]
    fn delete_clears_visibility() -> Result<()> {
        let fx = TableFixture::builder("t").pages(2).build()?;
        fx.mark_all_visible(1, true)?;
        fx.delete(1, 2)?;
        assert!(fx.vm.status(1).is_empty());
        assert!(!fx.page(1)?.is_all_visible());
        assert!(fx.delete(1, 10).is_err());
        Ok(())
    }
}
