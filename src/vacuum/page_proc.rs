//! vacuum/page_proc - обработка одной страницы при скане (PageProcessor).
//!
//! Шаги:
//! - cleanup lock; если страница закреплена - либо пропуск, либо (агрессивно /
//!   принудительно) проверка под share lock и ожидание cleanup lock;
//! - новые и пустые страницы: инициализация / отметка all-visible;
//! - prune, затем классификация каждого слота: мёртвые версии уходят в
//!   DeadTupleStore, живые - кандидаты на заморозку;
//! - заморозка (WAL FREEZE), при отсутствии индексов - немедленная очистка;
//! - согласование бита страницы и VM (с исправлением рассогласований).

use anyhow::Result;
use log::warn;

use crate::metrics::{
    record_page_pinskipped, record_page_scanned, record_tuples_frozen, record_tuples_removed,
    record_vm_anomaly,
};
use crate::page::{encode_page, HeapPage, ItemId};
use crate::store::VmBits;
use crate::types::{OffsetNo, PageNo, TupleId, Xid};
use crate::visibility::prune::advance_latest_removed_xid;
use crate::visibility::{FreezeCutoffs, FreezePlan, TupleVisibility, VisibilityOracle};
use crate::wal::WalRecord;

use super::context::RunContext;
use super::scan::{force_check_page, NextPage};
use super::worker::HeapWorker;

/// Нужна ли странице заморозка (путь без cleanup lock) и есть ли на ней кортежи.
pub fn check_needs_freeze(
    page: &HeapPage,
    oracle: &dyn VisibilityOracle,
    cutoffs: &FreezeCutoffs,
) -> (bool, bool) {
    // новую страницу всё равно надо инициализировать
    if page.is_new() {
        return (true, false);
    }
    if page.is_empty() {
        return (false, false);
    }
    let mut hastup = false;
    for (_, it) in page.iter() {
        if !it.is_used() {
            continue;
        }
        hastup = true;
        if let ItemId::Normal(t) = it {
            if oracle.needs_freeze(&t.header, cutoffs) {
                return (true, hastup);
            }
        }
    }
    (false, hastup)
}

/// Видна ли вся страница всем (после освобождения слотов).
/// Возвращает (all_visible, visibility_cutoff_xid, all_frozen).
pub fn page_is_all_visible(page: &mut HeapPage, ctx: &RunContext<'_>) -> Result<(bool, Xid, bool)> {
    let oldest_xmin = ctx.horizons.oldest_xmin;
    let oracle = ctx.svc.oracle;
    let mut cutoff = Xid::INVALID;
    let mut all_frozen = true;

    for it in page.items.iter_mut() {
        let t = match it {
            ItemId::Unused | ItemId::Redirect(_) => continue,
            // на Dead указатель могут ссылаться индексы
            ItemId::Dead => return Ok((false, cutoff, false)),
            ItemId::Normal(t) => t,
        };
        match oracle.satisfies_vacuum(&mut t.header, oldest_xmin)? {
            TupleVisibility::Live => {
                if !t.header.xmin_committed() {
                    return Ok((false, cutoff, false));
                }
                let xmin = t.header.visible_xmin();
                if !xmin.precedes(oldest_xmin) {
                    return Ok((false, cutoff, false));
                }
                if xmin.follows(cutoff) {
                    cutoff = xmin;
                }
                if all_frozen && oracle.needs_eventual_freeze(&t.header) {
                    all_frozen = false;
                }
            }
            _ => return Ok((false, cutoff, false)),
        }
    }
    Ok((true, cutoff, all_frozen))
}

impl HeapWorker<'_, '_> {
    fn pinskipped(&mut self, hastup: bool, blkno: PageNo) {
        self.stats.pinskipped_pages += 1;
        record_page_pinskipped();
        if hastup {
            self.stats.nonempty_pages = blkno + 1;
        }
    }

    pub(super) fn process_page(&mut self, np: NextPage) -> Result<()> {
        let ctx = self.ctx;
        let store = ctx.rel.store;
        let blkno = np.page;

        let mut page = match store.try_cleanup_lock(blkno)? {
            Some(g) => g,
            None => {
                // страницу держит кто-то ещё
                if !ctx.aggressive() && !force_check_page(ctx, &self.stats, blkno) {
                    self.pinskipped(false, blkno);
                    return Ok(());
                }
                let (needs_freeze, hastup) = {
                    let g = store.share_lock(blkno)?;
                    check_needs_freeze(&g, ctx.svc.oracle, &ctx.cutoffs())
                };
                if !needs_freeze {
                    // считаем просмотренной: всё нужное о ней уже знаем
                    self.stats.scanned_pages += 1;
                    self.pinskipped(hastup, blkno);
                    return Ok(());
                }
                if !ctx.aggressive() {
                    self.pinskipped(hastup, blkno);
                    return Ok(());
                }
                store.cleanup_lock(blkno)?
            }
        };

        self.stats.scanned_pages += 1;
        record_page_scanned();

        if page.is_new() {
            // страница могла быть только что добавлена конкурентным extend
            drop(page);
            store.wait_for_extension()?;
            let mut page = store.cleanup_lock(blkno)?;
            if page.is_new() {
                warn!(
                    "relation \"{}\" page {} is uninitialized --- fixing",
                    ctx.name(),
                    blkno
                );
                page.init();
                self.stats.empty_pages += 1;
            }
            let free = page.heap_free_space();
            drop(page);
            store.record_free_space(blkno, free);
            return Ok(());
        }

        if page.is_empty() {
            self.stats.empty_pages += 1;
            let free = page.heap_free_space();
            if !page.is_all_visible() {
                if page.lsn == 0 {
                    let lsn = ctx.log(&WalRecord::NewPage {
                        page: blkno,
                        image: encode_page(&page),
                    })?;
                    if lsn != 0 {
                        page.lsn = lsn;
                    }
                }
                page.set_all_visible();
                ctx.set_vm(&mut page, VmBits::VALID, Xid::INVALID)?;
            }
            drop(page);
            store.record_free_space(blkno, free);
            return Ok(());
        }

        let oldest_xmin = ctx.horizons.oldest_xmin;
        let oracle = ctx.svc.oracle;
        let cutoffs = ctx.cutoffs();

        let pruned = ctx.svc.pruner.prune(&mut page, oldest_xmin, oracle)?;
        if pruned.changed() {
            let lsn = ctx.log(&WalRecord::Clean {
                page: blkno,
                latest_removed_xid: pruned.latest_removed_xid,
                redirected: pruned.redirected.clone(),
                dead: pruned.now_dead.clone(),
                unused: pruned.now_unused.clone(),
            })?;
            if lsn != 0 {
                page.lsn = lsn;
            }
        }
        self.stats.tuples_deleted += pruned.removed as f64;
        record_tuples_removed(pruned.removed);
        if pruned.latest_removed_xid.is_valid()
            && (!self.stats.latest_removed_xid.is_valid()
                || pruned.latest_removed_xid.follows(self.stats.latest_removed_xid))
        {
            self.stats.latest_removed_xid = pruned.latest_removed_xid;
        }

        let prev_dead_count = self.part.len();
        let mut all_visible = true;
        let mut all_frozen = true;
        let mut has_dead_tuples = false;
        let mut hastup = false;
        let mut visibility_cutoff_xid = Xid::INVALID;
        let mut plans: Vec<FreezePlan> = Vec::new();

        for i in 0..page.items.len() {
            let off = (i + 1) as OffsetNo;
            let tid = TupleId::new(blkno, off);
            let tuple = match &mut page.items[i] {
                ItemId::Unused => {
                    self.stats.unused_items += 1.0;
                    continue;
                }
                ItemId::Redirect(_) => {
                    hastup = true;
                    continue;
                }
                ItemId::Dead => {
                    // уже без хранилища: ждёт только удаления индексных ссылок
                    self.record_dead(tid);
                    all_visible = false;
                    continue;
                }
                ItemId::Normal(t) => t,
            };

            let mut tupgone = false;
            let mut kept_dead = false;
            match oracle.satisfies_vacuum(&mut tuple.header, oldest_xmin)? {
                TupleVisibility::Dead => {
                    // члены HOT-цепочек остаются до перестройки цепочки
                    if tuple.header.is_hot_updated() || tuple.header.is_heap_only() {
                        self.stats.new_dead_tuples += 1.0;
                        kept_dead = true;
                    } else {
                        tupgone = true;
                    }
                    all_visible = false;
                }
                TupleVisibility::Live => {
                    if all_visible {
                        let xmin = tuple.header.visible_xmin();
                        if !tuple.header.xmin_committed() || !xmin.precedes(oldest_xmin) {
                            all_visible = false;
                        } else if xmin.follows(visibility_cutoff_xid) {
                            visibility_cutoff_xid = xmin;
                        }
                    }
                }
                TupleVisibility::RecentlyDead => {
                    self.stats.new_dead_tuples += 1.0;
                    all_visible = false;
                }
                TupleVisibility::InsertInProgress | TupleVisibility::DeleteInProgress => {
                    all_visible = false;
                }
            }

            if tupgone {
                self.record_dead(tid);
                advance_latest_removed_xid(&tuple.header, &mut self.stats.latest_removed_xid);
                self.stats.tuples_deleted += 1.0;
                record_tuples_removed(1);
                has_dead_tuples = true;
            } else if kept_dead {
                // мёртвую версию не замораживаем: только ждём чистки цепочки
                self.stats.scanned_tuples += 1.0;
                hastup = true;
                all_frozen = false;
            } else {
                self.stats.scanned_tuples += 1.0;
                hastup = true;
                let d = oracle.prepare_freeze(off, &tuple.header, &cutoffs);
                if let Some(p) = d.plan {
                    plans.push(p);
                }
                if !d.totally_frozen {
                    all_frozen = false;
                }
            }
        }

        if !plans.is_empty() {
            for p in &plans {
                if let Some(ItemId::Normal(t)) = page.item_mut(p.offset) {
                    p.execute(&mut t.header);
                }
            }
            let nfrozen = plans.len() as u64;
            let lsn = ctx.log(&WalRecord::Freeze {
                page: blkno,
                cutoff: cutoffs.freeze_limit,
                plans,
            })?;
            if lsn != 0 {
                page.lsn = lsn;
            }
            self.stats.tuples_frozen += nfrozen;
            record_tuples_frozen(nfrozen);
        }

        // без индексов чистим сразу, второго прохода не будет
        if !ctx.has_indexes() && !self.part.is_empty() {
            let offsets: Vec<OffsetNo> = self
                .part
                .to_vec()
                .into_iter()
                .filter(|t| t.page == blkno)
                .map(|t| t.offset)
                .collect();
            self.vacuum_page(&mut page, &offsets)?;
            has_dead_tuples = false;
            self.part.clear();
            ctx.svc.progress.dead_tuples_cleared();
            self.stats.vacuumed_pages += 1;
        }

        let freespace = page.heap_free_space();
        let vm = ctx.rel.vm;

        if all_visible && !np.all_visible_according_to_vm {
            let mut flags = VmBits::ALL_VISIBLE;
            if all_frozen {
                flags |= VmBits::ALL_FROZEN;
            }
            page.set_all_visible();
            ctx.set_vm(&mut page, flags, visibility_cutoff_xid)?;
        } else if np.all_visible_according_to_vm
            && !page.is_all_visible()
            && vm.status(blkno).contains(VmBits::ALL_VISIBLE)
        {
            warn!(
                "page is not marked all-visible but visibility map bit is set in relation \"{}\" page {}",
                ctx.name(),
                blkno
            );
            vm.clear(blkno, VmBits::VALID);
            record_vm_anomaly();
        } else if page.is_all_visible() && has_dead_tuples {
            warn!(
                "page containing dead tuples is marked as all-visible in relation \"{}\" page {}",
                ctx.name(),
                blkno
            );
            page.clear_all_visible();
            vm.clear(blkno, VmBits::VALID);
            record_vm_anomaly();
        } else if np.all_visible_according_to_vm
            && all_visible
            && all_frozen
            && !vm.status(blkno).contains(VmBits::ALL_FROZEN)
        {
            ctx.set_vm(&mut page, VmBits::ALL_FROZEN, Xid::INVALID)?;
        }
        drop(page);

        if hastup {
            self.stats.nonempty_pages = blkno + 1;
        }
        // страницу с новыми мёртвыми версиями FSM узнает после очистки
        if self.part.len() == prev_dead_count {
            store.record_free_space(blkno, freespace);
        }
        Ok(())
    }
}
