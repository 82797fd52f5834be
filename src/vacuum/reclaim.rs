//! vacuum/reclaim - цикл очистки: индексы, затем освобождение слотов heap.
//!
//! Слоты освобождаются только после того, как из всех индексов удалены
//! ссылки на них (иначе индекс указал бы на чужую, переиспользованную версию).
//! Страницу, которую не удалось взять под cleanup lock, второй проход
//! пропускает целиком: её версии останутся мёртвыми до следующего прогона.

use anyhow::Result;
use log::log;

use crate::page::HeapPage;
use crate::progress::VacuumPhase;
use crate::store::VmBits;
use crate::types::OffsetNo;
use crate::wal::WalRecord;

use super::page_proc::page_is_all_visible;
use super::worker::HeapWorker;

impl HeapWorker<'_, '_> {
    pub(super) fn reclaim_cycle(&mut self) -> Result<()> {
        let ctx = self.ctx;
        let progress = &ctx.svc.progress;

        // реплике нужен горизонт конфликта до того, как индексы начнут терять записи
        if self.stats.latest_removed_xid.is_valid() {
            ctx.log(&WalRecord::CleanupInfo {
                latest_removed_xid: self.stats.latest_removed_xid,
            })?;
        }

        let mine = self.sync.prepared(ctx.nindexes())?;
        progress.set_phase(VacuumPhase::VacuumIndex);
        for i in mine {
            self.indexes.bulk_delete(ctx, i, self.dead)?;
        }

        self.sync.reclaiming()?;
        progress.set_phase(VacuumPhase::VacuumHeap);
        self.vacuum_heap()?;

        self.sync.finished(self.dead, self.part)?;
        progress.dead_tuples_cleared();
        self.stats.num_index_scans += 1;
        progress.index_passes_done(self.stats.num_index_scans as u64);
        progress.set_phase(VacuumPhase::ScanHeap);
        Ok(())
    }

    /// Второй проход по heap: освободить слоты своей партиции.
    pub(super) fn vacuum_heap(&mut self) -> Result<()> {
        let ctx = self.ctx;
        let store = ctx.rel.store;
        let mut tuples = 0usize;
        let mut npages = 0u32;

        for (blkno, offsets) in self.part.page_runs() {
            ctx.svc.cancel.check()?;
            let Some(mut page) = store.try_cleanup_lock(blkno)? else {
                continue;
            };
            self.vacuum_page(&mut page, &offsets)?;
            let free = page.heap_free_space();
            drop(page);
            store.record_free_space(blkno, free);
            tuples += offsets.len();
            npages += 1;
        }
        self.stats.vacuumed_pages += npages;

        log!(
            ctx.level,
            "\"{}\": removed {} row versions in {} pages",
            ctx.name(),
            tuples,
            npages
        );
        Ok(())
    }

    /// Освободить перечисленные слоты страницы (под cleanup lock) и, если
    /// страница стала целиком видимой, отметить это на странице и в VM.
    pub(super) fn vacuum_page(&mut self, page: &mut HeapPage, offsets: &[OffsetNo]) -> Result<()> {
        let ctx = self.ctx;
        let blkno = page.page_no;
        ctx.svc.progress.page_vacuumed(blkno);

        for &off in offsets {
            page.set_unused(off)?;
        }
        page.repair_fragmentation();

        let lsn = ctx.log(&WalRecord::Clean {
            page: blkno,
            latest_removed_xid: self.stats.latest_removed_xid,
            redirected: Vec::new(),
            dead: Vec::new(),
            unused: offsets.to_vec(),
        })?;
        if lsn != 0 {
            page.lsn = lsn;
        }

        let (all_visible, cutoff, all_frozen) = page_is_all_visible(page, ctx)?;
        if all_visible {
            page.set_all_visible();
        }

        if page.is_all_visible() {
            let st = ctx.rel.vm.status(blkno);
            let mut flags = VmBits::NONE;
            if !st.contains(VmBits::ALL_VISIBLE) {
                flags |= VmBits::ALL_VISIBLE;
            }
            if !st.contains(VmBits::ALL_FROZEN) && all_frozen {
                flags |= VmBits::ALL_FROZEN;
            }
            if !flags.is_empty() {
                ctx.set_vm(page, flags, cutoff)?;
            }
        }
        Ok(())
    }
}
