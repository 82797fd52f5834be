//! vacuum/scan - выбор следующей страницы для просмотра (HeapScanner).
//!
//! Два варианта:
//! - SerialScan   - идёт по порядку и пропускает только длинные (>= порога)
//!   серии страниц, которые VM считает all-visible (all-frozen в агрессивном режиме);
//!   короткие серии читаются, чтобы не ломать read-ahead;
//! - ParallelScan - страницы раздаются общим атомарным курсором, решение о
//!   пропуске принимается по каждой выданной странице отдельно.
//!
//! Последняя страница отношения никогда не пропускается, если после скана
//! возможен truncate: проверка "есть ли на ней кортежи" нужна для подсчёта
//! nonempty_pages.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::metrics::record_page_frozenskipped;
use crate::store::VmBits;
use crate::types::PageNo;

use super::context::RunContext;
use super::stats::RelationRunStats;
use super::truncate::should_attempt_truncation;

/// Страница к обработке и мнение VM о ней на момент выбора.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextPage {
    pub page: PageNo,
    pub all_visible_according_to_vm: bool,
}

pub trait HeapScanner {
    fn next_page(&mut self, ctx: &RunContext<'_>, stats: &mut RelationRunStats) -> Option<NextPage>;
}

/// Последняя страница при возможном truncate всегда читается.
pub(crate) fn force_check_page(ctx: &RunContext<'_>, stats: &RelationRunStats, page: PageNo) -> bool {
    stats.rel_pages > 0
        && page == stats.rel_pages - 1
        && should_attempt_truncation(
            stats.rel_pages,
            stats.nonempty_pages,
            ctx.early_pruning_enabled(),
        )
}

fn skippable(ctx: &RunContext<'_>, page: PageNo) -> bool {
    let st = ctx.rel.vm.status(page);
    if ctx.aggressive() {
        st.contains(VmBits::ALL_FROZEN)
    } else {
        st.contains(VmBits::ALL_VISIBLE)
    }
}

#[derive(Debug)]
pub struct SerialScan {
    nblocks: PageNo,
    cblock: PageNo,
    next_unskippable: PageNo,
    skipping_blocks: bool,
    started: bool,
}

impl SerialScan {
    pub fn new(nblocks: PageNo) -> Self {
        Self {
            nblocks,
            cblock: 0,
            next_unskippable: 0,
            skipping_blocks: false,
            started: false,
        }
    }

    fn advance_unskippable(&mut self, ctx: &RunContext<'_>) {
        while self.next_unskippable < self.nblocks && skippable(ctx, self.next_unskippable) {
            self.next_unskippable += 1;
        }
    }
}

impl HeapScanner for SerialScan {
    fn next_page(&mut self, ctx: &RunContext<'_>, stats: &mut RelationRunStats) -> Option<NextPage> {
        let skipping_enabled = !ctx.disable_page_skipping;
        let threshold = ctx.budget.skip_pages_threshold;

        if !self.started {
            self.started = true;
            if skipping_enabled {
                self.advance_unskippable(ctx);
            }
            self.skipping_blocks = self.next_unskippable >= threshold;
        }

        let mut all_visible_according_to_vm = false;
        let mut blkno = self.cblock;
        while blkno < self.nblocks {
            if blkno == self.next_unskippable {
                self.next_unskippable += 1;
                if skipping_enabled {
                    self.advance_unskippable(ctx);
                }
                self.skipping_blocks = self.next_unskippable - blkno > threshold;

                // в агрессивном режиме страница могла быть all-visible, но не all-frozen
                if ctx.aggressive() && ctx.rel.vm.status(blkno).contains(VmBits::ALL_VISIBLE) {
                    all_visible_according_to_vm = true;
                }
                break;
            }

            // страница внутри серии пропускаемых
            if self.skipping_blocks && !force_check_page(ctx, stats, blkno) {
                if ctx.aggressive() || ctx.rel.vm.status(blkno).contains(VmBits::ALL_FROZEN) {
                    stats.frozenskipped_pages += 1;
                    record_page_frozenskipped();
                }
                blkno += 1;
                continue;
            }
            all_visible_according_to_vm = true;
            break;
        }

        self.cblock = blkno + 1;
        if blkno >= self.nblocks {
            return None;
        }
        Some(NextPage {
            page: blkno,
            all_visible_according_to_vm,
        })
    }
}

/// Общий курсор параллельного скана.
#[derive(Debug)]
pub struct PageCursor {
    next: AtomicU32,
    nblocks: PageNo,
}

impl PageCursor {
    pub fn new(nblocks: PageNo) -> Self {
        Self {
            next: AtomicU32::new(0),
            nblocks,
        }
    }

    /// Выдать следующую страницу; каждая выдаётся ровно одному вызывающему.
    pub fn claim(&self) -> Option<PageNo> {
        let p = self.next.fetch_add(1, Ordering::SeqCst);
        (p < self.nblocks).then_some(p)
    }

    pub fn nblocks(&self) -> PageNo {
        self.nblocks
    }
}

#[derive(Debug)]
pub struct ParallelScan<'s> {
    cursor: &'s PageCursor,
}

impl<'s> ParallelScan<'s> {
    pub fn new(cursor: &'s PageCursor) -> Self {
        Self { cursor }
    }
}

impl HeapScanner for ParallelScan<'_> {
    fn next_page(&mut self, ctx: &RunContext<'_>, stats: &mut RelationRunStats) -> Option<NextPage> {
        loop {
            let page = self.cursor.claim()?;
            let mut all_visible_according_to_vm = false;

            if !ctx.disable_page_skipping && !force_check_page(ctx, stats, page) {
                let st = ctx.rel.vm.status(page);
                if ctx.aggressive() {
                    if st.contains(VmBits::ALL_FROZEN) {
                        stats.frozenskipped_pages += 1;
                        record_page_frozenskipped();
                        continue;
                    }
                    if st.contains(VmBits::ALL_VISIBLE) {
                        all_visible_according_to_vm = true;
                    }
                } else if st.contains(VmBits::ALL_VISIBLE) {
                    if st.contains(VmBits::ALL_FROZEN) {
                        stats.frozenskipped_pages += 1;
                        record_page_frozenskipped();
                    }
                    continue;
                }
            }

            return Some(NextPage {
                page,
                all_visible_according_to_vm,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::TableFixture;
    use anyhow::Result;
    use crate::store::VisibilityMap;

    fn drain(
        scan: &mut dyn HeapScanner,
        ctx: &RunContext<'_>,
        stats: &mut RelationRunStats,
    ) -> Vec<PageNo> {
        let mut out = Vec::new();
        while let Some(np) = scan.next_page(ctx, stats) {
            out.push(np.page);
        }
        out
    }

    #[test]
    fn long_visible_runs_are_skipped_short_ones_are_read() -> Result<()> {
        let fx = TableFixture::builder("t")
            .pages(12)
            .live_per_page(3)
            .skip_pages_threshold(4)
            .build()?;
        // 0..5 all-visible (длина 5 >= 4), 8..9 all-visible (длина 2 < 4)
        for p in (0..5).chain(8..10) {
            fx.vm.set(p, VmBits::ALL_VISIBLE);
        }
        fx.with_context(|ctx| {
            let mut stats = ctx.new_stats();
            let mut scan = SerialScan::new(ctx.nblocks);
            let pages = drain(&mut scan, ctx, &mut stats);
            assert_eq!(pages, vec![5, 6, 7, 8, 9, 10, 11]);
            assert_eq!(stats.frozenskipped_pages, 0);
        });
        Ok(())
    }

    #[test]
    fn disabled_skipping_reads_everything() -> Result<()> {
        let fx = TableFixture::builder("t")
            .pages(6)
            .live_per_page(1)
            .disable_page_skipping(true)
            .build()?;
        for p in 0..6 {
            fx.vm.set(p, VmBits::VALID);
        }
        fx.with_context(|ctx| {
            let mut stats = ctx.new_stats();
            let mut scan = SerialScan::new(ctx.nblocks);
            assert_eq!(drain(&mut scan, ctx, &mut stats).len(), 6);
        });
        Ok(())
    }

    #[test]
    fn parallel_cursor_hands_out_each_page_once() {
        let c = PageCursor::new(3);
        assert_eq!((c.claim(), c.claim(), c.claim(), c.claim()), (Some(0), Some(1), Some(2), None));
    }

    #[test]
    fn parallel_scan_counts_frozen_skips() -> Result<()> {
        let fx = TableFixture::builder("t").pages(4).live_per_page(1).build()?;
        fx.vm.set(0, VmBits::VALID);
        fx.vm.set(1, VmBits::ALL_VISIBLE);
        fx.with_context(|ctx| {
            let mut stats = ctx.new_stats();
            let cursor = PageCursor::new(ctx.nblocks);
            let mut scan = ParallelScan::new(&cursor);
            assert_eq!(drain(&mut scan, ctx, &mut stats), vec![2, 3]);
            assert_eq!(stats.frozenskipped_pages, 1);
        });
        Ok(())
    }
}
