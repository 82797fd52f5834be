//! vacuum/truncate - отрезание пустого хвоста отношения.
//!
//! Порядок:
//! 1) эксклюзивная блокировка отношения: неблокирующие попытки с паузой
//!    truncate_wait_interval, пока не истечёт truncate_lock_timeout;
//! 2) если отношение успело вырасти - отказ;
//! 3) обратный скан от конца к nonempty_pages: первая страница с занятым
//!    слотом задаёт новую длину. Скан прерывается, если кто-то ждёт блокировку;
//! 4) WAL TRUNCATE, усечение heap и VM, снятие блокировки.
//!
//! Прерванный из-за ожидающих скан отрезает то, что успел проверить, и
//! повторяет всё с шага 1.

use anyhow::Result;
use log::{debug, info, log};
use std::time::Instant;

use crate::consts::{REL_TRUNCATE_FRACTION, REL_TRUNCATE_MINIMUM, TRUNCATE_WAITER_CHECK_PAGES};
use crate::metrics::{record_pages_truncated, record_truncate_abandoned};
use crate::progress::VacuumPhase;
use crate::store::RelationLock;
use crate::types::PageNo;
use crate::wal::WalRecord;

use super::context::RunContext;
use super::stats::RelationRunStats;

/// Стоит ли пытаться отрезать хвост: он достаточно велик (абсолютно или
/// относительно) и ранняя чистка снимков ("snapshot too old") выключена.
pub fn should_attempt_truncation(rel_pages: PageNo, nonempty_pages: PageNo, early_pruning: bool) -> bool {
    let possibly_freeable = rel_pages.saturating_sub(nonempty_pages);
    possibly_freeable > 0
        && (possibly_freeable >= REL_TRUNCATE_MINIMUM
            || possibly_freeable >= rel_pages / REL_TRUNCATE_FRACTION)
        && !early_pruning
}

/// Снимает блокировку отношения при выходе из области видимости (в т.ч. по ошибке).
struct HeldLock<'a>(&'a dyn RelationLock);

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

pub struct Truncator<'c, 'r> {
    ctx: &'c RunContext<'r>,
}

impl<'c, 'r> Truncator<'c, 'r> {
    pub fn new(ctx: &'c RunContext<'r>) -> Self {
        Self { ctx }
    }

    pub fn run(&self, stats: &mut RelationRunStats) -> Result<()> {
        let ctx = self.ctx;
        let name = ctx.name();
        ctx.svc.progress.set_phase(VacuumPhase::Truncate);

        let mut old_rel_pages = stats.rel_pages;
        loop {
            stats.lock_waiter_detected = false;

            let Some(held) = self.acquire(stats)? else {
                return Ok(());
            };

            let new_rel_pages = ctx.rel.store.nblocks();
            if new_rel_pages != old_rel_pages {
                // кто-то дописал страницы: они могут быть заняты
                debug!(
                    "\"{}\": relation grew from {} to {} pages during vacuum, not truncating",
                    name, old_rel_pages, new_rel_pages
                );
                return Ok(());
            }

            let new_rel_pages = self.count_nondeletable_pages(stats)?;
            if new_rel_pages >= old_rel_pages {
                return Ok(());
            }

            ctx.log(&WalRecord::Truncate {
                nblocks: new_rel_pages,
            })?;
            ctx.rel.store.truncate(new_rel_pages)?;
            ctx.rel.vm.truncate(new_rel_pages);
            drop(held);

            let removed = old_rel_pages - new_rel_pages;
            stats.pages_removed += removed;
            stats.rel_pages = new_rel_pages;
            record_pages_truncated(removed as u64);
            log!(
                ctx.level,
                "\"{}\": truncated {} to {} pages",
                name,
                old_rel_pages,
                new_rel_pages
            );
            old_rel_pages = new_rel_pages;

            if !(new_rel_pages > stats.nonempty_pages && stats.lock_waiter_detected) {
                return Ok(());
            }
        }
    }

    /// None - блокировку так и не получили за отведённое время.
    fn acquire(&self, stats: &mut RelationRunStats) -> Result<Option<HeldLock<'r>>> {
        let ctx = self.ctx;
        let lock = ctx.rel.lock;
        let wait = ctx.budget.truncate_wait_interval;
        let max_retries = if wait.is_zero() {
            0
        } else {
            (ctx.budget.truncate_lock_timeout.as_millis() / wait.as_millis().max(1)) as u64
        };

        let mut retries = 0u64;
        loop {
            if lock.try_lock_exclusive() {
                return Ok(Some(HeldLock(lock)));
            }
            ctx.svc.cancel.check()?;

            retries += 1;
            if retries > max_retries {
                stats.lock_waiter_detected = true;
                record_truncate_abandoned();
                log!(
                    ctx.level,
                    "\"{}\": stopping truncate due to conflicting lock request",
                    ctx.name()
                );
                return Ok(None);
            }
            std::thread::sleep(wait);
        }
    }

    /// Новая длина отношения: страница после последней с занятыми слотами.
    /// Под эксклюзивной блокировкой; периодически проверяет ожидающих.
    fn count_nondeletable_pages(&self, stats: &mut RelationRunStats) -> Result<PageNo> {
        let ctx = self.ctx;
        let mut blkno = stats.rel_pages;
        let mut started = Instant::now();

        while blkno > stats.nonempty_pages {
            if blkno % TRUNCATE_WAITER_CHECK_PAGES == 0 {
                if started.elapsed() >= ctx.budget.truncate_check_interval {
                    if ctx.rel.lock.has_waiters() {
                        info!(
                            "\"{}\": suspending truncate due to conflicting lock request",
                            ctx.name()
                        );
                        stats.lock_waiter_detected = true;
                        return Ok(blkno);
                    }
                    started = Instant::now();
                }
            }

            ctx.svc.cancel.check()?;

            blkno -= 1;
            let page = ctx.rel.store.share_lock(blkno)?;
            if page.is_new() || page.is_empty() {
                continue;
            }
            if page.has_used_items() {
                return Ok(blkno + 1);
            }
        }
        Ok(stats.nonempty_pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_tails_of_small_relations_count() {
        // 10 страниц: 10/16 = 0, любой хвост подходит
        assert!(should_attempt_truncation(10, 9, false));
        assert!(!should_attempt_truncation(10, 10, false));
    }

    #[test]
    fn tail_must_reach_fraction_or_minimum() {
        assert!(!should_attempt_truncation(1600, 1501, false));
        assert!(should_attempt_truncation(1600, 1500, false));
        assert!(should_attempt_truncation(100_000, 99_000, false));
        assert!(!should_attempt_truncation(100_000, 99_001, false));
    }

    #[test]
    fn early_pruning_disables_truncation() {
        assert!(!should_attempt_truncation(10, 0, true));
    }
}
