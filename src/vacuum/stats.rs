//! vacuum/stats - счётчики прогона и оценка reltuples.

use serde::Serialize;

use crate::types::{MultiXactId, Xid};

use super::indexes::IndexRunStats;

/// Итог прогона по отношению (и промежуточные счётчики одного воркера).
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelationRunStats {
    pub relation: String,
    pub aggressive: bool,
    /// 0 - последовательный прогон.
    pub workers: usize,
    pub has_indexes: bool,

    // ---- на старте ----
    pub old_rel_pages: u32,
    pub old_rel_tuples: f64,
    pub max_dead_tuples: usize,

    // ---- скан ----
    pub rel_pages: u32,
    pub scanned_pages: u32,
    pub pinskipped_pages: u32,
    pub frozenskipped_pages: u32,
    pub empty_pages: u32,
    /// Страницы, где освобождались слоты (однопроходный режим или второй проход).
    pub vacuumed_pages: u32,
    /// Номер последней страницы с кортежами + 1.
    pub nonempty_pages: u32,
    pub scanned_tuples: f64,
    pub tuples_deleted: f64,
    /// Мёртвые, но пока неудаляемые версии (recently dead, HOT).
    pub new_dead_tuples: f64,
    pub unused_items: f64,
    pub tuples_frozen: u64,
    pub num_index_scans: u32,
    pub latest_removed_xid: Xid,

    // ---- финал ----
    pub new_rel_tuples: f64,
    pub new_live_tuples: f64,
    pub new_rel_allvisible: u32,
    pub scanned_all_unfrozen: bool,
    pub pages_removed: u32,
    pub lock_waiter_detected: bool,
    pub new_frozen_xid: Xid,
    pub new_min_multi: MultiXactId,

    pub indexes: Vec<IndexRunStats>,
}

impl RelationRunStats {
    /// Сложить счётчики воркера. Поля-отметки (nonempty_pages, latest_removed_xid,
    /// num_index_scans) берутся по максимуму: это позиции/раунды, а не суммы.
    pub fn merge(&mut self, w: &RelationRunStats) {
        self.rel_pages = self.rel_pages.max(w.rel_pages);
        self.scanned_pages += w.scanned_pages;
        self.pinskipped_pages += w.pinskipped_pages;
        self.frozenskipped_pages += w.frozenskipped_pages;
        self.empty_pages += w.empty_pages;
        self.vacuumed_pages += w.vacuumed_pages;
        self.nonempty_pages = self.nonempty_pages.max(w.nonempty_pages);
        self.scanned_tuples += w.scanned_tuples;
        self.tuples_deleted += w.tuples_deleted;
        self.new_dead_tuples += w.new_dead_tuples;
        self.unused_items += w.unused_items;
        self.tuples_frozen += w.tuples_frozen;
        self.num_index_scans = self.num_index_scans.max(w.num_index_scans);
        if w.latest_removed_xid.is_valid()
            && (!self.latest_removed_xid.is_valid()
                || w.latest_removed_xid.follows(self.latest_removed_xid))
        {
            self.latest_removed_xid = w.latest_removed_xid;
        }
    }

    /// Все ли незамороженные страницы были просмотрены (можно двигать relfrozenxid).
    pub fn covers_all_unfrozen(&self) -> bool {
        self.scanned_pages + self.frozenskipped_pages >= self.rel_pages
    }
}

/// Оценка числа живых кортежей во всём отношении по частичному скану.
///
/// Плотность на странице из старой статистики сдвигается к наблюдаемой
/// пропорционально доле просмотренных страниц.
pub fn estimate_reltuples(
    old_rel_pages: u32,
    old_rel_tuples: f64,
    total_pages: u32,
    scanned_pages: u32,
    scanned_tuples: f64,
) -> f64 {
    if scanned_pages >= total_pages {
        return scanned_tuples;
    }
    if scanned_pages == 0 {
        return old_rel_tuples;
    }
    let total = total_pages as f64;
    let scanned = scanned_pages as f64;
    if old_rel_pages == 0 {
        return ((scanned_tuples / scanned) * total + 0.5).floor();
    }
    let old_density = old_rel_tuples / old_rel_pages as f64;
    let new_density = scanned_tuples / scanned;
    let multiplier = scanned / total;
    let updated_density = old_density + (new_density - old_density) * multiplier;
    (updated_density * total + 0.5).floor()
}
