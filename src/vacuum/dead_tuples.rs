//! vacuum/dead_tuples - DeadTupleStore: TupleId мёртвых версий, ожидающих удаления.
//!
//! Одна арена на прогон, разбитая на партиции по воркерам (в последовательном
//! режиме партиция одна). Ёмкость каждой партиции фиксируется при создании и
//! не растёт: при переполнении запись отбрасывается, а цикл очистки должен
//! был запуститься раньше (у партиции всегда остаётся запас на страницу).
//!
//! Внутри партиции TupleId строго возрастают; is_pending ищет бинарным поиском
//! по всем партициям, поэтому индексный callback видит мёртвые версии всех воркеров.

use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, Result};

use crate::consts::{MAX_TUPLES_PER_PAGE, TUPLE_ID_BYTES};
use crate::metrics::record_dead_tuple_dropped;
use crate::types::{OffsetNo, PageNo, TupleId};

// ~1GB - 1: верхняя граница одного выделения
const MAX_ALLOC_BYTES: usize = 0x3fff_ffff;

/// Ёмкость одной партиции для данного бюджета памяти.
///
/// Без индексов удаление идёт сразу по странице, поэтому хватает одной страницы.
/// С индексами - сколько TupleId влезает в work_mem, но не больше, чем может
/// быть в отношении (по старому relpages), и не меньше одной страницы.
pub fn capacity_for(nindexes: usize, work_mem_kb: usize, old_rel_pages: u32) -> usize {
    if nindexes == 0 {
        return MAX_TUPLES_PER_PAGE;
    }
    let mut max = work_mem_kb.saturating_mul(1024) / TUPLE_ID_BYTES;
    max = max.min(i32::MAX as usize).min(MAX_ALLOC_BYTES / TUPLE_ID_BYTES);
    if max / MAX_TUPLES_PER_PAGE > old_rel_pages as usize {
        max = old_rel_pages as usize * MAX_TUPLES_PER_PAGE;
    }
    max.max(MAX_TUPLES_PER_PAGE)
}

#[derive(Debug)]
pub struct DeadTupleStore {
    capacity: usize,
    partitions: Vec<RwLock<Vec<TupleId>>>,
}

impl DeadTupleStore {
    pub fn new(partitions: usize, capacity: usize) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| RwLock::new(Vec::with_capacity(capacity)))
            .collect();
        Self {
            capacity,
            partitions,
        }
    }

    /// Ёмкость одной партиции.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Вид на партицию воркера; Err - номер вне диапазона.
    pub fn partition(&self, idx: usize) -> Result<Partition<'_>> {
        if idx >= self.partitions.len() {
            return Err(anyhow!(
                "dead tuple partition {} out of range (have {})",
                idx,
                self.partitions.len()
            ));
        }
        Ok(Partition { store: self, idx })
    }

    /// Есть ли TupleId среди ожидающих удаления (в любой партиции).
    pub fn is_pending(&self, tid: TupleId) -> bool {
        self.partitions.iter().any(|p| {
            p.read()
                .unwrap_or_else(PoisonError::into_inner)
                .binary_search(&tid)
                .is_ok()
        })
    }

    pub fn total_len(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn clear_all(&self) {
        for p in &self.partitions {
            p.write().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }
}

/// Bounds-checked вид на одну партицию арены.
#[derive(Debug, Clone, Copy)]
pub struct Partition<'a> {
    store: &'a DeadTupleStore,
    idx: usize,
}

impl<'a> Partition<'a> {
    fn slot(&self) -> &'a RwLock<Vec<TupleId>> {
        &self.store.partitions[self.idx]
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn len(&self) -> usize {
        self.slot().read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Места меньше, чем может понадобиться одной странице: пора чистить индексы.
    pub fn needs_reclaim(&self) -> bool {
        let n = self.len();
        n > 0 && self.store.capacity - n < MAX_TUPLES_PER_PAGE
    }

    /// Добавить TupleId. false - партиция заполнена, запись отброшена.
    pub fn record(&self, tid: TupleId) -> bool {
        let mut g = self.slot().write().unwrap_or_else(PoisonError::into_inner);
        match g.last() {
            Some(last) if *last >= tid => {
                // не по порядку: вставка с сохранением сортировки, без дублей
                match g.binary_search(&tid) {
                    Ok(_) => return true,
                    Err(pos) => {
                        if g.len() >= self.store.capacity {
                            drop(g);
                            record_dead_tuple_dropped();
                            return false;
                        }
                        g.insert(pos, tid);
                    }
                }
            }
            _ => {
                if g.len() >= self.store.capacity {
                    drop(g);
                    record_dead_tuple_dropped();
                    return false;
                }
                g.push(tid);
            }
        }
        true
    }

    pub fn clear(&self) {
        self.slot()
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Содержимое, сгруппированное по страницам (по возрастанию).
    pub fn page_runs(&self) -> Vec<(PageNo, Vec<OffsetNo>)> {
        let g = self.slot().read().unwrap_or_else(PoisonError::into_inner);
        let mut runs: Vec<(PageNo, Vec<OffsetNo>)> = Vec::new();
        for tid in g.iter() {
            match runs.last_mut() {
                Some((page, offs)) if *page == tid.page => offs.push(tid.offset),
                _ => runs.push((tid.page, vec![tid.offset])),
            }
        }
        runs
    }

    pub fn to_vec(&self) -> Vec<TupleId> {
        self.slot()
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_without_indexes_is_one_page() {
        assert_eq!(capacity_for(0, 1 << 20, 1_000_000), MAX_TUPLES_PER_PAGE);
    }

    #[test]
    fn capacity_is_bounded_by_relation_size() {
        // 64MB хватило бы на миллионы, но в отношении всего 10 страниц
        assert_eq!(capacity_for(1, 64 * 1024, 10), 10 * MAX_TUPLES_PER_PAGE);
        // пустое отношение: минимум одна страница
        assert_eq!(capacity_for(1, 64 * 1024, 0), MAX_TUPLES_PER_PAGE);
    }

    #[test]
    fn capacity_follows_work_mem() {
        // 64KB / 6 = 10922
        assert_eq!(capacity_for(2, 64, 1_000_000), 10922);
    }

    #[test]
    fn record_keeps_order_and_drops_on_overflow() -> Result<()> {
        let s = DeadTupleStore::new(1, 3);
        let p = s.partition(0)?;
        assert!(p.record(TupleId::new(2, 1)));
        assert!(p.record(TupleId::new(1, 4)));
        assert!(p.record(TupleId::new(1, 4)));
        assert!(p.record(TupleId::new(3, 1)));
        assert!(!p.record(TupleId::new(4, 1)));
        assert_eq!(
            p.to_vec(),
            vec![TupleId::new(1, 4), TupleId::new(2, 1), TupleId::new(3, 1)]
        );
        Ok(())
    }

    #[test]
    fn pending_is_visible_across_partitions() -> Result<()> {
        let s = DeadTupleStore::new(2, 10);
        s.partition(0)?.record(TupleId::new(0, 1));
        s.partition(1)?.record(TupleId::new(5, 2));
        assert!(s.is_pending(TupleId::new(5, 2)));
        assert!(s.is_pending(TupleId::new(0, 1)));
        assert!(!s.is_pending(TupleId::new(5, 1)));
        assert_eq!(s.total_len(), 2);
        assert!(s.partition(2).is_err());
        s.clear_all();
        assert_eq!(s.total_len(), 0);
        Ok(())
    }

    #[test]
    fn runs_group_by_page() -> Result<()> {
        let s = DeadTupleStore::new(1, 10);
        let p = s.partition(0)?;
        for (pg, off) in [(1, 1), (1, 3), (4, 2)] {
            p.record(TupleId::new(pg, off));
        }
        assert_eq!(p.page_runs(), vec![(1, vec![1, 3]), (4, vec![2])]);
        Ok(())
    }

    #[test]
    fn reclaim_trigger_leaves_room_for_a_page() -> Result<()> {
        let s = DeadTupleStore::new(1, MAX_TUPLES_PER_PAGE + 2);
        let p = s.partition(0)?;
        assert!(!p.needs_reclaim());
        p.record(TupleId::new(0, 1));
        p.record(TupleId::new(0, 2));
        assert!(!p.needs_reclaim());
        p.record(TupleId::new(0, 3));
        assert!(p.needs_reclaim());
        Ok(())
    }
}
