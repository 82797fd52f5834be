//! vacuum/indexes - IndexReconciler: bulk-delete по мёртвым TupleId и финальный cleanup.
//!
//! Накопленная статистика каждого индекса лежит в отдельном слоте; слот берётся
//! под мьютексом только на время чтения/записи, сам вызов индекса идёт без него.
//! Итоги cleanup не пишутся в каталог сразу: их применяет координатор после
//! завершения всех воркеров (apply).

use anyhow::{anyhow, Context, Result};
use log::log;
use serde::Serialize;
use std::sync::Mutex;

use crate::catalog::Catalog;
use crate::index::{IndexBulkDeleteResult, IndexVacuumInfo};
use crate::metrics::record_index_scan;

use super::context::RunContext;
use super::dead_tuples::DeadTupleStore;

/// Итог по одному индексу за прогон.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRunStats {
    pub name: String,
    pub num_pages: u32,
    pub num_index_tuples: f64,
    pub tuples_removed: f64,
    pub pages_deleted: u32,
    pub pages_free: u32,
    pub estimated_count: bool,
}

#[derive(Debug, Default)]
struct IndexSlot {
    bulk: Option<IndexBulkDeleteResult>,
    result: Option<IndexRunStats>,
}

#[derive(Debug)]
pub struct IndexReconciler {
    slots: Vec<Mutex<IndexSlot>>,
}

impl IndexReconciler {
    pub fn new(nindexes: usize) -> Self {
        Self {
            slots: (0..nindexes).map(|_| Mutex::new(IndexSlot::default())).collect(),
        }
    }

    fn slot(&self, i: usize) -> Result<std::sync::MutexGuard<'_, IndexSlot>> {
        self.slots
            .get(i)
            .ok_or_else(|| anyhow!("index slot {} out of range", i))?
            .lock()
            .map_err(|_| anyhow!("index slot {} poisoned", i))
    }

    /// Удалить из индекса i все ссылки на ожидающие удаления версии.
    pub fn bulk_delete(&self, ctx: &RunContext<'_>, i: usize, dead: &DeadTupleStore) -> Result<()> {
        let index = ctx.rel.indexes[i];
        let info = IndexVacuumInfo {
            index_name: index.name().to_string(),
            estimated_count: true,
            num_heap_tuples: ctx.rel.meta.reltuples,
            message_level: ctx.level,
        };
        let prev = self.slot(i)?.bulk.take();
        let pending = dead.total_len();

        let st = index
            .bulk_delete(&info, prev, &|tid| dead.is_pending(tid))
            .with_context(|| format!("bulk delete on index \"{}\"", index.name()))?;
        self.slot(i)?.bulk = Some(st);
        record_index_scan();

        log!(
            ctx.level,
            "scanned index \"{}\" to remove {} row versions",
            index.name(),
            pending
        );
        Ok(())
    }

    /// Финальный cleanup индекса i; результат откладывается до apply.
    pub fn cleanup(
        &self,
        ctx: &RunContext<'_>,
        i: usize,
        num_heap_tuples: f64,
        estimated_count: bool,
    ) -> Result<()> {
        let index = ctx.rel.indexes[i];
        let info = IndexVacuumInfo {
            index_name: index.name().to_string(),
            estimated_count,
            num_heap_tuples,
            message_level: ctx.level,
        };
        let prev = self.slot(i)?.bulk.take();
        let out = index
            .cleanup(&info, prev)
            .with_context(|| format!("cleanup on index \"{}\"", index.name()))?;

        let Some(st) = out else {
            return Ok(());
        };
        log!(
            ctx.level,
            "index \"{}\" now contains {} row versions in {} pages: {} index row versions were removed, {} index pages have been deleted, {} are currently reusable",
            index.name(),
            st.num_index_tuples,
            st.num_pages,
            st.tuples_removed,
            st.pages_deleted,
            st.pages_free
        );
        self.slot(i)?.result = Some(IndexRunStats {
            name: index.name().to_string(),
            num_pages: st.num_pages,
            num_index_tuples: st.num_index_tuples,
            tuples_removed: st.tuples_removed,
            pages_deleted: st.pages_deleted,
            pages_free: st.pages_free,
            estimated_count: st.estimated_count,
        });
        Ok(())
    }

    /// Забрать отложенные итоги (в порядке индексов).
    pub fn take_results(&self) -> Result<Vec<IndexRunStats>> {
        let mut out = Vec::new();
        for i in 0..self.slots.len() {
            if let Some(r) = self.slot(i)?.result.take() {
                out.push(r);
            }
        }
        Ok(out)
    }
}

/// Записать статистику индексов в каталог. Оценочные числа не пишутся.
pub fn apply_index_stats(catalog: &dyn Catalog, results: &[IndexRunStats]) -> Result<()> {
    for r in results.iter().filter(|r| !r.estimated_count) {
        catalog
            .update_index(&r.name, r.num_pages, r.num_index_tuples)
            .with_context(|| format!("update stats of index \"{}\"", r.name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemCatalog;

    #[test]
    fn estimated_results_are_not_applied() -> Result<()> {
        let cat = MemCatalog::new();
        let rows = vec![
            IndexRunStats {
                name: "a".into(),
                num_pages: 3,
                num_index_tuples: 10.0,
                tuples_removed: 0.0,
                pages_deleted: 0,
                pages_free: 0,
                estimated_count: false,
            },
            IndexRunStats {
                name: "b".into(),
                num_pages: 7,
                num_index_tuples: 99.0,
                tuples_removed: 0.0,
                pages_deleted: 0,
                pages_free: 0,
                estimated_count: true,
            },
        ];
        apply_index_stats(&cat, &rows)?;
        assert_eq!(cat.index("a").map(|m| m.pages), Some(3));
        assert!(cat.index("b").is_none());
        Ok(())
    }
}
