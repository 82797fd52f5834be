//! index - контракт индексного access method, потребляемый vacuum.
//!
//! Движку нужны только два вызова:
//! - bulk_delete(callback): удалить все записи, чей TupleId помечен callback'ом как мёртвый;
//! - cleanup(stats): финализировать статистику после всех циклов.
//!
//! Внутренности индексов (страницы, деревья) сюда не относятся; MemIndex - простая
//! реализация для тестов и CLI.

use anyhow::Result;
use serde::Serialize;

use crate::types::TupleId;

pub mod mem;

pub use mem::MemIndex;

/// Параметры одного вызова bulk_delete/cleanup.
#[derive(Debug, Clone)]
pub struct IndexVacuumInfo {
    pub index_name: String,
    /// num_heap_tuples - оценка, а не точный подсчёт.
    pub estimated_count: bool,
    pub num_heap_tuples: f64,
    pub message_level: log::Level,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IndexBulkDeleteResult {
    pub num_pages: u32,
    pub num_index_tuples: f64,
    pub tuples_removed: f64,
    pub pages_deleted: u32,
    pub pages_free: u32,
    pub estimated_count: bool,
}

pub trait IndexAm: Send + Sync {
    fn name(&self) -> &str;

    /// stats - накопленный результат предыдущих циклов этого прогона (None в первом).
    fn bulk_delete(
        &self,
        info: &IndexVacuumInfo,
        stats: Option<IndexBulkDeleteResult>,
        is_dead: &dyn Fn(TupleId) -> bool,
    ) -> Result<IndexBulkDeleteResult>;

    /// None - индекс не сообщает статистику.
    fn cleanup(
        &self,
        info: &IndexVacuumInfo,
        stats: Option<IndexBulkDeleteResult>,
    ) -> Result<Option<IndexBulkDeleteResult>>;
}
