//! index/mem - индекс в памяти: плоский набор TupleId.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use super::{IndexAm, IndexBulkDeleteResult, IndexVacuumInfo};
use crate::types::TupleId;

type Hook = Box<dyn Fn(&str) + Send + Sync>;

pub struct MemIndex {
    name: String,
    entries: Mutex<Vec<TupleId>>,
    entries_per_page: usize,
    bulk_delete_calls: AtomicU32,
    cleanup_calls: AtomicU32,
    removed_per_call: Mutex<Vec<u64>>,
    hook: Mutex<Option<Hook>>,
}

impl MemIndex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(Vec::new()),
            entries_per_page: 256,
            bulk_delete_calls: AtomicU32::new(0),
            cleanup_calls: AtomicU32::new(0),
            removed_per_call: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        }
    }

    pub fn insert(&self, tid: TupleId) {
        if let Ok(mut g) = self.entries.lock() {
            g.push(tid);
        }
    }

    pub fn contains(&self, tid: TupleId) -> bool {
        self.entries
            .lock()
            .map(|g| g.contains(&tid))
            .unwrap_or(false)
    }

    /// Копия всех записей (проверки ссылок на heap).
    pub fn entries(&self) -> Vec<TupleId> {
        self.entries.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bulk_delete_calls(&self) -> u32 {
        self.bulk_delete_calls.load(Ordering::SeqCst)
    }

    pub fn cleanup_calls(&self) -> u32 {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    /// Сколько записей удалил каждый вызов bulk_delete (по порядку).
    pub fn removed_per_call(&self) -> Vec<u64> {
        self.removed_per_call
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    /// Вызывается в начале каждого bulk_delete (тесты упорядочивания).
    pub fn set_hook(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        if let Ok(mut g) = self.hook.lock() {
            *g = Some(Box::new(f));
        }
    }

    fn num_pages(&self, n: usize) -> u32 {
        // + метастраница
        (n.div_ceil(self.entries_per_page) + 1) as u32
    }
}

impl IndexAm for MemIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn bulk_delete(
        &self,
        _info: &IndexVacuumInfo,
        stats: Option<IndexBulkDeleteResult>,
        is_dead: &dyn Fn(TupleId) -> bool,
    ) -> Result<IndexBulkDeleteResult> {
        if let Ok(g) = self.hook.lock() {
            if let Some(h) = g.as_ref() {
                h(&self.name);
            }
        }
        self.bulk_delete_calls.fetch_add(1, Ordering::SeqCst);

        let mut g = self
            .entries
            .lock()
            .map_err(|_| anyhow!("index {} poisoned", self.name))?;
        let before = g.len();
        g.retain(|t| !is_dead(*t));
        let removed = before - g.len();
        let remaining = g.len();
        drop(g);

        if let Ok(mut r) = self.removed_per_call.lock() {
            r.push(removed as u64);
        }

        let mut st = stats.unwrap_or_default();
        st.tuples_removed += removed as f64;
        st.num_index_tuples = remaining as f64;
        st.num_pages = self.num_pages(remaining);
        st.estimated_count = false;
        Ok(st)
    }

    fn cleanup(
        &self,
        _info: &IndexVacuumInfo,
        stats: Option<IndexBulkDeleteResult>,
    ) -> Result<Option<IndexBulkDeleteResult>> {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.len();
        let mut st = stats.unwrap_or_default();
        st.num_index_tuples = remaining as f64;
        st.num_pages = self.num_pages(remaining);
        Ok(Some(st))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> IndexVacuumInfo {
        IndexVacuumInfo {
            index_name: "i".into(),
            estimated_count: false,
            num_heap_tuples: 0.0,
            message_level: log::Level::Debug,
        }
    }

    #[test]
    fn bulk_delete_accumulates_across_cycles() -> Result<()> {
        let idx = MemIndex::new("i");
        for o in 1..=5 {
            idx.insert(TupleId::new(0, o));
        }
        let st = idx.bulk_delete(&info(), None, &|t| t.offset <= 2)?;
        assert_eq!(st.tuples_removed, 2.0);
        let st = idx.bulk_delete(&info(), Some(st), &|t| t.offset == 5)?;
        assert_eq!(st.tuples_removed, 3.0);
        assert_eq!(st.num_index_tuples, 2.0);
        assert_eq!(idx.removed_per_call(), vec![2, 1]);

        let fin = idx.cleanup(&info(), Some(st))?.expect("stats");
        assert_eq!(fin.num_pages, 2);
        Ok(())
    }
}
