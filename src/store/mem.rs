//! store/mem - in-memory реализации HeapStore / VisibilityMap / RelationLock.
//!
//! MemHeapStore держит фиксированный массив страниц (ёмкость задаётся при создании),
//! поэтому ссылки на latch'и стабильны, а extend/truncate меняют только nblocks.
//! Чужие buffer pin'ы моделируются счётчиками (pin/unpin) - так тесты воспроизводят
//! конфликт cleanup lock.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError, RwLock, TryLockError};

use super::{
    HeapStore, PageReadGuard, PageWriteGuard, RelationLock, VisibilityMap, VmBits,
};
use crate::page::HeapPage;
use crate::types::PageNo;

pub struct MemHeapStore {
    name: String,
    page_size: usize,
    pages: Vec<RwLock<HeapPage>>,
    nblocks: AtomicU32,
    pins: Mutex<HashMap<PageNo, u32>>,
    unpinned: Condvar,
    fsm: Mutex<HashMap<PageNo, usize>>,
    extension: Mutex<()>,
    needs_wal: bool,
}

impl MemHeapStore {
    pub fn new(name: impl Into<String>, page_size: usize, capacity: PageNo) -> Self {
        let pages = (0..capacity)
            .map(|p| RwLock::new(HeapPage::new_uninit(p, page_size)))
            .collect();
        Self {
            name: name.into(),
            page_size,
            pages,
            nblocks: AtomicU32::new(0),
            pins: Mutex::new(HashMap::new()),
            unpinned: Condvar::new(),
            fsm: Mutex::new(HashMap::new()),
            extension: Mutex::new(()),
            needs_wal: true,
        }
    }

    /// Отношение без WAL (unlogged/temp).
    pub fn without_wal(mut self) -> Self {
        self.needs_wal = false;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Добавить новую (неинициализированную) страницу в конец.
    pub fn extend(&self) -> Result<PageNo> {
        let _ext = self
            .extension
            .lock()
            .map_err(|_| anyhow!("extension lock poisoned"))?;
        let n = self.nblocks.load(Ordering::Acquire);
        let slot = self
            .pages
            .get(n as usize)
            .ok_or_else(|| anyhow!("relation \"{}\" is full ({} pages)", self.name, n))?;
        {
            let mut g = slot.write().map_err(|_| anyhow!("page {} latch poisoned", n))?;
            *g = HeapPage::new_uninit(n, self.page_size);
        }
        self.nblocks.store(n + 1, Ordering::Release);
        Ok(n)
    }

    /// Добавить страницу и сразу выполнить PageInit.
    pub fn extend_initialized(&self) -> Result<PageNo> {
        let n = self.extend()?;
        self.with_page_mut(n, |p| p.init())?;
        Ok(n)
    }

    /// Прямой доступ к странице (построение фикстур, проверки в тестах).
    pub fn with_page_mut<R>(&self, page: PageNo, f: impl FnOnce(&mut HeapPage) -> R) -> Result<R> {
        let slot = self.slot(page)?;
        let mut g = slot
            .write()
            .map_err(|_| anyhow!("page {} latch poisoned", page))?;
        Ok(f(&mut g))
    }

    pub fn with_page<R>(&self, page: PageNo, f: impl FnOnce(&HeapPage) -> R) -> Result<R> {
        let slot = self.slot(page)?;
        let g = slot
            .read()
            .map_err(|_| anyhow!("page {} latch poisoned", page))?;
        Ok(f(&g))
    }

    /// Смоделировать чужой buffer pin.
    pub fn pin(&self, page: PageNo) {
        let mut g = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        *g.entry(page).or_insert(0) += 1;
    }

    pub fn unpin(&self, page: PageNo) {
        let mut g = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = g.get_mut(&page) {
            *c -= 1;
            if *c == 0 {
                g.remove(&page);
            }
        }
        self.unpinned.notify_all();
    }

    fn is_pinned(&self, page: PageNo) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&page)
    }

    pub fn free_space(&self, page: PageNo) -> Option<usize> {
        self.fsm
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&page)
            .copied()
    }

    fn slot(&self, page: PageNo) -> Result<&RwLock<HeapPage>> {
        let n = self.nblocks.load(Ordering::Acquire);
        if page >= n {
            return Err(anyhow!(
                "could not read page {} in relation \"{}\": only {} pages",
                page,
                self.name,
                n
            ));
        }
        self.pages
            .get(page as usize)
            .ok_or_else(|| anyhow!("page {} out of capacity", page))
    }
}

impl HeapStore for MemHeapStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn nblocks(&self) -> PageNo {
        self.nblocks.load(Ordering::Acquire)
    }

    fn try_cleanup_lock(&self, page: PageNo) -> Result<Option<PageWriteGuard<'_>>> {
        let slot = self.slot(page)?;
        if self.is_pinned(page) {
            return Ok(None);
        }
        match slot.try_write() {
            Ok(g) => Ok(Some(g)),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Poisoned(_)) => Err(anyhow!("page {} latch poisoned", page)),
        }
    }

    fn cleanup_lock(&self, page: PageNo) -> Result<PageWriteGuard<'_>> {
        let slot = self.slot(page)?;
        {
            let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
            while pins.contains_key(&page) {
                pins = self
                    .unpinned
                    .wait(pins)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        slot.write()
            .map_err(|_| anyhow!("page {} latch poisoned", page))
    }

    fn share_lock(&self, page: PageNo) -> Result<PageReadGuard<'_>> {
        self.slot(page)?
            .read()
            .map_err(|_| anyhow!("page {} latch poisoned", page))
    }

    fn wait_for_extension(&self) -> Result<()> {
        let _g = self
            .extension
            .lock()
            .map_err(|_| anyhow!("extension lock poisoned"))?;
        Ok(())
    }

    fn truncate(&self, nblocks: PageNo) -> Result<()> {
        let _ext = self
            .extension
            .lock()
            .map_err(|_| anyhow!("extension lock poisoned"))?;
        let old = self.nblocks.load(Ordering::Acquire);
        if nblocks > old {
            return Err(anyhow!(
                "cannot truncate \"{}\" to {} pages: only {}",
                self.name,
                nblocks,
                old
            ));
        }
        for p in nblocks..old {
            let mut g = self.pages[p as usize]
                .write()
                .map_err(|_| anyhow!("page {} latch poisoned", p))?;
            *g = HeapPage::new_uninit(p, self.page_size);
        }
        self.nblocks.store(nblocks, Ordering::Release);
        self.fsm
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|p, _| *p < nblocks);
        Ok(())
    }

    fn record_free_space(&self, page: PageNo, free: usize) {
        self.fsm
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(page, free);
    }

    fn needs_wal(&self) -> bool {
        self.needs_wal
    }
}

// ---------------- Visibility map ----------------

#[derive(Debug, Default)]
pub struct MemVisibilityMap {
    bits: Mutex<Vec<u8>>,
}

impl MemVisibilityMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VisibilityMap for MemVisibilityMap {
    fn status(&self, page: PageNo) -> VmBits {
        let g = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        VmBits::from_bits(g.get(page as usize).copied().unwrap_or(0))
    }

    fn set(&self, page: PageNo, bits: VmBits) {
        let mut g = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        let i = page as usize;
        if g.len() <= i {
            g.resize(i + 1, 0);
        }
        g[i] |= bits.bits();
    }

    fn clear(&self, page: PageNo, bits: VmBits) {
        let mut g = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(b) = g.get_mut(page as usize) {
            *b &= !bits.bits();
        }
    }

    fn count(&self) -> (u32, u32) {
        let g = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        let mut av = 0u32;
        let mut af = 0u32;
        for b in g.iter() {
            let v = VmBits::from_bits(*b);
            if v.contains(VmBits::ALL_VISIBLE) {
                av += 1;
            }
            if v.contains(VmBits::ALL_FROZEN) {
                af += 1;
            }
        }
        (av, af)
    }

    fn truncate(&self, nblocks: PageNo) {
        let mut g = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        g.truncate(nblocks as usize);
    }
}

// ---------------- Relation lock ----------------

/// Эксклюзивная блокировка отношения с управляемыми конфликтами (для тестов).
#[derive(Debug, Default)]
pub struct MemRelationLock {
    held: AtomicBool,
    held_elsewhere: AtomicBool,
    fail_attempts: AtomicU32,
    waiters: AtomicU32,
    attempts: AtomicU32,
}

impl MemRelationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Держит ли кто-то другой конфликтующую блокировку.
    pub fn hold_elsewhere(&self, on: bool) {
        self.held_elsewhere.store(on, Ordering::SeqCst);
    }

    /// Следующие n попыток try_lock_exclusive завершатся неудачей.
    pub fn fail_next(&self, n: u32) {
        self.fail_attempts.store(n, Ordering::SeqCst);
    }

    pub fn set_waiters(&self, n: u32) {
        self.waiters.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl RelationLock for MemRelationLock {
    fn try_lock_exclusive(&self) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.held_elsewhere.load(Ordering::SeqCst) {
            return false;
        }
        let failed = self
            .fail_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return false;
        }
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn unlock(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_page_refuses_conditional_lock() -> Result<()> {
        let s = MemHeapStore::new("t", 8192, 4);
        let p = s.extend_initialized()?;
        s.pin(p);
        assert!(s.try_cleanup_lock(p)?.is_none());
        s.unpin(p);
        assert!(s.try_cleanup_lock(p)?.is_some());
        Ok(())
    }

    #[test]
    fn blocking_lock_waits_for_unpin() -> Result<()> {
        let s = MemHeapStore::new("t", 8192, 4);
        let p = s.extend_initialized()?;
        s.pin(p);
        std::thread::scope(|sc| {
            sc.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                s.unpin(p);
            });
            let g = s.cleanup_lock(p);
            assert!(g.is_ok());
        });
        Ok(())
    }

    #[test]
    fn truncate_drops_pages_and_fsm() -> Result<()> {
        let s = MemHeapStore::new("t", 8192, 8);
        for _ in 0..5 {
            s.extend_initialized()?;
        }
        s.record_free_space(4, 100);
        s.truncate(3)?;
        assert_eq!(s.nblocks(), 3);
        assert!(s.free_space(4).is_none());
        assert!(s.share_lock(3).is_err());
        assert!(s.truncate(4).is_err());
        Ok(())
    }

    #[test]
    fn relation_lock_fails_requested_attempts() {
        let l = MemRelationLock::new();
        l.fail_next(2);
        assert!(!l.try_lock_exclusive());
        assert!(!l.try_lock_exclusive());
        assert!(l.try_lock_exclusive());
        assert!(!l.try_lock_exclusive());
        l.unlock();
        assert_eq!(l.attempts(), 4);
    }

    #[test]
    fn vm_counts_bits() {
        let vm = MemVisibilityMap::new();
        vm.set(0, VmBits::ALL_VISIBLE);
        vm.set(3, VmBits::VALID);
        assert_eq!(vm.count(), (2, 1));
        vm.clear(3, VmBits::ALL_FROZEN);
        assert_eq!(vm.status(3), VmBits::ALL_VISIBLE);
        vm.truncate(1);
        assert_eq!(vm.count(), (1, 0));
    }
}
