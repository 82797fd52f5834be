//! page/heap - heap-страница: line pointers (1-based), флаги, LSN, учёт свободного места.
//!
//! Хранение кортежей в памяти структурное (Vec<ItemId>), а размеры считаются
//! так же, как для дисковой 8K-страницы: заголовок 24 байта, 4 байта на line
//! pointer, MAXALIGN(23 + len) на кортеж.

use anyhow::{anyhow, Result};

use super::item::{HeapTuple, ItemId};
use crate::consts::{
    ITEM_ID_SIZE, MAX_ALIGN, MAX_TUPLES_PER_PAGE, PAGE_HEADER_SIZE, TUPLE_HEADER_SIZE,
};
use crate::types::{OffsetNo, PageNo};

// ----- page flags -----
pub const PD_ALL_VISIBLE: u16 = 0x0004;
pub const PD_HAS_FREE_LINES: u16 = 0x0001;

#[inline]
fn max_align(n: usize) -> usize {
    (n + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeapPage {
    pub page_no: PageNo,
    pub page_size: usize,
    pub lsn: u64,
    pub flags: u16,
    /// false - "новая" страница (нули на диске, PageInit не выполнялся).
    pub initialized: bool,
    pub items: Vec<ItemId>,
}

impl HeapPage {
    /// Неинициализированная страница (как после extend без записи).
    pub fn new_uninit(page_no: PageNo, page_size: usize) -> Self {
        Self {
            page_no,
            page_size,
            lsn: 0,
            flags: 0,
            initialized: false,
            items: Vec::new(),
        }
    }

    pub fn new_empty(page_no: PageNo, page_size: usize) -> Self {
        let mut p = Self::new_uninit(page_no, page_size);
        p.init();
        p
    }

    /// PageInit: пустая инициализированная страница.
    pub fn init(&mut self) {
        self.initialized = true;
        self.flags = 0;
        self.items.clear();
    }

    #[inline]
    pub fn is_new(&self) -> bool {
        !self.initialized
    }

    /// Инициализирована и не содержит ни одного line pointer.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.initialized && self.items.is_empty()
    }

    #[inline]
    pub fn max_offset(&self) -> OffsetNo {
        self.items.len() as OffsetNo
    }

    pub fn is_all_visible(&self) -> bool {
        self.flags & PD_ALL_VISIBLE != 0
    }

    pub fn set_all_visible(&mut self) {
        self.flags |= PD_ALL_VISIBLE;
    }

    pub fn clear_all_visible(&mut self) {
        self.flags &= !PD_ALL_VISIBLE;
    }

    pub fn item(&self, off: OffsetNo) -> Option<&ItemId> {
        if off == 0 {
            return None;
        }
        self.items.get(off as usize - 1)
    }

    pub fn item_mut(&mut self, off: OffsetNo) -> Option<&mut ItemId> {
        if off == 0 {
            return None;
        }
        self.items.get_mut(off as usize - 1)
    }

    /// (offset, item) по всем слотам.
    pub fn iter(&self) -> impl Iterator<Item = (OffsetNo, &ItemId)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, it)| ((i + 1) as OffsetNo, it))
    }

    fn used_bytes(&self) -> usize {
        let tuples: usize = self
            .items
            .iter()
            .map(|it| match it {
                ItemId::Normal(t) => max_align(TUPLE_HEADER_SIZE + t.data.len()),
                _ => 0,
            })
            .sum();
        PAGE_HEADER_SIZE + self.items.len() * ITEM_ID_SIZE + tuples
    }

    fn has_unused(&self) -> bool {
        self.items.iter().any(|it| !it.is_used())
    }

    /// Свободное место с учётом нового line pointer; 0, если слотов больше нет.
    pub fn heap_free_space(&self) -> usize {
        if self.is_new() {
            return 0;
        }
        let used = self.used_bytes();
        let space = self.page_size.saturating_sub(used);
        let space = if space < ITEM_ID_SIZE {
            0
        } else {
            space - ITEM_ID_SIZE
        };
        if self.items.len() >= MAX_TUPLES_PER_PAGE && !self.has_unused() {
            return 0;
        }
        space
    }

    /// Добавить кортеж: переиспользуем первый свободный слот, иначе новый.
    pub fn add_tuple(&mut self, tuple: HeapTuple) -> Result<OffsetNo> {
        if self.is_new() {
            return Err(anyhow!("page {} is not initialized", self.page_no));
        }
        let need = max_align(TUPLE_HEADER_SIZE + tuple.data.len());
        if need > self.heap_free_space() {
            return Err(anyhow!(
                "page {}: no room for tuple of {} bytes",
                self.page_no,
                tuple.data.len()
            ));
        }
        if self.flags & PD_HAS_FREE_LINES != 0 {
            if let Some(pos) = self.items.iter().position(|it| !it.is_used()) {
                self.items[pos] = ItemId::Normal(tuple);
                if !self.has_unused() {
                    self.flags &= !PD_HAS_FREE_LINES;
                }
                return Ok((pos + 1) as OffsetNo);
            }
        }
        self.items.push(ItemId::Normal(tuple));
        Ok(self.items.len() as OffsetNo)
    }

    pub fn set_unused(&mut self, off: OffsetNo) -> Result<()> {
        let page_no = self.page_no;
        let it = self
            .item_mut(off)
            .ok_or_else(|| anyhow!("page {}: offset {} out of range", page_no, off))?;
        *it = ItemId::Unused;
        Ok(())
    }

    pub fn set_dead(&mut self, off: OffsetNo) -> Result<()> {
        let page_no = self.page_no;
        let it = self
            .item_mut(off)
            .ok_or_else(|| anyhow!("page {}: offset {} out of range", page_no, off))?;
        *it = ItemId::Dead;
        Ok(())
    }

    /// Уплотнение после освобождения слотов: хранилище кортежей пересчитывается
    /// из line pointers, здесь остаётся только хинт о свободных слотах.
    pub fn repair_fragmentation(&mut self) {
        if self.has_unused() {
            self.flags |= PD_HAS_FREE_LINES;
        } else {
            self.flags &= !PD_HAS_FREE_LINES;
        }
    }

    /// Есть ли на странице хоть один занятый слот (для truncation).
    pub fn has_used_items(&self) -> bool {
        self.items.iter().any(|it| it.is_used())
    }
}
