//! store - интерфейсы внешних коллабораторов: heap, visibility map, блокировка отношения.
//!
//! Движок работает только через эти трейты (objects-safe, Send + Sync), чтобы
//! параллельные воркеры могли делить одно отношение.
//!
//! - HeapStore      - страницы отношения: cleanup/share latch, truncate, FSM.
//! - VisibilityMap  - advisory биты ALL_VISIBLE / ALL_FROZEN на страницу.
//! - RelationLock   - эксклюзивная блокировка отношения для truncation.
//!
//! In-memory реализации - store/mem.rs.

use anyhow::Result;
use std::ops::{BitOr, BitOrAssign};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};

use crate::page::HeapPage;
use crate::types::PageNo;

pub mod mem;

pub use mem::{MemHeapStore, MemRelationLock, MemVisibilityMap};

pub type PageWriteGuard<'a> = RwLockWriteGuard<'a, HeapPage>;
pub type PageReadGuard<'a> = RwLockReadGuard<'a, HeapPage>;

pub trait HeapStore: Send + Sync {
    fn name(&self) -> &str;

    /// Текущее число страниц отношения.
    fn nblocks(&self) -> PageNo;

    /// Conditional cleanup lock: None, если страница закреплена кем-то ещё
    /// или её latch занят.
    fn try_cleanup_lock(&self, page: PageNo) -> Result<Option<PageWriteGuard<'_>>>;

    /// Блокирующий cleanup lock (ждёт снятия чужих pin'ов).
    fn cleanup_lock(&self, page: PageNo) -> Result<PageWriteGuard<'_>>;

    fn share_lock(&self, page: PageNo) -> Result<PageReadGuard<'_>>;

    /// Кратковременно взять и отпустить extension lock: после этого
    /// конкурентное расширение отношения гарантированно завершено.
    fn wait_for_extension(&self) -> Result<()>;

    fn truncate(&self, nblocks: PageNo) -> Result<()>;

    fn record_free_space(&self, page: PageNo, free: usize);

    /// Нужно ли журналировать изменения этого отношения.
    fn needs_wal(&self) -> bool;
}

/// Биты visibility map на одну страницу.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmBits(u8);

impl VmBits {
    pub const NONE: VmBits = VmBits(0);
    pub const ALL_VISIBLE: VmBits = VmBits(0x01);
    pub const ALL_FROZEN: VmBits = VmBits(0x02);
    pub const VALID: VmBits = VmBits(0x03);

    pub fn from_bits(b: u8) -> Self {
        VmBits(b & Self::VALID.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: VmBits) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn without(self, other: VmBits) -> VmBits {
        VmBits(self.0 & !other.0)
    }
}

impl BitOr for VmBits {
    type Output = VmBits;
    fn bitor(self, rhs: VmBits) -> VmBits {
        VmBits(self.0 | rhs.0)
    }
}

impl BitOrAssign for VmBits {
    fn bitor_assign(&mut self, rhs: VmBits) {
        self.0 |= rhs.0;
    }
}

pub trait VisibilityMap: Send + Sync {
    fn status(&self, page: PageNo) -> VmBits;
    fn set(&self, page: PageNo, bits: VmBits);
    fn clear(&self, page: PageNo, bits: VmBits);
    /// (all_visible, all_frozen) по всему отношению.
    fn count(&self) -> (u32, u32);
    fn truncate(&self, nblocks: PageNo);
}

pub trait RelationLock: Send + Sync {
    /// Неблокирующая попытка взять эксклюзивную блокировку отношения.
    fn try_lock_exclusive(&self) -> bool;
    fn unlock(&self);
    /// Ждёт ли кто-то нашу эксклюзивную блокировку.
    fn has_waiters(&self) -> bool;
}
