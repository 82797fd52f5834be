//! Общие константы движка vacuum (страницы, пороги, лимиты заморозки).

// -------- Pages --------
pub const DEFAULT_PAGE_SIZE: usize = 8192;
pub const PAGE_HEADER_SIZE: usize = 24;
pub const ITEM_ID_SIZE: usize = 4;
pub const TUPLE_HEADER_SIZE: usize = 23;
pub const MAX_ALIGN: usize = 8;

/// Максимум кортежей на странице (8K page): столько же line pointers
/// резервируется в dead-tuple store на одну страницу.
pub const MAX_TUPLES_PER_PAGE: usize = 291;

/// Размер одного TupleId в бюджете памяти (page u32 + offset u16).
pub const TUPLE_ID_BYTES: usize = 6;

// -------- Scan --------
/// Минимальная длина серии пропускаемых страниц, при которой пропуск
/// действительно применяется (иначе ломается read-ahead).
pub const SKIP_PAGES_THRESHOLD: u32 = 32;

// -------- Truncate --------
pub const REL_TRUNCATE_MINIMUM: u32 = 1000;
pub const REL_TRUNCATE_FRACTION: u32 = 16;
pub const TRUNCATE_LOCK_CHECK_INTERVAL_MS: u64 = 20;
pub const TRUNCATE_LOCK_WAIT_INTERVAL_MS: u64 = 50;
pub const TRUNCATE_LOCK_TIMEOUT_MS: u64 = 5000;
/// Обратный скан проверяет ожидающих блокировку не чаще, чем раз в N страниц.
pub const TRUNCATE_WAITER_CHECK_PAGES: u32 = 32;

// -------- Freeze limits --------
pub const FREEZE_MAX_AGE: u32 = 200_000_000;
pub const MULTIXACT_FREEZE_MAX_AGE: u32 = 400_000_000;

pub const DEFAULT_FREEZE_MIN_AGE: u32 = 50_000_000;
pub const DEFAULT_FREEZE_TABLE_AGE: u32 = 150_000_000;
pub const DEFAULT_MULTIXACT_FREEZE_MIN_AGE: u32 = 5_000_000;
pub const DEFAULT_MULTIXACT_FREEZE_TABLE_AGE: u32 = 150_000_000;

// -------- Memory --------
pub const DEFAULT_WORK_MEM_KB: usize = 64 * 1024;
