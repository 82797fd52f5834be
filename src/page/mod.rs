//! page - heap-страница отношения и её образ.
//!
//! Разделение по подмодулям:
//! - item.rs  - line pointers (Unused/Redirect/Dead/Normal) и заголовок кортежа (xmin/xmax/infomask).
//! - heap.rs  - HeapPage: флаги (ALL_VISIBLE), LSN, свободное место, добавление/освобождение слотов.
//! - codec.rs - образ страницы с CRC32C-трейлером (для NEW_PAGE записей WAL).

pub mod item;
pub mod heap;
pub mod codec;

// ---------------- re-exports (внешний API модуля page) ----------------

pub use heap::{HeapPage, PD_ALL_VISIBLE};
pub use item::{HeapTuple, ItemId, TupleHeader};
pub use codec::{decode_page, encode_page};
