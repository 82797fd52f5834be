//! WAL vacuum-записей (P2VWAL01).
//!
//! - record.rs - типизированные записи и их payload;
//! - frame.rs  - раскладка файла и кадров, CRC32C;
//! - writer.rs - файловый VacuumWal (LOCK каталога, монотонный LSN, fsync);
//! - reader.rs - последовательное чтение кадров (wal-dump, тесты);
//! - memory.rs - MemWal и NullWal.

use anyhow::Result;
use std::path::{Path, PathBuf};

pub const WAL_FILE: &str = "vacuum-000001.log";
pub const WAL_MAGIC: &[u8; 8] = b"P2VWAL01";
/// magic + stream_id
pub const WAL_HDR_SIZE: usize = 16;
pub const WAL_REC_HDR_SIZE: usize = 28;

pub const WAL_REC_CLEANUP_INFO: u8 = 1;
pub const WAL_REC_CLEAN: u8 = 2;
pub const WAL_REC_FREEZE: u8 = 3;
pub const WAL_REC_VISIBLE: u8 = 4;
pub const WAL_REC_NEW_PAGE: u8 = 5;
pub const WAL_REC_TRUNCATE: u8 = 6;

pub fn wal_path(dir: &Path) -> PathBuf {
    dir.join(WAL_FILE)
}

/// Куда движок пишет WAL-записи. append возвращает LSN записи; он ставится
/// на страницу до снятия её блокировки.
pub trait WalSink: Send + Sync {
    fn append(&self, rec: &WalRecord) -> Result<u64>;

    /// Сделать записанное durable (конец прогона).
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

pub mod frame;
pub mod memory;
pub mod reader;
pub mod record;
pub mod writer;

pub use frame::FrameHeader;
pub use memory::{MemWal, NullWal};
pub use reader::{WalFileReader, WalFrame};
pub use record::WalRecord;
pub use writer::VacuumWal;
