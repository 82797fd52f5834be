use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;

use quiver_vacuum::lock::{LockMode, WalDirLock};
use quiver_vacuum::wal::{wal_path, WalFileReader, WalRecord};

#[derive(Serialize)]
struct DumpLine<'a> {
    lsn: u64,
    #[serde(flatten)]
    rec: &'a WalRecord,
}

/// CLI: wal-dump - построчная печать записей vacuum WAL.
///
/// Берёт shared lock каталога: не читает файл, который writer ещё создаёт.
/// Частичный хвост молча игнорируется, CRC mismatch - ошибка.
pub fn exec(dir: PathBuf, json: bool) -> Result<()> {
    let _lock = WalDirLock::acquire(&dir, LockMode::Shared)
        .with_context(|| format!("lock WAL dir {}", dir.display()))?;
    let path = wal_path(&dir);
    let mut r =
        WalFileReader::open(&path).with_context(|| format!("open WAL {}", path.display()))?;

    if !json {
        println!("stream_id = {}", r.stream_id());
    }
    let mut n = 0u64;
    while let Some((lsn, rec)) = r.next_record()? {
        n += 1;
        if json {
            let line = serde_json::to_string(&DumpLine { lsn, rec: &rec })
                .context("serialize WAL record")?;
            println!("{}", line);
        } else {
            println!("{:>8}  {:<12} {:?}", lsn, rec.name(), rec);
        }
    }
    if !json {
        println!("{} records", n);
    }
    Ok(())
}
