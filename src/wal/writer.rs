//! wal/writer - файловый WAL vacuum-записей.
//!
//! Один писатель на каталог (эксклюзивный LOCK через fs2, держится всё время
//! жизни VacuumWal). LSN выдаётся под мьютексом файла, поэтому порядок LSN
//! совпадает с порядком кадров в файле. При открытии существующего файла
//! частичный хвост отрезается, нумерация продолжается с последнего LSN.

use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::frame::{append_frame, new_stream_id, write_stream_header};
use super::reader::WalFileReader;
use super::{wal_path, WalRecord, WalSink, WAL_HDR_SIZE};
use crate::lock::{LockMode, WalDirLock};
use crate::metrics::{record_wal_append, record_wal_fsync};

struct WalFile {
    file: File,
    last_lsn: u64,
}

pub struct VacuumWal {
    path: PathBuf,
    stream_id: u64,
    inner: Mutex<WalFile>,
    _lock: WalDirLock,
}

impl VacuumWal {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create WAL dir {}", dir.display()))?;
        let lock = WalDirLock::acquire(dir, LockMode::Exclusive)?;
        let path = wal_path(dir);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open WAL {}", path.display()))?;

        let (stream_id, last_lsn) = if file.metadata()?.len() < WAL_HDR_SIZE as u64 {
            let sid = new_stream_id();
            file.set_len(0)?;
            write_stream_header(&mut file, sid)?;
            file.sync_all()?;
            (sid, 0)
        } else {
            let mut r = WalFileReader::open(&path)?;
            let mut last = 0u64;
            while let Some(frame) = r.next_frame()? {
                last = last.max(frame.lsn());
            }
            let valid_end = r.position();
            if valid_end < file.metadata()?.len() {
                log::warn!(
                    "WAL {}: truncating partial tail at {}",
                    path.display(),
                    valid_end
                );
                file.set_len(valid_end)?;
            }
            (r.stream_id(), last)
        };
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path,
            stream_id,
            inner: Mutex::new(WalFile { file, last_lsn }),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn last_lsn(&self) -> Result<u64> {
        let g = self.inner.lock().map_err(|_| anyhow!("WAL mutex poisoned"))?;
        Ok(g.last_lsn)
    }
}

impl WalSink for VacuumWal {
    fn append(&self, rec: &WalRecord) -> Result<u64> {
        let mut g = self.inner.lock().map_err(|_| anyhow!("WAL mutex poisoned"))?;
        let lsn = g.last_lsn + 1;
        let n = append_frame(&mut g.file, lsn, rec)
            .with_context(|| format!("append {} to {}", rec.name(), self.path.display()))?;
        g.last_lsn = lsn;
        record_wal_append(n);
        Ok(lsn)
    }

    fn flush(&self) -> Result<()> {
        let g = self.inner.lock().map_err(|_| anyhow!("WAL mutex poisoned"))?;
        g.file.sync_all()?;
        record_wal_fsync();
        Ok(())
    }
}
