//! wal/reader - последовательный проход по кадрам WAL.
//!
//! Оборванный хвост (процесс упал посреди append) - это конец журнала,
//! а не ошибка. Битый CRC у полного кадра - ошибка.
//!
//!   let mut r = WalFileReader::open(&path)?;
//!   while let Some((lsn, rec)) = r.next_record()? { ... }

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use super::frame::{read_stream_header, FrameHeader};
use super::{WalRecord, WAL_HDR_SIZE, WAL_REC_HDR_SIZE};

/// Кадр, считанный с диска.
#[derive(Debug)]
pub struct WalFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
    /// Смещение заголовка в файле.
    pub pos: u64,
}

impl WalFrame {
    pub fn lsn(&self) -> u64 {
        self.header.lsn
    }

    pub fn record(&self) -> Result<WalRecord> {
        WalRecord::decode(self.header.rec_type, self.header.page_id, &self.payload)
            .with_context(|| format!("decode WAL record at pos {}", self.pos))
    }
}

pub struct WalFileReader {
    file: File,
    pos: u64,
    len: u64,
    stream_id: u64,
}

impl WalFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("open WAL {}", path.display()))?;
        let stream_id = read_stream_header(&mut file)
            .with_context(|| format!("read WAL header {}", path.display()))?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            pos: WAL_HDR_SIZE as u64,
            len,
            stream_id,
        })
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Конец последнего валидного кадра.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Прочитать buf целиком; false, если файл кончился раньше.
    fn fill(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.file.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(anyhow!("WAL read at {}: {}", self.pos, e)),
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<WalFrame>> {
        if self.pos + WAL_REC_HDR_SIZE as u64 > self.len {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(self.pos))?;
        let mut raw = [0u8; WAL_REC_HDR_SIZE];
        if !self.fill(&mut raw)? {
            return Ok(None);
        }
        let header = FrameHeader::parse(&raw);
        let end = self.pos + (WAL_REC_HDR_SIZE as u64) + header.payload_len as u64;
        if end > self.len {
            return Ok(None);
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        if !self.fill(&mut payload)? {
            return Ok(None);
        }
        if !header.matches(&raw, &payload) {
            return Err(anyhow!(
                "WAL CRC mismatch at pos {} (lsn {})",
                self.pos,
                header.lsn
            ));
        }
        let frame = WalFrame {
            header,
            payload,
            pos: self.pos,
        };
        self.pos = end;
        Ok(Some(frame))
    }

    pub fn next_record(&mut self) -> Result<Option<(u64, WalRecord)>> {
        match self.next_frame()? {
            Some(frame) => Ok(Some((frame.lsn(), frame.record()?))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::frame::{append_frame, write_stream_header};
    use std::fs::OpenOptions;
    use std::io::Write;

    fn scratch(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("qv-reader-{}-{}", name, std::process::id()))
    }

    fn write_two(path: &Path) -> Result<u64> {
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        write_stream_header(&mut f, 99)?;
        append_frame(&mut f, 1, &WalRecord::Truncate { nblocks: 3 })?;
        append_frame(&mut f, 2, &WalRecord::Truncate { nblocks: 2 })?;
        f.sync_all()?;
        Ok(f.metadata()?.len())
    }

    #[test]
    fn torn_tail_ends_the_log() -> Result<()> {
        let path = scratch("torn");
        let full = write_two(&path)?;
        OpenOptions::new().write(true).open(&path)?.set_len(full - 3)?;

        let mut r = WalFileReader::open(&path)?;
        assert_eq!(r.stream_id(), 99);
        let (lsn, rec) = r.next_record()?.expect("first frame intact");
        assert_eq!(lsn, 1);
        assert_eq!(rec, WalRecord::Truncate { nblocks: 3 });
        assert!(r.next_record()?.is_none());
        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[test]
    fn flipped_byte_is_reported() -> Result<()> {
        let path = scratch("crc");
        let full = write_two(&path)?;
        let mut f = OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(full - 1))?;
        f.write_all(&[0xAB])?;
        drop(f);

        let mut r = WalFileReader::open(&path)?;
        assert!(r.next_record()?.is_some());
        let err = r.next_record().unwrap_err();
        assert!(format!("{}", err).contains("CRC"));
        let _ = std::fs::remove_file(&path);
        Ok(())
    }
}
