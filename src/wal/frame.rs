//! wal/frame - раскладка файла и кадров WAL (P2VWAL01).
//!
//! Файл: [magic 8][stream_id u64] и далее кадры [заголовок 28][payload].
//! Заголовок кадра:
//!   0      type u8
//!   1      flags (0)
//!   2..4   резерв (нули)
//!   4..12  lsn u64
//!   12..20 page_id u64 (блок кучи; 0 для CleanupInfo/Truncate)
//!   20..24 payload_len u32
//!   24..28 crc32c(header[0..24) + payload)

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use super::{WalRecord, WAL_HDR_SIZE, WAL_MAGIC, WAL_REC_HDR_SIZE};

const OFF_LSN: usize = 4;
const OFF_PAGE: usize = 12;
const OFF_LEN: usize = 20;
const OFF_CRC: usize = 24;

fn frame_crc(head: &[u8], payload: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(head), payload)
}

/// Разобранный заголовок кадра.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub rec_type: u8,
    pub lsn: u64,
    pub page_id: u64,
    pub payload_len: u32,
    pub crc: u32,
}

impl FrameHeader {
    /// Собрать заголовок для записи rec с уже закодированным payload.
    pub fn seal(lsn: u64, rec: &WalRecord, payload: &[u8]) -> Result<[u8; WAL_REC_HDR_SIZE]> {
        let Ok(len) = u32::try_from(payload.len()) else {
            bail!("{} payload too large: {} bytes", rec.name(), payload.len());
        };
        let mut buf = [0u8; WAL_REC_HDR_SIZE];
        buf[0] = rec.rec_type();
        LittleEndian::write_u64(&mut buf[OFF_LSN..OFF_PAGE], lsn);
        LittleEndian::write_u64(&mut buf[OFF_PAGE..OFF_LEN], rec.page_id());
        LittleEndian::write_u32(&mut buf[OFF_LEN..OFF_CRC], len);
        let crc = frame_crc(&buf[..OFF_CRC], payload);
        LittleEndian::write_u32(&mut buf[OFF_CRC..], crc);
        Ok(buf)
    }

    pub fn parse(buf: &[u8; WAL_REC_HDR_SIZE]) -> Self {
        Self {
            rec_type: buf[0],
            lsn: LittleEndian::read_u64(&buf[OFF_LSN..OFF_PAGE]),
            page_id: LittleEndian::read_u64(&buf[OFF_PAGE..OFF_LEN]),
            payload_len: LittleEndian::read_u32(&buf[OFF_LEN..OFF_CRC]),
            crc: LittleEndian::read_u32(&buf[OFF_CRC..]),
        }
    }

    /// Совпадает ли сохранённый CRC с пересчитанным по header + payload.
    pub fn matches(&self, raw: &[u8; WAL_REC_HDR_SIZE], payload: &[u8]) -> bool {
        frame_crc(&raw[..OFF_CRC], payload) == self.crc
    }
}

/// Дописать запись кадром; возвращает размер кадра в байтах.
pub fn append_frame<W: Write>(w: &mut W, lsn: u64, rec: &WalRecord) -> Result<usize> {
    let payload = rec.encode_payload();
    let hdr = FrameHeader::seal(lsn, rec, &payload)?;
    w.write_all(&hdr)?;
    w.write_all(&payload)?;
    Ok(WAL_REC_HDR_SIZE + payload.len())
}

/// Новый stream_id: случайный, чтобы отличать пересозданные файлы.
pub fn new_stream_id() -> u64 {
    rand::random()
}

pub fn write_stream_header(f: &mut File, stream_id: u64) -> Result<()> {
    let mut buf = [0u8; WAL_HDR_SIZE];
    buf[..8].copy_from_slice(WAL_MAGIC);
    LittleEndian::write_u64(&mut buf[8..], stream_id);
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&buf)?;
    Ok(())
}

pub fn read_stream_header(f: &mut File) -> Result<u64> {
    let mut buf = [0u8; WAL_HDR_SIZE];
    f.seek(SeekFrom::Start(0))?;
    if let Err(e) = f.read_exact(&mut buf) {
        bail!("WAL header unreadable: {}", e);
    }
    if &buf[..8] != WAL_MAGIC {
        bail!("bad WAL magic");
    }
    Ok(LittleEndian::read_u64(&buf[8..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Xid;

    #[test]
    fn crc_covers_payload() -> Result<()> {
        let rec = WalRecord::CleanupInfo {
            latest_removed_xid: Xid(7),
        };
        let payload = rec.encode_payload();
        let raw = FrameHeader::seal(3, &rec, &payload)?;
        let h = FrameHeader::parse(&raw);
        assert_eq!(h.lsn, 3);
        assert_eq!(h.rec_type, rec.rec_type());
        assert_eq!(h.payload_len as usize, payload.len());
        assert!(h.matches(&raw, &payload));

        let mut bad = payload.clone();
        bad[0] ^= 0xff;
        assert!(!h.matches(&raw, &bad));
        Ok(())
    }

    #[test]
    fn frame_length_matches_header() -> Result<()> {
        let mut buf = Vec::new();
        let n = append_frame(&mut buf, 1, &WalRecord::Truncate { nblocks: 12 })?;
        assert_eq!(buf.len(), n);
        let mut raw = [0u8; WAL_REC_HDR_SIZE];
        raw.copy_from_slice(&buf[..WAL_REC_HDR_SIZE]);
        let h = FrameHeader::parse(&raw);
        assert_eq!(h.page_id, 0);
        assert_eq!(WAL_REC_HDR_SIZE + h.payload_len as usize, n);
        Ok(())
    }
}
