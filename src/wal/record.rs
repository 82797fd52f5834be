//! wal/record - типизированные vacuum-записи и их payload (LE).
//!
//! - CLEANUP_INFO: [latest_removed_xid u32]                               page_id = 0
//! - CLEAN:        [latest_removed_xid u32][nredir u16][ndead u16][nunused u16]
//!                 nredir × [from u16][to u16], ndead × u16, nunused × u16
//! - FREEZE:       [cutoff u32][n u16] n × [offset u16][flags u8] (1 = xmin, 2 = xmax)
//! - VISIBLE:      [cutoff u32][vm bits u8]
//! - NEW_PAGE:     образ страницы (page::encode_page)
//! - TRUNCATE:     [nblocks u32]                                          page_id = 0

use anyhow::{anyhow, bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use super::{
    WAL_REC_CLEAN, WAL_REC_CLEANUP_INFO, WAL_REC_FREEZE, WAL_REC_NEW_PAGE, WAL_REC_TRUNCATE,
    WAL_REC_VISIBLE,
};
use crate::types::{OffsetNo, PageNo, Xid};
use crate::visibility::FreezePlan;

const FREEZE_XMIN: u8 = 0x01;
const FREEZE_XMAX: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum WalRecord {
    /// Пишется до удаления индексных ссылок цикла: реплика должна разрешить
    /// конфликты с запросами до того, как увидит удаление в индексах.
    CleanupInfo { latest_removed_xid: Xid },
    Clean {
        page: PageNo,
        latest_removed_xid: Xid,
        redirected: Vec<(OffsetNo, OffsetNo)>,
        dead: Vec<OffsetNo>,
        unused: Vec<OffsetNo>,
    },
    Freeze {
        page: PageNo,
        cutoff: Xid,
        plans: Vec<FreezePlan>,
    },
    Visible { page: PageNo, cutoff: Xid, flags: u8 },
    NewPage {
        page: PageNo,
        #[serde(skip)]
        image: Vec<u8>,
    },
    Truncate { nblocks: PageNo },
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    LittleEndian::write_u16(&mut b, v);
    out.extend_from_slice(&b);
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

struct Cur<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cur<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            bail!("WAL payload truncated at {} (need {} bytes)", self.pos, n);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }
    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }
    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            bail!("{} trailing bytes in WAL payload", self.buf.len() - self.pos);
        }
        Ok(())
    }
}

impl WalRecord {
    pub fn rec_type(&self) -> u8 {
        match self {
            WalRecord::CleanupInfo { .. } => WAL_REC_CLEANUP_INFO,
            WalRecord::Clean { .. } => WAL_REC_CLEAN,
            WalRecord::Freeze { .. } => WAL_REC_FREEZE,
            WalRecord::Visible { .. } => WAL_REC_VISIBLE,
            WalRecord::NewPage { .. } => WAL_REC_NEW_PAGE,
            WalRecord::Truncate { .. } => WAL_REC_TRUNCATE,
        }
    }

    pub fn page_id(&self) -> u64 {
        match self {
            WalRecord::Clean { page, .. }
            | WalRecord::Freeze { page, .. }
            | WalRecord::Visible { page, .. }
            | WalRecord::NewPage { page, .. } => *page as u64,
            WalRecord::CleanupInfo { .. } | WalRecord::Truncate { .. } => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WalRecord::CleanupInfo { .. } => "CLEANUP_INFO",
            WalRecord::Clean { .. } => "CLEAN",
            WalRecord::Freeze { .. } => "FREEZE",
            WalRecord::Visible { .. } => "VISIBLE",
            WalRecord::NewPage { .. } => "NEW_PAGE",
            WalRecord::Truncate { .. } => "TRUNCATE",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            WalRecord::CleanupInfo { latest_removed_xid } => put_u32(&mut out, latest_removed_xid.0),
            WalRecord::Clean {
                latest_removed_xid,
                redirected,
                dead,
                unused,
                ..
            } => {
                put_u32(&mut out, latest_removed_xid.0);
                put_u16(&mut out, redirected.len() as u16);
                put_u16(&mut out, dead.len() as u16);
                put_u16(&mut out, unused.len() as u16);
                for &(from, to) in redirected {
                    put_u16(&mut out, from);
                    put_u16(&mut out, to);
                }
                for &o in dead.iter().chain(unused.iter()) {
                    put_u16(&mut out, o);
                }
            }
            WalRecord::Freeze { cutoff, plans, .. } => {
                put_u32(&mut out, cutoff.0);
                put_u16(&mut out, plans.len() as u16);
                for p in plans {
                    put_u16(&mut out, p.offset);
                    let mut f = 0u8;
                    if p.freeze_xmin {
                        f |= FREEZE_XMIN;
                    }
                    if p.clear_xmax {
                        f |= FREEZE_XMAX;
                    }
                    out.push(f);
                }
            }
            WalRecord::Visible { cutoff, flags, .. } => {
                put_u32(&mut out, cutoff.0);
                out.push(*flags);
            }
            WalRecord::NewPage { image, .. } => out.extend_from_slice(image),
            WalRecord::Truncate { nblocks } => put_u32(&mut out, *nblocks),
        }
        out
    }

    pub fn decode(rec_type: u8, page_id: u64, payload: &[u8]) -> Result<WalRecord> {
        let page = u32::try_from(page_id).map_err(|_| anyhow!("page id {} out of range", page_id))?;
        let mut c = Cur {
            buf: payload,
            pos: 0,
        };
        let rec = match rec_type {
            WAL_REC_CLEANUP_INFO => WalRecord::CleanupInfo {
                latest_removed_xid: Xid(c.u32()?),
            },
            WAL_REC_CLEAN => {
                let latest_removed_xid = Xid(c.u32()?);
                let nr = c.u16()? as usize;
                let nd = c.u16()? as usize;
                let nu = c.u16()? as usize;
                let mut redirected = Vec::with_capacity(nr);
                for _ in 0..nr {
                    redirected.push((c.u16()?, c.u16()?));
                }
                let mut dead = Vec::with_capacity(nd);
                for _ in 0..nd {
                    dead.push(c.u16()?);
                }
                let mut unused = Vec::with_capacity(nu);
                for _ in 0..nu {
                    unused.push(c.u16()?);
                }
                WalRecord::Clean {
                    page,
                    latest_removed_xid,
                    redirected,
                    dead,
                    unused,
                }
            }
            WAL_REC_FREEZE => {
                let cutoff = Xid(c.u32()?);
                let n = c.u16()? as usize;
                let mut plans = Vec::with_capacity(n);
                for _ in 0..n {
                    let offset = c.u16()?;
                    let f = c.u8()?;
                    plans.push(FreezePlan {
                        offset,
                        freeze_xmin: f & FREEZE_XMIN != 0,
                        clear_xmax: f & FREEZE_XMAX != 0,
                    });
                }
                WalRecord::Freeze {
                    page,
                    cutoff,
                    plans,
                }
            }
            WAL_REC_VISIBLE => WalRecord::Visible {
                page,
                cutoff: Xid(c.u32()?),
                flags: c.u8()?,
            },
            WAL_REC_NEW_PAGE => {
                c.pos = payload.len();
                WalRecord::NewPage {
                    page,
                    image: payload.to_vec(),
                }
            }
            WAL_REC_TRUNCATE => WalRecord::Truncate {
                nblocks: c.u32()?,
            },
            t => bail!("unknown vacuum WAL record type {}", t),
        };
        c.finish()?;
        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_record_keeps_all_offset_lists() -> Result<()> {
        let r = WalRecord::Clean {
            page: 9,
            latest_removed_xid: Xid(77),
            redirected: vec![(1, 3)],
            dead: vec![2, 5],
            unused: vec![4],
        };
        let back = WalRecord::decode(r.rec_type(), r.page_id(), &r.encode_payload())?;
        assert_eq!(back, r);
        Ok(())
    }

    #[test]
    fn short_or_long_payload_is_rejected() {
        assert!(WalRecord::decode(WAL_REC_CLEANUP_INFO, 0, &[1, 2]).is_err());
        assert!(WalRecord::decode(WAL_REC_TRUNCATE, 0, &[1, 2, 3, 4, 5]).is_err());
        assert!(WalRecord::decode(99, 0, &[]).is_err());
    }
}
