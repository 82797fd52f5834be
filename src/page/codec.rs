//! page/codec - сериализация HeapPage в образ страницы (для NEW_PAGE записей WAL).
//!
//! Формат (LE):
//! - [magic4="QVHP"][page_no u32][page_size u32][lsn u64][flags u16][init u8][pad u8][nitems u16]
//! - nitems × item: [kind u8] + payload
//!     kind 0 = unused, 1 = redirect [to u16], 2 = dead,
//!     3 = normal [xmin u32][xmax u32][infomask u16][len u32][data]
//! - трейлер: CRC32C (u32) по всем предыдущим байтам.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use super::heap::HeapPage;
use super::item::{HeapTuple, ItemId, TupleHeader};
use crate::types::Xid;

pub const PAGE_IMAGE_MAGIC: &[u8; 4] = b"QVHP";
const HDR_LEN: usize = 4 + 4 + 4 + 8 + 2 + 1 + 1 + 2;

const KIND_UNUSED: u8 = 0;
const KIND_REDIRECT: u8 = 1;
const KIND_DEAD: u8 = 2;
const KIND_NORMAL: u8 = 3;

pub fn encode_page(page: &HeapPage) -> Vec<u8> {
    let mut out = Vec::with_capacity(HDR_LEN + page.items.len() * 16 + 4);
    let mut hdr = [0u8; HDR_LEN];
    hdr[0..4].copy_from_slice(PAGE_IMAGE_MAGIC);
    LittleEndian::write_u32(&mut hdr[4..8], page.page_no);
    LittleEndian::write_u32(&mut hdr[8..12], page.page_size as u32);
    LittleEndian::write_u64(&mut hdr[12..20], page.lsn);
    LittleEndian::write_u16(&mut hdr[20..22], page.flags);
    hdr[22] = page.initialized as u8;
    LittleEndian::write_u16(&mut hdr[24..26], page.items.len() as u16);
    out.extend_from_slice(&hdr);

    let mut b2 = [0u8; 2];
    let mut b4 = [0u8; 4];
    for it in &page.items {
        match it {
            ItemId::Unused => out.push(KIND_UNUSED),
            ItemId::Redirect(to) => {
                out.push(KIND_REDIRECT);
                LittleEndian::write_u16(&mut b2, *to);
                out.extend_from_slice(&b2);
            }
            ItemId::Dead => out.push(KIND_DEAD),
            ItemId::Normal(t) => {
                out.push(KIND_NORMAL);
                LittleEndian::write_u32(&mut b4, t.header.xmin.0);
                out.extend_from_slice(&b4);
                LittleEndian::write_u32(&mut b4, t.header.xmax);
                out.extend_from_slice(&b4);
                LittleEndian::write_u16(&mut b2, t.header.infomask);
                out.extend_from_slice(&b2);
                LittleEndian::write_u32(&mut b4, t.data.len() as u32);
                out.extend_from_slice(&b4);
                out.extend_from_slice(&t.data);
            }
        }
    }

    let crc = crc32c::crc32c(&out);
    LittleEndian::write_u32(&mut b4, crc);
    out.extend_from_slice(&b4);
    out
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(anyhow!(
                "page image truncated at {} (need {} more bytes)",
                self.pos,
                n
            ));
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
}

pub fn decode_page(buf: &[u8]) -> Result<HeapPage> {
    if buf.len() < HDR_LEN + 4 {
        return Err(anyhow!("page image too short: {} bytes", buf.len()));
    }
    let body = &buf[..buf.len() - 4];
    let stored = LittleEndian::read_u32(&buf[buf.len() - 4..]);
    let actual = crc32c::crc32c(body);
    if stored != actual {
        return Err(anyhow!(
            "page image CRC mismatch: stored={:08x} actual={:08x}",
            stored,
            actual
        ));
    }
    if &body[0..4] != PAGE_IMAGE_MAGIC {
        return Err(anyhow!("bad page image magic"));
    }

    let page_no = LittleEndian::read_u32(&body[4..8]);
    let page_size = LittleEndian::read_u32(&body[8..12]) as usize;
    let lsn = LittleEndian::read_u64(&body[12..20]);
    let flags = LittleEndian::read_u16(&body[20..22]);
    let initialized = body[22] != 0;
    let nitems = LittleEndian::read_u16(&body[24..26]) as usize;

    let mut c = Cursor {
        buf: body,
        pos: HDR_LEN,
    };
    let mut items = Vec::with_capacity(nitems);
    for _ in 0..nitems {
        let it = match c.u8()? {
            KIND_UNUSED => ItemId::Unused,
            KIND_REDIRECT => ItemId::Redirect(c.u16()?),
            KIND_DEAD => ItemId::Dead,
            KIND_NORMAL => {
                let xmin = Xid(c.u32()?);
                let xmax = c.u32()?;
                let infomask = c.u16()?;
                let len = c.u32()? as usize;
                let data = c.take(len)?.to_vec();
                ItemId::Normal(HeapTuple {
                    header: TupleHeader {
                        xmin,
                        xmax,
                        infomask,
                    },
                    data,
                })
            }
            k => return Err(anyhow!("unknown item kind {} in page image", k)),
        };
        items.push(it);
    }
    if c.pos != body.len() {
        return Err(anyhow!(
            "trailing {} bytes in page image",
            body.len() - c.pos
        ));
    }

    Ok(HeapPage {
        page_no,
        page_size,
        lsn,
        flags,
        initialized,
        items,
    })
}
