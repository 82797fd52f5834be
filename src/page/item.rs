//! page/item - line pointers и заголовок кортежа (xmin/xmax/infomask).

use crate::types::{MultiXactId, OffsetNo, Xid};

// ----- infomask bits -----
pub const XMIN_COMMITTED: u16 = 0x0100;
pub const XMIN_INVALID: u16 = 0x0200;
/// Оба бита сразу - xmin заморожен.
pub const XMIN_FROZEN: u16 = XMIN_COMMITTED | XMIN_INVALID;
pub const XMAX_COMMITTED: u16 = 0x0400;
pub const XMAX_INVALID: u16 = 0x0800;
pub const XMAX_IS_MULTI: u16 = 0x1000;
pub const HOT_UPDATED: u16 = 0x4000;
pub const HEAP_ONLY: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleHeader {
    pub xmin: Xid,
    /// Xid удалившей транзакции, либо MultiXactId при XMAX_IS_MULTI.
    pub xmax: u32,
    pub infomask: u16,
}

impl TupleHeader {
    /// Живой кортеж без удаления.
    pub fn inserted(xmin: Xid) -> Self {
        Self {
            xmin,
            xmax: 0,
            infomask: XMAX_INVALID,
        }
    }

    /// Кортеж, удалённый транзакцией xmax.
    pub fn deleted(xmin: Xid, xmax: Xid) -> Self {
        Self {
            xmin,
            xmax: xmax.0,
            infomask: 0,
        }
    }

    #[inline]
    pub fn has(&self, bits: u16) -> bool {
        self.infomask & bits == bits
    }

    #[inline]
    pub fn set(&mut self, bits: u16) {
        self.infomask |= bits;
    }

    #[inline]
    pub fn clear(&mut self, bits: u16) {
        self.infomask &= !bits;
    }

    pub fn xmin_committed(&self) -> bool {
        self.has(XMIN_COMMITTED)
    }

    pub fn xmin_frozen(&self) -> bool {
        self.has(XMIN_FROZEN)
    }

    /// xmin с учётом заморозки: у замороженного кортежа это FROZEN.
    pub fn visible_xmin(&self) -> Xid {
        if self.xmin_frozen() {
            Xid::FROZEN
        } else {
            self.xmin
        }
    }

    pub fn xmax_is_multi(&self) -> bool {
        self.has(XMAX_IS_MULTI)
    }

    /// Xid в xmax (только если это не multixact).
    pub fn xmax_xid(&self) -> Xid {
        if self.xmax_is_multi() {
            Xid::INVALID
        } else {
            Xid(self.xmax)
        }
    }

    pub fn xmax_multi(&self) -> MultiXactId {
        if self.xmax_is_multi() {
            MultiXactId(self.xmax)
        } else {
            MultiXactId::INVALID
        }
    }

    /// xmax отсутствует или помечен недействительным.
    pub fn xmax_unset(&self) -> bool {
        self.xmax == 0 || self.has(XMAX_INVALID)
    }

    pub fn is_hot_updated(&self) -> bool {
        self.has(HOT_UPDATED)
    }

    pub fn is_heap_only(&self) -> bool {
        self.has(HEAP_ONLY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapTuple {
    pub header: TupleHeader,
    pub data: Vec<u8>,
}

impl HeapTuple {
    pub fn new(header: TupleHeader, data: impl Into<Vec<u8>>) -> Self {
        Self {
            header,
            data: data.into(),
        }
    }
}

/// Line pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemId {
    Unused,
    /// HOT-редирект на другой слот той же страницы.
    Redirect(OffsetNo),
    /// Мёртвый указатель без хранилища (ждёт удаления индексных ссылок).
    Dead,
    Normal(HeapTuple),
}

impl ItemId {
    #[inline]
    pub fn is_used(&self) -> bool {
        !matches!(self, ItemId::Unused)
    }

    #[inline]
    pub fn is_normal(&self) -> bool {
        matches!(self, ItemId::Normal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_is_both_hint_bits() {
        let mut h = TupleHeader::inserted(Xid(10));
        assert!(!h.xmin_frozen());
        h.set(XMIN_COMMITTED);
        assert!(h.xmin_committed());
        assert!(!h.xmin_frozen());
        h.set(XMIN_INVALID);
        assert!(h.xmin_frozen());
    }

    #[test]
    fn multi_xmax_is_not_a_xid() {
        let mut h = TupleHeader::deleted(Xid(10), Xid(20));
        assert_eq!(h.xmax_xid(), Xid(20));
        h.set(XMAX_IS_MULTI);
        assert_eq!(h.xmax_xid(), Xid::INVALID);
        assert_eq!(h.xmax_multi(), MultiXactId(20));
    }
}
