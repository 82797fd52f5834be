//! Базовые идентификаторы: номера страниц, TupleId, Xid, MultiXactId.
//!
//! Xid сравниваются по модулю 2^32 (для нормальных id), как в хост-системе:
//! a "раньше" b, если (a - b) как i32 < 0. Специальные id (invalid/bootstrap/frozen)
//! всегда старше любых нормальных.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type PageNo = u32;
pub type OffsetNo = u16;

/// Первый валидный номер слота на странице (слоты 1-based).
pub const FIRST_OFFSET: OffsetNo = 1;

/// Идентификатор версии строки: (страница, слот). Порядок: сначала страница, затем слот.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TupleId {
    pub page: PageNo,
    pub offset: OffsetNo,
}

impl TupleId {
    #[inline]
    pub fn new(page: PageNo, offset: OffsetNo) -> Self {
        Self { page, offset }
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.page, self.offset)
    }
}

/// Transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Xid(pub u32);

impl Xid {
    pub const INVALID: Xid = Xid(0);
    pub const BOOTSTRAP: Xid = Xid(1);
    pub const FROZEN: Xid = Xid(2);
    pub const FIRST_NORMAL: Xid = Xid(3);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    pub fn precedes(self, other: Xid) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    pub fn precedes_or_equals(self, other: Xid) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 <= other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) <= 0
    }

    pub fn follows(self, other: Xid) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 > other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) > 0
    }

    /// self - age с переходом через 2^32; результат вне нормального
    /// диапазона заменяется на FIRST_NORMAL.
    pub fn retreat(self, age: u32) -> Xid {
        let x = Xid(self.0.wrapping_sub(age));
        if x.is_normal() {
            x
        } else {
            Self::FIRST_NORMAL
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// MultiXact id (набор lockers/updaters в xmax).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MultiXactId(pub u32);

impl MultiXactId {
    pub const INVALID: MultiXactId = MultiXactId(0);
    pub const FIRST: MultiXactId = MultiXactId(1);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn precedes(self, other: MultiXactId) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    pub fn precedes_or_equals(self, other: MultiXactId) -> bool {
        (self.0.wrapping_sub(other.0) as i32) <= 0
    }

    pub fn retreat(self, age: u32) -> MultiXactId {
        let m = MultiXactId(self.0.wrapping_sub(age));
        if m.0 < Self::FIRST.0 {
            Self::FIRST
        } else {
            m
        }
    }
}

impl fmt::Display for MultiXactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
