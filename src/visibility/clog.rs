//! visibility/clog - статусы транзакций в памяти и satisfies_vacuum поверх них.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{TupleVisibility, VisibilityOracle};
use crate::page::item::{TupleHeader, XMAX_COMMITTED, XMAX_INVALID, XMIN_COMMITTED, XMIN_INVALID};
use crate::types::Xid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidStatus {
    InProgress,
    Committed,
    Aborted,
}

/// Commit log: xid -> статус. Специальные xid (bootstrap/frozen) считаются
/// зафиксированными; незарегистрированный нормальный xid - ошибка.
#[derive(Debug, Default)]
pub struct CommitLogOracle {
    status: RwLock<HashMap<Xid, XidStatus>>,
}

impl CommitLogOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, xid: Xid, st: XidStatus) {
        let mut g = self
            .status
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        g.insert(xid, st);
    }

    pub fn commit(&self, xid: Xid) {
        self.set(xid, XidStatus::Committed);
    }

    pub fn abort(&self, xid: Xid) {
        self.set(xid, XidStatus::Aborted);
    }

    pub fn begin(&self, xid: Xid) {
        self.set(xid, XidStatus::InProgress);
    }

    pub fn status(&self, xid: Xid) -> Result<XidStatus> {
        if !xid.is_normal() {
            return Ok(XidStatus::Committed);
        }
        let g = self
            .status
            .read()
            .map_err(|_| anyhow!("commit log lock poisoned"))?;
        g.get(&xid)
            .copied()
            .ok_or_else(|| anyhow!("could not access status of transaction {}", xid))
    }
}

impl VisibilityOracle for CommitLogOracle {
    fn satisfies_vacuum(&self, t: &mut TupleHeader, oldest_xmin: Xid) -> Result<TupleVisibility> {
        if !t.xmin_committed() {
            if t.has(XMIN_INVALID) {
                return Ok(TupleVisibility::Dead);
            }
            match self.status(t.xmin)? {
                XidStatus::InProgress => {
                    if !t.xmax_unset() && !t.xmax_is_multi() && t.xmax_xid() == t.xmin {
                        return Ok(TupleVisibility::DeleteInProgress);
                    }
                    return Ok(TupleVisibility::InsertInProgress);
                }
                XidStatus::Aborted => {
                    t.set(XMIN_INVALID);
                    return Ok(TupleVisibility::Dead);
                }
                XidStatus::Committed => t.set(XMIN_COMMITTED),
            }
        }

        if t.xmax_unset() {
            return Ok(TupleVisibility::Live);
        }
        // multixact в xmax - только блокировки, удаления нет
        if t.xmax_is_multi() {
            return Ok(TupleVisibility::Live);
        }

        let xmax = t.xmax_xid();
        if !t.has(XMAX_COMMITTED) {
            match self.status(xmax)? {
                XidStatus::InProgress => return Ok(TupleVisibility::DeleteInProgress),
                XidStatus::Aborted => {
                    t.set(XMAX_INVALID);
                    return Ok(TupleVisibility::Live);
                }
                XidStatus::Committed => t.set(XMAX_COMMITTED),
            }
        }

        if xmax.precedes(oldest_xmin) {
            Ok(TupleVisibility::Dead)
        } else {
            Ok(TupleVisibility::RecentlyDead)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_commit_log() -> Result<()> {
        let o = CommitLogOracle::new();
        o.commit(Xid(10));
        o.commit(Xid(20));
        o.commit(Xid(200));
        o.begin(Xid(300));
        o.abort(Xid(400));

        let h = Xid(100);
        let mut live = TupleHeader::inserted(Xid(10));
        assert_eq!(o.satisfies_vacuum(&mut live, h)?, TupleVisibility::Live);
        assert!(live.xmin_committed());

        let mut dead = TupleHeader::deleted(Xid(10), Xid(20));
        assert_eq!(o.satisfies_vacuum(&mut dead, h)?, TupleVisibility::Dead);

        let mut recent = TupleHeader::deleted(Xid(10), Xid(200));
        assert_eq!(o.satisfies_vacuum(&mut recent, h)?, TupleVisibility::RecentlyDead);

        let mut ins = TupleHeader::inserted(Xid(300));
        assert_eq!(o.satisfies_vacuum(&mut ins, h)?, TupleVisibility::InsertInProgress);

        let mut del = TupleHeader::deleted(Xid(10), Xid(300));
        assert_eq!(o.satisfies_vacuum(&mut del, h)?, TupleVisibility::DeleteInProgress);

        let mut aborted = TupleHeader::inserted(Xid(400));
        assert_eq!(o.satisfies_vacuum(&mut aborted, h)?, TupleVisibility::Dead);

        let mut undeleted = TupleHeader::deleted(Xid(10), Xid(400));
        assert_eq!(o.satisfies_vacuum(&mut undeleted, h)?, TupleVisibility::Live);
        assert!(undeleted.xmax_unset());
        Ok(())
    }

    #[test]
    fn unknown_transaction_is_an_error() {
        let o = CommitLogOracle::new();
        let mut t = TupleHeader::inserted(Xid(77));
        assert!(o.satisfies_vacuum(&mut t, Xid(100)).is_err());
        let mut frozen = TupleHeader::inserted(Xid::FROZEN);
        assert!(o.satisfies_vacuum(&mut frozen, Xid(100)).is_ok());
    }
}
