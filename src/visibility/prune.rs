//! visibility/prune - предварительная чистка страницы перед классификацией.
//!
//! DeadItemPruner превращает мёртвые кортежи вне HOT-цепочек в Dead line pointers
//! (хранилище освобождается сразу, указатель ждёт удаления индексных ссылок).
//! Кортежи HOT-цепочек не трогаются: их судьба решается при классификации.

use anyhow::Result;

use super::{TupleVisibility, VisibilityOracle};
use crate::page::{HeapPage, ItemId};
use crate::page::item::TupleHeader;
use crate::types::{OffsetNo, Xid};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneResult {
    pub removed: u64,
    pub latest_removed_xid: Xid,
    pub redirected: Vec<(OffsetNo, OffsetNo)>,
    pub now_dead: Vec<OffsetNo>,
    pub now_unused: Vec<OffsetNo>,
}

impl PruneResult {
    pub fn changed(&self) -> bool {
        !(self.redirected.is_empty() && self.now_dead.is_empty() && self.now_unused.is_empty())
    }
}

pub trait PagePruner: Send + Sync {
    fn prune(
        &self,
        page: &mut HeapPage,
        oldest_xmin: Xid,
        oracle: &dyn VisibilityOracle,
    ) -> Result<PruneResult>;
}

/// Ничего не делает: все мёртвые кортежи обрабатывает сам vacuum.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPruner;

impl PagePruner for NoopPruner {
    fn prune(&self, _: &mut HeapPage, _: Xid, _: &dyn VisibilityOracle) -> Result<PruneResult> {
        Ok(PruneResult::default())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeadItemPruner;

impl PagePruner for DeadItemPruner {
    fn prune(
        &self,
        page: &mut HeapPage,
        oldest_xmin: Xid,
        oracle: &dyn VisibilityOracle,
    ) -> Result<PruneResult> {
        let mut res = PruneResult::default();
        for i in 0..page.items.len() {
            let off = (i + 1) as OffsetNo;
            let gone = match &mut page.items[i] {
                ItemId::Normal(t) => {
                    if t.header.is_hot_updated() || t.header.is_heap_only() {
                        false
                    } else if oracle.satisfies_vacuum(&mut t.header, oldest_xmin)?
                        == TupleVisibility::Dead
                    {
                        advance_latest_removed_xid(&t.header, &mut res.latest_removed_xid);
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if gone {
                page.items[i] = ItemId::Dead;
                res.now_dead.push(off);
                res.removed += 1;
            }
        }
        Ok(res)
    }
}

/// Продвинуть latest_removed_xid по удаляемому кортежу: учитывается xmax
/// удалений, чей xmin был зафиксирован (или удаливших свою же вставку).
pub fn advance_latest_removed_xid(t: &TupleHeader, latest: &mut Xid) {
    let xmax = t.xmax_xid();
    if !xmax.is_normal() {
        return;
    }
    let counts = t.xmin_committed() || t.xmin == xmax;
    if counts && (!latest.is_valid() || xmax.follows(*latest)) {
        *latest = xmax;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::item::HOT_UPDATED;
    use crate::page::HeapTuple;
    use crate::visibility::CommitLogOracle;

    #[test]
    fn dead_plain_tuples_become_dead_pointers() -> Result<()> {
        let o = CommitLogOracle::new();
        o.commit(Xid(10));
        o.commit(Xid(20));
        o.commit(Xid(30));
        let mut p = HeapPage::new_empty(0, 8192);
        p.add_tuple(HeapTuple::new(TupleHeader::deleted(Xid(10), Xid(20)), vec![1]))?;
        p.add_tuple(HeapTuple::new(TupleHeader::inserted(Xid(10)), vec![2]))?;
        p.add_tuple(HeapTuple::new(TupleHeader::deleted(Xid(10), Xid(30)), vec![3]))?;
        let mut hot = TupleHeader::deleted(Xid(10), Xid(30));
        hot.set(HOT_UPDATED);
        p.add_tuple(HeapTuple::new(hot, vec![4]))?;

        let r = DeadItemPruner.prune(&mut p, Xid(100), &o)?;
        assert_eq!(r.removed, 2);
        assert_eq!(r.now_dead, vec![1, 3]);
        assert_eq!(r.latest_removed_xid, Xid(30));
        assert!(r.changed());
        assert_eq!(p.item(1), Some(&ItemId::Dead));
        assert!(p.item(4).map(|i| i.is_normal()).unwrap_or(false));
        Ok(())
    }

    #[test]
    fn aborted_insert_does_not_advance_latest_removed() {
        let mut t = TupleHeader::deleted(Xid(50), Xid(60));
        t.set(crate::page::item::XMIN_INVALID);
        let mut latest = Xid::INVALID;
        advance_latest_removed_xid(&t, &mut latest);
        assert_eq!(latest, Xid::INVALID);
    }
}
