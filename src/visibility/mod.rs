//! visibility - классификация версий строк и решения о заморозке.
//!
//! - VisibilityOracle   - satisfies_vacuum (dead / live / recently dead / in progress)
//!   и freeze-примитивы (prepare_freeze, needs_freeze, needs_eventual_freeze).
//! - clog.rs            - CommitLogOracle: статусы транзакций в памяти.
//! - prune.rs           - PagePruner: удаление мёртвых кортежей до классификации.
//!
//! Freeze-примитивы имеют реализации по умолчанию: они зависят только от заголовка
//! кортежа и отсечек, а не от статуса транзакций.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::page::item::{TupleHeader, XMAX_COMMITTED, XMAX_INVALID, XMAX_IS_MULTI, XMIN_FROZEN};
use crate::types::{MultiXactId, OffsetNo, Xid};

pub mod clog;
pub mod prune;

pub use clog::{CommitLogOracle, XidStatus};
pub use prune::{DeadItemPruner, NoopPruner, PagePruner, PruneResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TupleVisibility {
    /// Удалён транзакцией старше горизонта - можно убирать.
    Dead,
    Live,
    /// Удалён, но кто-то ещё может его видеть.
    RecentlyDead,
    InsertInProgress,
    DeleteInProgress,
}

/// Отсечки заморозки одного прогона.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeCutoffs {
    pub freeze_limit: Xid,
    pub multixact_cutoff: MultiXactId,
}

/// Что сделать с одним кортежем при заморозке. Пишется в FREEZE запись WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezePlan {
    pub offset: OffsetNo,
    pub freeze_xmin: bool,
    pub clear_xmax: bool,
}

impl FreezePlan {
    pub fn execute(&self, h: &mut TupleHeader) {
        if self.freeze_xmin {
            h.set(XMIN_FROZEN);
        }
        if self.clear_xmax {
            h.xmax = 0;
            h.clear(XMAX_IS_MULTI | XMAX_COMMITTED);
            h.set(XMAX_INVALID);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeDecision {
    pub plan: Option<FreezePlan>,
    /// После применения плана кортежу больше никогда не понадобится заморозка.
    pub totally_frozen: bool,
}

pub trait VisibilityOracle: Send + Sync {
    /// Классифицировать кортеж относительно горизонта oldest_xmin.
    /// Может выставить hint-биты в заголовке. Err - неизвестный статус транзакции
    /// (фатально для прогона).
    fn satisfies_vacuum(&self, tuple: &mut TupleHeader, oldest_xmin: Xid) -> Result<TupleVisibility>;

    fn prepare_freeze(
        &self,
        offset: OffsetNo,
        tuple: &TupleHeader,
        cutoffs: &FreezeCutoffs,
    ) -> FreezeDecision {
        let mut plan = FreezePlan {
            offset,
            freeze_xmin: false,
            clear_xmax: false,
        };
        let mut totally_frozen = true;

        if !tuple.xmin_frozen() && tuple.xmin.is_normal() {
            if tuple.xmin.precedes(cutoffs.freeze_limit) {
                plan.freeze_xmin = true;
            } else {
                totally_frozen = false;
            }
        }

        if tuple.xmax_is_multi() {
            let m = tuple.xmax_multi();
            if m.is_valid() && m.precedes(cutoffs.multixact_cutoff) {
                plan.clear_xmax = true;
            } else if m.is_valid() {
                totally_frozen = false;
            }
        } else if !tuple.xmax_unset() {
            let x = tuple.xmax_xid();
            // закоммиченный удаляющий не стирается никогда: иначе строка оживёт
            if tuple.has(XMAX_COMMITTED) {
                totally_frozen = false;
            } else if x.is_normal() && x.precedes(cutoffs.freeze_limit) {
                plan.clear_xmax = true;
            } else if x.is_normal() {
                totally_frozen = false;
            }
        }

        let plan = (plan.freeze_xmin || plan.clear_xmax).then_some(plan);
        FreezeDecision {
            plan,
            totally_frozen,
        }
    }

    /// Нужна ли заморозка прямо сейчас (путь без cleanup lock).
    fn needs_freeze(&self, tuple: &TupleHeader, cutoffs: &FreezeCutoffs) -> bool {
        if !tuple.xmin_frozen() && tuple.xmin.is_normal() && tuple.xmin.precedes(cutoffs.freeze_limit)
        {
            return true;
        }
        if tuple.xmax_is_multi() {
            let m = tuple.xmax_multi();
            return m.is_valid() && m.precedes(cutoffs.multixact_cutoff);
        }
        if tuple.xmax_unset() {
            return false;
        }
        let x = tuple.xmax_xid();
        x.is_normal() && x.precedes(cutoffs.freeze_limit)
    }

    /// Понадобится ли кортежу заморозка когда-нибудь (для ALL_FROZEN).
    fn needs_eventual_freeze(&self, tuple: &TupleHeader) -> bool {
        if !tuple.xmin_frozen() && tuple.xmin.is_normal() {
            return true;
        }
        !tuple.xmax_unset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cutoffs(x: u32, m: u32) -> FreezeCutoffs {
        FreezeCutoffs {
            freeze_limit: Xid(x),
            multixact_cutoff: MultiXactId(m),
        }
    }

    #[test]
    fn old_xmin_is_frozen_young_is_not() {
        let o = CommitLogOracle::new();
        let old = TupleHeader::inserted(Xid(10));
        let d = o.prepare_freeze(1, &old, &cutoffs(100, 1));
        assert_eq!(
            d.plan,
            Some(FreezePlan {
                offset: 1,
                freeze_xmin: true,
                clear_xmax: false
            })
        );
        assert!(d.totally_frozen);

        let young = TupleHeader::inserted(Xid(500));
        let d = o.prepare_freeze(2, &young, &cutoffs(100, 1));
        assert!(d.plan.is_none());
        assert!(!d.totally_frozen);
    }

    #[test]
    fn executed_plan_leaves_nothing_to_freeze() {
        let o = CommitLogOracle::new();
        let mut h = TupleHeader::deleted(Xid(10), Xid(20));
        let c = cutoffs(100, 1);
        assert!(o.needs_freeze(&h, &c));
        let d = o.prepare_freeze(3, &h, &c);
        d.plan.expect("plan").execute(&mut h);
        assert!(h.xmin_frozen());
        assert!(h.xmax_unset());
        assert!(!o.needs_freeze(&h, &c));
        assert!(!o.needs_eventual_freeze(&h));
    }

    #[test]
    fn committed_deleter_is_never_cleared() {
        let o = CommitLogOracle::new();
        let mut h = TupleHeader::deleted(Xid(10), Xid(20));
        h.set(XMIN_FROZEN | XMAX_COMMITTED);
        let d = o.prepare_freeze(1, &h, &cutoffs(100, 1));
        assert!(d.plan.is_none());
        assert!(!d.totally_frozen);
    }

    #[test]
    fn multi_xmax_uses_multixact_cutoff() {
        let o = CommitLogOracle::new();
        let mut h = TupleHeader::inserted(Xid::FROZEN);
        h.clear(XMAX_INVALID);
        h.set(XMAX_IS_MULTI);
        h.xmax = 50;
        assert!(!o.needs_freeze(&h, &cutoffs(100, 10)));
        assert!(o.needs_freeze(&h, &cutoffs(100, 60)));
        let d = o.prepare_freeze(1, &h, &cutoffs(100, 10));
        assert!(d.plan.is_none());
        assert!(!d.totally_frozen);
    }
}
