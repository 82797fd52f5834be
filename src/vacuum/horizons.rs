//! vacuum/horizons - горизонты прогона: oldest xmin, freeze limit, multixact cutoff,
//! и решение об агрессивном (полном по незамороженным страницам) проходе.
//!
//! Вычисляются один раз на прогон; дальше только читаются всеми воркерами.

use log::warn;

use crate::catalog::RelationMeta;
use crate::consts::{FREEZE_MAX_AGE, MULTIXACT_FREEZE_MAX_AGE};
use crate::types::{MultiXactId, Xid};
use crate::visibility::FreezeCutoffs;

use super::VacuumOptions;

/// Входные данные для горизонтов: состояние счётчиков транзакций и возрасты заморозки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HorizonsPolicy {
    pub oldest_xmin: Xid,
    pub next_xid: Xid,
    pub oldest_multi: MultiXactId,
    pub next_multi: MultiXactId,
    pub freeze_min_age: u32,
    pub freeze_table_age: u32,
    pub multixact_freeze_min_age: u32,
    pub multixact_freeze_table_age: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunHorizons {
    pub oldest_xmin: Xid,
    pub freeze_limit: Xid,
    pub multixact_cutoff: MultiXactId,
    pub xid_full_scan_limit: Xid,
    pub mxact_full_scan_limit: MultiXactId,
    pub aggressive: bool,
}

impl RunHorizons {
    pub fn cutoffs(&self) -> FreezeCutoffs {
        FreezeCutoffs {
            freeze_limit: self.freeze_limit,
            multixact_cutoff: self.multixact_cutoff,
        }
    }
}

fn table_age_clamp(age: u32, max_age: u32) -> u32 {
    let cap = (max_age as f64 * 0.95) as u32;
    age.min(cap)
}

impl HorizonsPolicy {
    pub fn compute(&self, meta: &RelationMeta, opts: &VacuumOptions) -> RunHorizons {
        // freeze limit
        let freeze_min = self.freeze_min_age.min(FREEZE_MAX_AGE / 2);
        let mut freeze_limit = self.oldest_xmin.retreat(freeze_min);
        let safe_limit = self.next_xid.retreat(FREEZE_MAX_AGE);
        if freeze_limit.precedes(safe_limit) {
            warn!(
                "oldest xmin {} is far in the past (next xid {}): close open transactions soon to avoid wraparound problems",
                self.oldest_xmin, self.next_xid
            );
            freeze_limit = self.oldest_xmin;
        }

        // multixact cutoff
        let mxid_min = self.multixact_freeze_min_age.min(MULTIXACT_FREEZE_MAX_AGE / 2);
        let mut multixact_cutoff = self.oldest_multi.retreat(mxid_min);
        let safe_mxact = self.next_multi.retreat(MULTIXACT_FREEZE_MAX_AGE);
        if multixact_cutoff.precedes(safe_mxact) {
            warn!(
                "oldest multixact {} is far in the past (next {}): close open transactions with multixacts soon",
                self.oldest_multi, self.next_multi
            );
            multixact_cutoff = safe_mxact;
        }

        let xid_full_scan_limit = self
            .next_xid
            .retreat(table_age_clamp(self.freeze_table_age, FREEZE_MAX_AGE));
        let mxact_full_scan_limit = self.next_multi.retreat(table_age_clamp(
            self.multixact_freeze_table_age,
            MULTIXACT_FREEZE_MAX_AGE,
        ));

        let aggressive = meta.relfrozenxid.precedes_or_equals(xid_full_scan_limit)
            || meta.relminmxid.precedes_or_equals(mxact_full_scan_limit)
            || opts.aggressive
            || opts.disable_page_skipping;

        RunHorizons {
            oldest_xmin: self.oldest_xmin,
            freeze_limit,
            multixact_cutoff,
            xid_full_scan_limit,
            mxact_full_scan_limit,
            aggressive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(oldest: u32, next: u32) -> HorizonsPolicy {
        HorizonsPolicy {
            oldest_xmin: Xid(oldest),
            next_xid: Xid(next),
            oldest_multi: MultiXactId(10),
            next_multi: MultiXactId(20),
            freeze_min_age: 1000,
            freeze_table_age: 5000,
            multixact_freeze_min_age: 5,
            multixact_freeze_table_age: 150_000_000,
        }
    }

    #[test]
    fn limits_follow_ages() {
        let mut meta = RelationMeta::new("t");
        meta.relfrozenxid = Xid(8000);
        let h = policy(9000, 10_000).compute(&meta, &VacuumOptions::default());
        assert_eq!(h.freeze_limit, Xid(8000));
        assert_eq!(h.xid_full_scan_limit, Xid(5000));
        assert_eq!(h.multixact_cutoff, MultiXactId(5));
        assert!(!h.aggressive);
    }

    #[test]
    fn old_relfrozenxid_makes_run_aggressive() {
        let mut meta = RelationMeta::new("t");
        meta.relfrozenxid = Xid(4000);
        let h = policy(9000, 10_000).compute(&meta, &VacuumOptions::default());
        assert!(h.aggressive);
    }

    #[test]
    fn disable_page_skipping_forces_aggressive() {
        let mut meta = RelationMeta::new("t");
        meta.relfrozenxid = Xid(9999);
        let opts = VacuumOptions {
            disable_page_skipping: true,
            ..VacuumOptions::default()
        };
        assert!(policy(9000, 10_000).compute(&meta, &opts).aggressive);
    }

    #[test]
    fn ancient_oldest_xmin_falls_back_to_itself() {
        let meta = RelationMeta::new("t");
        // next - oldest > FREEZE_MAX_AGE
        let h = policy(100_000, 100_000 + FREEZE_MAX_AGE + 10_000).compute(&meta, &VacuumOptions::default());
        assert_eq!(h.freeze_limit, Xid(100_000));
    }

    #[test]
    fn small_xids_wrap_around_the_circle() {
        let meta = RelationMeta::new("t");
        let h = policy(50, 60).compute(&meta, &VacuumOptions::default());
        // вычитание по модулю 2^32: лимиты лежат "до" oldest xmin на круге
        assert_eq!(h.freeze_limit, Xid(50u32.wrapping_sub(1000)));
        assert_eq!(h.xid_full_scan_limit, Xid(60u32.wrapping_sub(5000)));
        assert!(h.freeze_limit.precedes(h.oldest_xmin));
        assert!(h.xid_full_scan_limit.precedes(h.freeze_limit));
        // relfrozenxid = FIRST_NORMAL моложе лимита полного прохода
        assert!(!h.aggressive);
    }
}
