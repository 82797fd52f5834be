use anyhow::Result;
use std::thread;
use std::time::Duration;

use quiver_vacuum::index::IndexAm;
use quiver_vacuum::page::item::HOT_UPDATED;
use quiver_vacuum::page::ItemId;
use quiver_vacuum::progress::VacuumPhase;
use quiver_vacuum::sim::{TableFixture, DELETER_XID, OLDEST_XMIN};
use quiver_vacuum::store::{VisibilityMap, VmBits};
use quiver_vacuum::wal::WalRecord;
use quiver_vacuum::Xid;

fn unused_slots(fx: &TableFixture, page: u32) -> Result<usize> {
    Ok(fx
        .page(page)?
        .items
        .iter()
        .filter(|it| matches!(it, ItemId::Unused))
        .count())
}

#[test]
fn skips_visible_prefix_and_reclaims_dead_page() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(10)
        .live_per_page(4)
        .indexes(1)
        .skip_pages_threshold(4)
        .build()?;
    for p in 0..5 {
        fx.mark_all_visible(p, false)?;
    }
    let dead = fx.delete(5, 3)?;

    let s = fx.run()?;

    assert_eq!(s.scanned_pages, 5);
    assert_eq!(s.frozenskipped_pages, 0);
    assert_eq!(s.tuples_deleted, 3.0);
    assert_eq!(s.num_index_scans, 1);
    assert_eq!(s.vacuumed_pages, 1);
    assert_eq!(s.pages_removed, 0);

    let idx = &fx.indexes[0];
    assert_eq!(idx.bulk_delete_calls(), 1);
    assert_eq!(idx.removed_per_call(), vec![3]);
    for tid in &dead {
        assert!(!idx.contains(*tid));
    }
    assert_eq!(unused_slots(&fx, 5)?, 3);
    assert!(fx.store.free_space(5).is_some());

    // префикс не тронут, страница 5 стала all-visible
    for p in 0..5 {
        assert_eq!(fx.vm.status(p), VmBits::ALL_VISIBLE);
    }
    assert!(fx.vm.status(5).contains(VmBits::ALL_VISIBLE));
    assert!(fx.page(5)?.is_all_visible());

    let meta = fx.meta();
    assert_eq!(meta.relpages, 10);
    assert_eq!(meta.relallvisible, 10);
    assert_eq!(s.indexes.len(), 1);
    assert_eq!(s.indexes[0].tuples_removed, 3.0);
    assert_eq!(fx.dangling_index_refs()?, 0);
    Ok(())
}

#[test]
fn second_run_finds_nothing_to_do() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(10)
        .indexes(1)
        .skip_pages_threshold(4)
        .build()?;
    fx.delete(3, 2)?;
    fx.delete(7, 1)?;

    let first = fx.run()?;
    assert_eq!(first.tuples_deleted, 3.0);
    let wal_after_first = fx.wal.records().len();
    let live = fx.live_rows()?;

    let second = fx.run()?;
    assert_eq!(second.tuples_deleted, 0.0);
    assert_eq!(second.num_index_scans, 0);
    // читается только последняя страница (проверка для truncate)
    assert_eq!(second.scanned_pages, 1);
    assert_eq!(fx.indexes[0].bulk_delete_calls(), 1);
    assert_eq!(fx.wal.records().len(), wal_after_first);
    assert_eq!(fx.live_rows()?, live);
    assert_eq!(fx.nblocks(), 10);
    Ok(())
}

#[test]
fn without_indexes_pages_are_cleaned_in_one_pass() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(5)
        .live_per_page(2)
        .dead_per_page(3)
        .build()?;

    let s = fx.run()?;

    assert_eq!(s.tuples_deleted, 15.0);
    assert_eq!(s.vacuumed_pages, 5);
    assert_eq!(s.num_index_scans, 0);
    for p in 0..5 {
        assert_eq!(unused_slots(&fx, p)?, 3);
        assert!(fx.vm.status(p).contains(VmBits::ALL_VISIBLE));
    }
    assert_eq!(
        fx.wal
            .count_where(|r| matches!(r, WalRecord::CleanupInfo { .. })),
        0
    );
    assert_eq!(
        fx.wal.count_where(|r| matches!(r, WalRecord::Clean { .. })),
        5
    );
    assert_eq!(fx.live_rows()?, 10);
    Ok(())
}

#[test]
fn aggressive_run_freezes_and_advances_relfrozenxid() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(6)
        .aggressive(true)
        .freeze_min_age(0)
        .skip_pages_threshold(2)
        .build()?;

    let s = fx.run()?;
    assert!(s.aggressive);
    assert_eq!(s.tuples_frozen, 24);
    assert!(s.scanned_all_unfrozen);
    assert_eq!(s.new_frozen_xid, OLDEST_XMIN);
    for p in 0..6 {
        assert_eq!(fx.vm.status(p), VmBits::VALID);
    }
    assert_eq!(
        fx.wal.count_where(|r| matches!(r, WalRecord::Freeze { .. })),
        6
    );
    assert_eq!(fx.meta().relfrozenxid, OLDEST_XMIN);

    // всё заморожено: второй прогон пропускает страницы, но считает их
    let again = fx.run()?;
    assert_eq!(again.tuples_frozen, 0);
    assert_eq!(again.frozenskipped_pages, 5);
    assert_eq!(again.scanned_pages, 1);
    assert!(again.scanned_all_unfrozen);
    Ok(())
}

#[test]
fn dead_hot_member_keeps_its_deleter_through_freeze() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(1)
        .aggressive(true)
        .freeze_min_age(0)
        .build()?;
    let gone = fx.delete(0, 1)?;
    let off = gone[0].offset;
    fx.store.with_page_mut(0, |pg| {
        if let Some(ItemId::Normal(t)) = pg.item_mut(off) {
            t.header.set(HOT_UPDATED);
        }
    })?;

    let s = fx.run()?;

    assert_eq!(s.tuples_frozen, 3);
    assert_eq!(s.new_dead_tuples, 1.0);
    assert_eq!(fx.live_rows()?, 3);
    let pg = fx.page(0)?;
    match pg.item(off) {
        Some(ItemId::Normal(t)) => {
            assert_eq!(t.header.xmax, DELETER_XID.0);
            assert!(!t.header.xmax_unset());
        }
        other => panic!("slot {} changed: {:?}", off, other),
    }
    assert!(!fx.vm.status(0).contains(VmBits::ALL_FROZEN));
    Ok(())
}

#[test]
fn pinned_page_is_skipped_by_normal_run() -> Result<()> {
    let fx = TableFixture::builder("t").pages(10).indexes(1).build()?;
    let dead = fx.delete(3, 2)?;
    fx.pin(3);

    let s = fx.run()?;
    fx.unpin(3);

    assert_eq!(s.pinskipped_pages, 1);
    assert_eq!(s.scanned_pages, 9);
    assert_eq!(s.tuples_deleted, 0.0);
    assert!(!s.scanned_all_unfrozen);
    assert_eq!(s.new_frozen_xid, Xid::INVALID);
    for tid in dead {
        assert!(fx.indexes[0].contains(tid));
    }
    Ok(())
}

#[test]
fn aggressive_run_waits_for_pin_when_page_needs_freezing() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(4)
        .aggressive(true)
        .freeze_min_age(0)
        .build()?;
    fx.pin(1);

    let s = thread::scope(|sc| {
        sc.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            fx.unpin(1);
        });
        fx.run()
    })?;

    assert_eq!(s.pinskipped_pages, 0);
    assert_eq!(s.tuples_frozen, 16);
    assert_eq!(fx.vm.status(1), VmBits::VALID);
    Ok(())
}

#[test]
fn uninitialized_tail_pages_are_fixed_then_truncated() -> Result<()> {
    let fx = TableFixture::builder("t").pages(4).build()?;
    fx.append_new_pages(2)?;
    assert_eq!(fx.nblocks(), 6);

    let s = fx.run()?;

    assert_eq!(s.empty_pages, 2);
    assert_eq!(s.nonempty_pages, 4);
    assert_eq!(s.pages_removed, 2);
    assert_eq!(fx.nblocks(), 4);
    assert_eq!(fx.meta().relpages, 4);
    Ok(())
}

#[test]
fn visibility_map_mismatches_are_repaired() -> Result<()> {
    let fx = TableFixture::builder("t").pages(6).indexes(1).build()?;
    // VM говорит all-visible, бит на странице не выставлен
    fx.vm.set(2, VmBits::ALL_VISIBLE);
    // бит на странице выставлен, но на ней мёртвые версии
    fx.delete(4, 2)?;
    fx.store.with_page_mut(4, |p| p.set_all_visible())?;

    let s = fx.run()?;

    assert_eq!(s.tuples_deleted, 2.0);
    assert!(fx.vm.status(2).is_empty());
    assert!(fx.vm.status(4).contains(VmBits::ALL_VISIBLE));
    assert!(fx.vm_violations()?.is_empty());
    assert_eq!(fx.dangling_index_refs()?, 0);
    Ok(())
}

#[test]
fn in_progress_and_recently_dead_rows_are_kept() -> Result<()> {
    let fx = TableFixture::builder("t").pages(4).indexes(1).build()?;
    fx.insert_in_progress(1, 2)?;
    fx.delete_recent(2, 2)?;

    let s = fx.run()?;

    assert_eq!(s.tuples_deleted, 0.0);
    assert_eq!(s.new_dead_tuples, 2.0);
    assert!(fx.vm.status(1).is_empty());
    assert!(fx.vm.status(2).is_empty());
    assert!(fx.vm.status(3).contains(VmBits::ALL_VISIBLE));
    assert!(fx.vm_violations()?.is_empty());
    Ok(())
}

#[test]
fn pruned_dead_pointers_are_reclaimed_after_index_pass() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(3)
        .live_per_page(2)
        .dead_per_page(2)
        .indexes(1)
        .prune_dead_items(true)
        .build()?;

    let s = fx.run()?;

    assert_eq!(s.tuples_deleted, 6.0);
    assert_eq!(s.num_index_scans, 1);
    for p in 0..3 {
        assert_eq!(unused_slots(&fx, p)?, 2);
    }
    assert_eq!(fx.indexes[0].len(), 6);
    assert_eq!(fx.dangling_index_refs()?, 0);
    Ok(())
}

#[test]
fn small_memory_budget_forces_a_cycle_per_page() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(20)
        .live_per_page(10)
        .dead_per_page(50)
        .indexes(1)
        .work_mem_kb(1)
        .build()?;

    let s = fx.run()?;

    assert_eq!(s.max_dead_tuples, 291);
    assert_eq!(s.tuples_deleted, 1000.0);
    assert_eq!(s.num_index_scans, 20);
    assert_eq!(s.vacuumed_pages, 20);
    let idx = &fx.indexes[0];
    assert_eq!(idx.bulk_delete_calls(), 20);
    assert!(idx.removed_per_call().iter().all(|&n| n == 50));
    assert_eq!(idx.len(), 200);
    assert_eq!(fx.progress.snapshot().index_vacuum_count, 20);
    Ok(())
}

#[test]
fn cancelled_run_leaves_catalog_untouched() -> Result<()> {
    let fx = TableFixture::builder("t").pages(4).build()?;
    fx.cancel.cancel();
    let err = fx.run().unwrap_err();
    assert!(format!("{:#}", err).contains("canceling"));
    assert_eq!(fx.meta().reltuples, 16.0);
    assert!(fx.catalog.reports().is_empty());
    Ok(())
}

#[test]
fn cancel_after_index_pass_leaves_no_dangling_refs() -> Result<()> {
    let fx = TableFixture::builder("t").pages(4).indexes(1).build()?;
    fx.delete(2, 2)?;
    let tok = fx.cancel.clone();
    fx.indexes[0].set_hook(move |_| tok.cancel());

    assert!(fx.run().is_err());
    // ссылки удалены, слоты ещё заняты мёртвыми версиями
    assert_eq!(fx.indexes[0].len(), 14);
    assert_eq!(fx.dangling_index_refs()?, 0);
    assert_eq!(unused_slots(&fx, 2)?, 0);
    Ok(())
}

#[test]
fn progress_and_report_reach_the_end() -> Result<()> {
    let fx = TableFixture::builder("t").pages(8).indexes(2).build()?;
    fx.delete(6, 1)?;

    let s = fx.run()?;

    let p = fx.progress.snapshot();
    assert_eq!(p.phase, VacuumPhase::FinalCleanup);
    assert_eq!(p.heap_blks_total, 8);
    assert_eq!(p.heap_blks_scanned, 8);
    assert_eq!(p.num_dead_tuples, 0);

    let reports = fx.catalog.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].live_tuples, s.new_live_tuples);
    for idx in &fx.indexes {
        let m = fx.catalog.index(idx.name()).expect("index stats applied");
        assert_eq!(m.tuples, 31.0);
    }
    Ok(())
}
