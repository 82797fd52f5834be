use anyhow::Result;
use std::sync::{Arc, Mutex};

use quiver_vacuum::parallel::{WorkerPhase, WorkerState};
use quiver_vacuum::sim::TableFixture;
use quiver_vacuum::store::{VisibilityMap, VmBits};

#[test]
fn workers_share_the_heap_and_indexes() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(40)
        .live_per_page(6)
        .dead_per_page(2)
        .indexes(2)
        .workers(3)
        .build()?;

    let s = fx.run()?;

    assert_eq!(s.workers, 3);
    assert_eq!(s.scanned_pages, 40);
    assert_eq!(s.tuples_deleted, 80.0);
    assert_eq!(s.vacuumed_pages, 40);
    assert_eq!(s.num_index_scans, 1);
    assert_eq!(fx.live_rows()?, 240);
    for idx in &fx.indexes {
        assert_eq!(idx.len(), 240);
        assert_eq!(idx.cleanup_calls(), 1);
    }
    assert_eq!(fx.dangling_index_refs()?, 0);
    assert!(fx.vm_violations()?.is_empty());
    for p in 0..40 {
        assert!(fx.vm.status(p).contains(VmBits::ALL_VISIBLE));
    }
    assert_eq!(fx.meta().reltuples, 240.0);
    Ok(())
}

#[test]
fn many_rounds_under_small_memory() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(40)
        .live_per_page(4)
        .dead_per_page(30)
        .indexes(3)
        .workers(4)
        .work_mem_kb(1)
        .build()?;

    let s = fx.run()?;

    assert_eq!(s.tuples_deleted, 1200.0);
    assert!(s.num_index_scans > 1);
    assert_eq!(fx.live_rows()?, 160);
    for idx in &fx.indexes {
        assert_eq!(idx.len(), 160);
        // каждый раунд чистит каждый индекс ровно один раз
        assert_eq!(idx.removed_per_call().iter().sum::<u64>(), 1200);
    }
    assert_eq!(fx.dangling_index_refs()?, 0);
    assert!(fx.vm_violations()?.is_empty());
    Ok(())
}

#[test]
fn index_pass_waits_until_peer_stops_scanning() -> Result<()> {
    for iter in 0..5 {
        let fx = TableFixture::builder("t")
            .pages(60)
            .live_per_page(2)
            .dead_per_page(30)
            .indexes(1)
            .workers(2)
            .work_mem_kb(1)
            .build()?;

        // состояния всех воркеров в момент каждого bulk_delete
        let seen: Arc<Mutex<Vec<Vec<WorkerState>>>> = Arc::new(Mutex::new(Vec::new()));
        let progress = fx.progress.clone();
        let sink = seen.clone();
        fx.indexes[0].set_hook(move |_| {
            sink.lock().unwrap().push(progress.worker_states());
        });

        let s = fx.run()?;
        assert_eq!(s.tuples_deleted, 1800.0, "iter {}", iter);
        assert!(s.num_index_scans > 1);

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        for states in seen.iter() {
            assert_eq!(states.len(), 2);
            let round = states
                .iter()
                .filter(|w| !w.is_complete())
                .map(|w| w.round)
                .max()
                .unwrap_or(0);
            for w in states {
                let ok = w.is_complete()
                    || (w.round == round
                        && matches!(
                            w.phase,
                            WorkerPhase::ReclaimPrepared | WorkerPhase::Reclaiming
                        ));
                assert!(ok, "iter {}: index pass ran while {:?}", iter, states);
            }
        }
        assert_eq!(fx.indexes[0].len(), 120);
        assert_eq!(fx.dangling_index_refs()?, 0);
    }
    Ok(())
}

#[test]
fn parallel_and_serial_runs_agree() -> Result<()> {
    for seed in [1u64, 7, 42] {
        let serial = TableFixture::builder("s")
            .pages(30)
            .live_per_page(12)
            .indexes(2)
            .churn(seed, 0.3)
            .build()?;
        let parallel = TableFixture::builder("p")
            .pages(30)
            .live_per_page(12)
            .indexes(2)
            .churn(seed, 0.3)
            .workers(3)
            .work_mem_kb(2)
            .build()?;

        let a = serial.run()?;
        let b = parallel.run()?;

        assert_eq!(a.tuples_deleted, b.tuples_deleted, "seed {}", seed);
        assert_eq!(a.scanned_tuples, b.scanned_tuples, "seed {}", seed);
        assert_eq!(a.nonempty_pages, b.nonempty_pages, "seed {}", seed);
        assert_eq!(serial.live_rows()?, parallel.live_rows()?);
        for (x, y) in serial.indexes.iter().zip(&parallel.indexes) {
            assert_eq!(x.len(), y.len(), "seed {}", seed);
        }
        assert_eq!(parallel.dangling_index_refs()?, 0);
        assert_eq!(serial.meta().relpages, parallel.meta().relpages);
    }
    Ok(())
}

#[test]
fn more_workers_than_pages() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(2)
        .dead_per_page(1)
        .indexes(1)
        .workers(6)
        .build()?;

    let s = fx.run()?;

    assert_eq!(s.scanned_pages, 2);
    assert_eq!(s.tuples_deleted, 2.0);
    assert_eq!(fx.indexes[0].cleanup_calls(), 1);
    assert_eq!(fx.dangling_index_refs()?, 0);
    Ok(())
}

#[test]
fn cancel_during_index_pass_fails_every_worker() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(40)
        .live_per_page(4)
        .dead_per_page(30)
        .indexes(1)
        .workers(3)
        .work_mem_kb(1)
        .build()?;
    let tok = fx.cancel.clone();
    fx.indexes[0].set_hook(move |_| tok.cancel());

    let err = fx.run().unwrap_err();
    assert!(format!("{:#}", err).contains("cancel"));
    assert!(fx.catalog.reports().is_empty());
    assert_eq!(fx.dangling_index_refs()?, 0);
    Ok(())
}

#[test]
fn panicking_index_aborts_the_run() -> Result<()> {
    let fx = TableFixture::builder("t")
        .pages(12)
        .dead_per_page(1)
        .indexes(2)
        .workers(3)
        .build()?;
    fx.indexes[1].set_hook(|_| panic!("index blew up"));

    let err = fx.run().unwrap_err();
    assert!(format!("{:#}", err).contains("panicked"));
    assert!(fx.catalog.reports().is_empty());
    // удалить слоты без чистки второго индекса нельзя
    assert_eq!(fx.dangling_index_refs()?, 0);
    Ok(())
}
