use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use quiver_vacuum::sim::{TableFixture, DELETER_XID};
use quiver_vacuum::wal::{wal_path, VacuumWal, WalFileReader, WalRecord, WalSink};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("qvtest-wal-{prefix}-{pid}-{t}-{id}"))
}

fn read_all(dir: &Path) -> Result<Vec<(u64, WalRecord)>> {
    let mut r = WalFileReader::open(&wal_path(dir))?;
    let mut out = Vec::new();
    while let Some(rec) = r.next_record()? {
        out.push(rec);
    }
    Ok(out)
}

#[test]
fn cleanup_info_precedes_heap_cleaning() -> Result<()> {
    let root = unique_root("order");
    let fx = TableFixture::builder("t").pages(6).indexes(1).build()?;
    let d1 = fx.delete(1, 2)?;
    fx.delete(4, 1)?;

    {
        let wal = VacuumWal::open(&root)?;
        let s = fx.run_with_wal(&wal)?;
        assert_eq!(s.tuples_deleted, 3.0);
        assert_eq!(s.latest_removed_xid, DELETER_XID);
    }

    let recs = read_all(&root)?;
    let lsns: Vec<u64> = recs.iter().map(|(l, _)| *l).collect();
    assert!(lsns.windows(2).all(|w| w[1] == w[0] + 1), "lsns {:?}", lsns);

    let info_pos = recs
        .iter()
        .position(|(_, r)| matches!(r, WalRecord::CleanupInfo { .. }))
        .expect("cleanup info logged");
    assert_eq!(
        recs[info_pos].1,
        WalRecord::CleanupInfo {
            latest_removed_xid: DELETER_XID
        }
    );

    let cleans: Vec<(usize, &WalRecord)> = recs
        .iter()
        .enumerate()
        .filter(|(_, (_, r))| matches!(r, WalRecord::Clean { .. }))
        .map(|(i, (_, r))| (i, r))
        .collect();
    assert_eq!(cleans.len(), 2);
    for (i, r) in &cleans {
        assert!(*i > info_pos);
        if let WalRecord::Clean {
            page,
            unused,
            latest_removed_xid,
            ..
        } = r
        {
            assert_eq!(*latest_removed_xid, DELETER_XID);
            if *page == 1 {
                let offs: Vec<u16> = d1.iter().map(|t| t.offset).collect();
                assert_eq!(unused, &offs);
            } else {
                assert_eq!(*page, 4);
                assert_eq!(unused.len(), 1);
            }
        }
    }

    // страницы стали all-visible после освобождения слотов
    assert!(recs
        .iter()
        .any(|(_, r)| matches!(r, WalRecord::Visible { page: 1, .. })));
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn empty_page_is_logged_as_new_page() -> Result<()> {
    let root = unique_root("newpage");
    let fx = TableFixture::builder("t").pages(4).build()?;
    fx.store.with_page_mut(2, |p| p.init())?;

    {
        let wal = VacuumWal::open(&root)?;
        let s = fx.run_with_wal(&wal)?;
        assert_eq!(s.empty_pages, 1);
    }

    let recs = read_all(&root)?;
    let images: Vec<&Vec<u8>> = recs
        .iter()
        .filter_map(|(_, r)| match r {
            WalRecord::NewPage { page: 2, image } => Some(image),
            _ => None,
        })
        .collect();
    assert_eq!(images.len(), 1);
    assert!(!images[0].is_empty());
    assert!(fx.page(2)?.lsn > 0);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn unlogged_relation_writes_nothing() -> Result<()> {
    let root = unique_root("unlogged");
    let fx = TableFixture::builder("t")
        .pages(4)
        .dead_per_page(2)
        .indexes(1)
        .without_wal()
        .build()?;

    {
        let wal = VacuumWal::open(&root)?;
        let s = fx.run_with_wal(&wal)?;
        assert_eq!(s.tuples_deleted, 8.0);
        assert_eq!(wal.last_lsn()?, 0);
    }

    assert!(read_all(&root)?.is_empty());
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn reopened_wal_continues_lsn_sequence() -> Result<()> {
    let root = unique_root("reopen");

    let first_last = {
        let fx = TableFixture::builder("a").pages(3).dead_per_page(1).build()?;
        let wal = VacuumWal::open(&root)?;
        fx.run_with_wal(&wal)?;
        wal.last_lsn()?
    };
    assert!(first_last > 0);

    let stream = {
        let fx = TableFixture::builder("b").pages(3).dead_per_page(1).build()?;
        let wal = VacuumWal::open(&root)?;
        assert_eq!(wal.last_lsn()?, first_last);
        fx.run_with_wal(&wal)?;
        assert!(wal.last_lsn()? > first_last);
        wal.stream_id()
    };

    let recs = read_all(&root)?;
    assert_eq!(recs[0].0, 1);
    assert!(recs.windows(2).all(|w| w[1].0 == w[0].0 + 1));
    assert_eq!(WalFileReader::open(&wal_path(&root))?.stream_id(), stream);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn second_writer_is_locked_out() -> Result<()> {
    let root = unique_root("lock");
    let wal = VacuumWal::open(&root)?;
    assert!(VacuumWal::open(&root).is_err());
    wal.flush()?;
    drop(wal);
    let _again = VacuumWal::open(&root)?;
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
