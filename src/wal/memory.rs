//! wal/memory - WAL в памяти (тесты, симуляции без каталога) и пустой sink.

use anyhow::{anyhow, Result};
use std::sync::{Mutex, PoisonError};

use super::{WalRecord, WalSink, WAL_REC_HDR_SIZE};
use crate::metrics::record_wal_append;

#[derive(Debug, Default)]
pub struct MemWal {
    records: Mutex<Vec<(u64, WalRecord)>>,
}

impl MemWal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(u64, WalRecord)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count_where(&self, pred: impl Fn(&WalRecord) -> bool) -> usize {
        self.records().iter().filter(|(_, r)| pred(r)).count()
    }
}

impl WalSink for MemWal {
    fn append(&self, rec: &WalRecord) -> Result<u64> {
        let mut g = self.records.lock().map_err(|_| anyhow!("MemWal poisoned"))?;
        let lsn = g.len() as u64 + 1;
        g.push((lsn, rec.clone()));
        record_wal_append(WAL_REC_HDR_SIZE + rec.encode_payload().len());
        Ok(lsn)
    }
}

/// Ничего не пишет; LSN всегда 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWal;

impl WalSink for NullWal {
    fn append(&self, _: &WalRecord) -> Result<u64> {
        Ok(0)
    }
}
