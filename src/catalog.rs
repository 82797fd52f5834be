//! catalog - метаданные отношения и приёмник обновлений статистики.
//!
//! Движок не владеет каталогом: он читает RelationMeta на старте прогона и
//! отдаёт итоговые значения через трейт Catalog. Обновления по индексам
//! применяются один раз координатором (не воркерами).

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{MultiXactId, Xid};

/// Снимок каталожных полей отношения на момент старта прогона.
#[derive(Debug, Clone, Serialize)]
pub struct RelationMeta {
    pub name: String,
    pub relpages: u32,
    pub reltuples: f64,
    pub relallvisible: u32,
    pub relfrozenxid: Xid,
    pub relminmxid: MultiXactId,
}

impl RelationMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relpages: 0,
            reltuples: 0.0,
            relallvisible: 0,
            relfrozenxid: Xid::FIRST_NORMAL,
            relminmxid: MultiXactId::FIRST,
        }
    }
}

/// Итоговое обновление статистики отношения.
#[derive(Debug, Clone, Serialize)]
pub struct RelationStatsUpdate {
    pub relpages: u32,
    pub reltuples: f64,
    pub relallvisible: u32,
    pub has_indexes: bool,
    /// INVALID - не менять relfrozenxid.
    pub frozen_xid: Xid,
    /// INVALID - не менять relminmxid.
    pub min_multi: MultiXactId,
}

pub trait Catalog: Send + Sync {
    fn update_relation(&self, rel: &str, upd: &RelationStatsUpdate) -> Result<()>;
    fn update_index(&self, index: &str, pages: u32, tuples: f64) -> Result<()>;
    /// Отчёт в сборщик статистики (live/dead кортежи после прогона).
    fn report_vacuum(&self, rel: &str, live_tuples: f64, dead_tuples: f64) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexMeta {
    pub pages: u32,
    pub tuples: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VacuumReport {
    pub rel: String,
    pub live_tuples: f64,
    pub dead_tuples: f64,
}

/// In-memory каталог (тесты, CLI).
#[derive(Debug, Default)]
pub struct MemCatalog {
    relations: Mutex<HashMap<String, RelationMeta>>,
    indexes: Mutex<HashMap<String, IndexMeta>>,
    reports: Mutex<Vec<VacuumReport>>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, meta: RelationMeta) {
        if let Ok(mut g) = self.relations.lock() {
            g.insert(meta.name.clone(), meta);
        }
    }

    pub fn relation(&self, name: &str) -> Option<RelationMeta> {
        self.relations.lock().ok()?.get(name).cloned()
    }

    pub fn index(&self, name: &str) -> Option<IndexMeta> {
        self.indexes.lock().ok()?.get(name).cloned()
    }

    pub fn reports(&self) -> Vec<VacuumReport> {
        self.reports.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl Catalog for MemCatalog {
    fn update_relation(&self, rel: &str, upd: &RelationStatsUpdate) -> Result<()> {
        let mut g = self
            .relations
            .lock()
            .map_err(|_| anyhow!("catalog poisoned"))?;
        let meta = g
            .get_mut(rel)
            .ok_or_else(|| anyhow!("relation \"{}\" is not registered", rel))?;
        meta.relpages = upd.relpages;
        meta.reltuples = upd.reltuples;
        meta.relallvisible = upd.relallvisible;
        // relfrozenxid/relminmxid только двигаются вперёд
        if upd.frozen_xid.is_normal() && meta.relfrozenxid.precedes(upd.frozen_xid) {
            meta.relfrozenxid = upd.frozen_xid;
        }
        if upd.min_multi.is_valid() && meta.relminmxid.precedes(upd.min_multi) {
            meta.relminmxid = upd.min_multi;
        }
        Ok(())
    }

    fn update_index(&self, index: &str, pages: u32, tuples: f64) -> Result<()> {
        let mut g = self
            .indexes
            .lock()
            .map_err(|_| anyhow!("catalog poisoned"))?;
        g.insert(index.to_string(), IndexMeta { pages, tuples });
        Ok(())
    }

    fn report_vacuum(&self, rel: &str, live_tuples: f64, dead_tuples: f64) -> Result<()> {
        let mut g = self
            .reports
            .lock()
            .map_err(|_| anyhow!("catalog poisoned"))?;
        g.push(VacuumReport {
            rel: rel.to_string(),
            live_tuples,
            dead_tuples,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_xid_never_moves_backwards() -> Result<()> {
        let cat = MemCatalog::new();
        let mut meta = RelationMeta::new("t");
        meta.relfrozenxid = Xid(500);
        cat.register(meta);

        let mut upd = RelationStatsUpdate {
            relpages: 4,
            reltuples: 10.0,
            relallvisible: 2,
            has_indexes: false,
            frozen_xid: Xid(400),
            min_multi: MultiXactId::INVALID,
        };
        cat.update_relation("t", &upd)?;
        assert_eq!(cat.relation("t").unwrap().relfrozenxid, Xid(500));

        upd.frozen_xid = Xid(600);
        cat.update_relation("t", &upd)?;
        let m = cat.relation("t").unwrap();
        assert_eq!(m.relfrozenxid, Xid(600));
        assert_eq!(m.relpages, 4);
        assert_eq!(m.relminmxid, MultiXactId::FIRST);
        Ok(())
    }

    #[test]
    fn unknown_relation_is_an_error() {
        let cat = MemCatalog::new();
        let upd = RelationStatsUpdate {
            relpages: 0,
            reltuples: 0.0,
            relallvisible: 0,
            has_indexes: false,
            frozen_xid: Xid::INVALID,
            min_multi: MultiXactId::INVALID,
        };
        assert!(cat.update_relation("missing", &upd).is_err());
    }
}
