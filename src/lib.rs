// Базовые модули
pub mod consts;
pub mod types;
pub mod config;
pub mod metrics;
pub mod progress;
pub mod interrupt;
pub mod lock;
pub mod catalog;

// Страницы и хранилище (внешние коллабораторы движка)
pub mod page;       // src/page/{mod,item,heap,codec}.rs
pub mod store;      // src/store/{mod,mem}.rs
pub mod visibility; // src/visibility/{mod,clog,prune}.rs
pub mod wal;        // src/wal/{mod,frame,record,writer,reader,memory}.rs
pub mod index;      // src/index/{mod,mem}.rs

// Движок vacuum
pub mod vacuum;     // src/vacuum/{mod,context,horizons,stats,dead_tuples,scan,page_proc,reclaim,indexes,truncate,worker}.rs
pub mod parallel;   // src/parallel/{mod,barrier,shared}.rs

// In-memory таблицы для тестов и CLI
pub mod sim;

// Удобные реэкспорты
pub use config::VacuumConfig;
pub use types::{MultiXactId, OffsetNo, PageNo, TupleId, Xid};
pub use vacuum::{
    vacuum_relation, HorizonsPolicy, Relation, RelationRunStats, ResourceBudget, RunServices,
    VacuumOptions,
};
