use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI движка vacuum: прогон по синтетической таблице и разбор WAL.
#[derive(Parser, Debug)]
#[command(name = "quiver-vacuum", version, about = "Lazy vacuum engine CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Build an in-memory table, churn it and vacuum it (P1_VACUUM_* env applies)
    Simulate {
        #[arg(long, default_value_t = 64)]
        pages: u32,
        #[arg(long, default_value_t = 40)]
        live_per_page: usize,
        /// Rows per page deleted by an old committed transaction
        #[arg(long, default_value_t = 0)]
        dead_per_page: usize,
        /// Probability that a live row gets deleted while loading
        #[arg(long, default_value_t = 0.2)]
        churn: f64,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long, default_value_t = 1)]
        indexes: usize,
        /// Parallel workers (overrides P1_VACUUM_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Dead tuple memory budget, KiB (overrides P1_VACUUM_WORK_MEM_KB)
        #[arg(long)]
        work_mem_kb: Option<usize>,
        #[arg(long)]
        disable_page_skipping: bool,
        #[arg(long)]
        aggressive: bool,
        #[arg(long)]
        verbose: bool,
        /// Convert dead rows to dead line pointers before classification
        #[arg(long)]
        prune: bool,
        /// Repeat the vacuum run N times over the same table
        #[arg(long, default_value_t = 1)]
        runs: u32,
        /// Write WAL records to <dir>/vacuum-000001.log instead of memory
        #[arg(long)]
        wal_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print WAL records from a vacuum WAL directory
    WalDump {
        #[arg(long)]
        dir: PathBuf,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Print effective configuration (defaults + P1_VACUUM_* env)
    Config,
}
