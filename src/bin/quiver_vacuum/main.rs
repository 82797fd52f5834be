use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};

mod cli;
mod cmd_simulate;
mod cmd_wal_dump;

fn init_logger() {
    // RUST_LOG=debug - отчёты о каждом цикле очистки
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Simulate {
            pages,
            live_per_page,
            dead_per_page,
            churn,
            seed,
            indexes,
            workers,
            work_mem_kb,
            disable_page_skipping,
            aggressive,
            verbose,
            prune,
            runs,
            wal_dir,
            json,
        } => cmd_simulate::exec(cmd_simulate::SimulateArgs {
            pages,
            live_per_page,
            dead_per_page,
            churn,
            seed,
            indexes,
            workers,
            work_mem_kb,
            disable_page_skipping,
            aggressive,
            verbose,
            prune,
            runs,
            wal_dir,
            json,
        }),

        cli::Cmd::WalDump { dir, json } => cmd_wal_dump::exec(dir, json),

        cli::Cmd::Config => {
            println!("{}", quiver_vacuum::VacuumConfig::from_env());
            Ok(())
        }
    }
}
