//! Command-line driver for the warehouse fleet engine.

mod sim;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use warehouse_fleet::{logging, DeadlockTableConfig, ResolutionTable, Warehouse, WarehouseConfig};

use crate::sim::FleetParams;

/// Coordinate a simulated fleet of warehouse agents.
#[derive(Parser)]
#[command(name = "warehouse_fleet")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Warehouse map (JSON). Defaults to a 5x5 grid.
    #[arg(long, global = true, env = "FLEET_MAP", value_name = "FILE")]
    map: Option<PathBuf>,

    /// Deadlock resolution table (JSON). Defaults to stepping the blocked agent back.
    #[arg(long, global = true, env = "FLEET_DEADLOCK_TABLE", value_name = "FILE")]
    deadlock_table: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "FLEET_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a small threaded demo and print a summary
    Demo,

    /// Run one benchmark and print a CSV row
    Bench {
        #[arg(long, default_value_t = 4)]
        agents: usize,

        #[arg(long, default_value_t = 10)]
        tasks_per_agent: usize,

        /// Side length of the generated grid (ignored with --map)
        #[arg(long, default_value_t = 8)]
        grid: u32,

        /// Time spent working at each goal
        #[arg(long, default_value_t = 5)]
        work_ms: u64,

        #[arg(long, default_value_t = 100)]
        ticks_per_second: u32,

        /// Track task ids and report duplicates
        #[arg(long)]
        validate: bool,
    },

    /// Print the validated map as JSON
    Map,
}

fn load_warehouse(path: Option<&PathBuf>, grid: u32) -> Result<Arc<Warehouse>> {
    let config = match path {
        Some(path) => WarehouseConfig::load(path)
            .with_context(|| format!("loading warehouse map {}", path.display()))?,
        None => WarehouseConfig::grid(grid, grid),
    };
    let warehouse = Warehouse::from_config(&config).context("invalid warehouse map")?;
    info!(nodes = warehouse.len(), "warehouse ready");
    Ok(Arc::new(warehouse))
}

fn load_table(path: Option<&PathBuf>) -> Result<ResolutionTable> {
    let config = match path {
        Some(path) => DeadlockTableConfig::load(path)
            .with_context(|| format!("loading deadlock table {}", path.display()))?,
        None => DeadlockTableConfig::default(),
    };
    ResolutionTable::from_config(&config).context("invalid deadlock table")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command.unwrap_or(Commands::Demo) {
        Commands::Demo => {
            let warehouse = load_warehouse(cli.map.as_ref(), 5)?;
            let table = load_table(cli.deadlock_table.as_ref())?;
            sim::run_demo(warehouse, table)
        }
        Commands::Bench {
            agents,
            tasks_per_agent,
            grid,
            work_ms,
            ticks_per_second,
            validate,
        } => {
            let warehouse = load_warehouse(cli.map.as_ref(), grid)?;
            let table = load_table(cli.deadlock_table.as_ref())?;
            let params = FleetParams {
                agents,
                tasks_per_agent,
                work: Duration::from_millis(work_ms),
                ticks_per_second,
                validate,
            };
            sim::run_benchmark(warehouse, table, &params)
        }
        Commands::Map => {
            let warehouse = load_warehouse(cli.map.as_ref(), 5)?;
            let json = serde_json::to_string_pretty(&warehouse.snapshot())?;
            println!("{json}");
            Ok(())
        }
    }
}
