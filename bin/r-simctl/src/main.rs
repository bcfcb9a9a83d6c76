//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control CLI driving simulations from a configuration file."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use r_sim_common::{init_tracing, AppConfig};
use tracing::info;

mod commands;
mod output;

const DEFAULT_CONFIG_CANDIDATES: [&str; 2] = ["r-sim.toml", "configs/r-sim.toml"];

#[derive(Debug, Parser)]
#[command(author, version, about = "R-SIM simulation control utility", long_about = None)]
struct Cli {
    /// Configuration file; falls back to R_SIM_CONFIG, then ./r-sim.toml and ./configs/r-sim.toml.
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one simulation with the configured setup.
    Run(commands::RunCommand),
    /// List the variables the model exposes.
    Variables(commands::VariablesCommand),
    /// Run every row of a parameter CSV across the worker pool.
    Batch(commands::BatchCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = match &cli.config {
        Some(path) => AppConfig::from_path(path)?,
        None => AppConfig::load(&DEFAULT_CONFIG_CANDIDATES)?,
    };
    init_tracing("r-simctl", &loaded.logging)?;
    info!(model = %loaded.engine.model, backend = %loaded.engine.backend, "configuration loaded");

    match cli.command {
        Commands::Run(cmd) => cmd.execute(&loaded),
        Commands::Variables(cmd) => cmd.execute(&loaded),
        Commands::Batch(cmd) => cmd.execute(&loaded),
    }
}
