//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "onchain-etl")]
#[command(about = "Ingests contract event logs into PostgreSQL", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "ETL_CONFIG", default_value = "./config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest historical blocks once, from the deployment block to the head
    Backfill {
        /// First block, overrides `indexing.deployment_block`
        #[arg(long)]
        from: Option<u64>,

        /// Last block, defaults to the current head
        #[arg(long)]
        to: Option<u64>,
    },

    /// Poll for new blocks until interrupted
    Listen,
}
