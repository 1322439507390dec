//! P4RT harness - CLI entrypoint.
//!
//! Usage:
//!   p4rt-harness serve [--port N] [--use-genetlink] [--translate-port-ids]
//!   p4rt-harness config validate harness.toml
//!   p4rt-harness --config harness.toml config show [--format json]

use anyhow::Result;
use clap::Parser;
use p4rt_harness::cli::commands::{run_config, run_serve};
use p4rt_harness::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.map(PathBuf::from);

    match cli.command {
        Commands::Serve(args) => run_serve(config_path.as_deref(), cli.log_level, args).await,
        Commands::Config(args) => run_config(config_path.as_deref(), args),
    }
}
