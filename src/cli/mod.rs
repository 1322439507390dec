//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// P4RT harness - P4Runtime server over simulated SONiC databases.
#[derive(Parser, Debug)]
#[command(name = "p4rt-harness")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve P4Runtime until interrupted.
    Serve(commands::ServeArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}
