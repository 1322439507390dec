//! Config command implementation.

use super::serve::load_config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate a configuration file.
    Validate {
        /// Config file path.
        config: PathBuf,
    },
    /// Print the effective configuration with defaults filled in.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command. `config_path` is the global `--config` value.
pub fn run_config(config_path: Option<&std::path::Path>, args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => {
            let loaded = load_config(Some(config.as_path()))?;
            println!("✓ {} is valid", config.display());
            println!(
                "  listener {}:{}, device {}, apply mode {:?}",
                loaded.listener.bind,
                loaded.listener.port,
                loaded.server.device_id,
                loaded.apply.mode
            );
            Ok(())
        }
        ConfigCommand::Show { format } => {
            let config = load_config(config_path)?;
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&config)?),
                "toml" => print!("{}", config.to_toml()?),
                other => anyhow::bail!("unknown format: {} (expected toml or json)", other),
            }
            Ok(())
        }
    }
}
