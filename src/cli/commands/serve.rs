//! Serve command implementation.

use crate::core::config::{ConfigOverrides, HarnessConfig};
use crate::harness::Harness;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Serve P4Runtime until interrupted.
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// gRPC port (0 picks an ephemeral port).
    #[arg(long)]
    pub port: Option<u16>,

    /// Receive packets through the generic-netlink model.
    #[arg(long)]
    pub use_genetlink: bool,

    /// Translate controller port ids to SONiC port names.
    #[arg(long)]
    pub translate_port_ids: bool,
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) {}

/// Load the configuration file, or defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    match path {
        Some(path) => HarnessConfig::from_file(path)
            .with_context(|| format!("failed to load config from {:?}", path)),
        None => Ok(HarnessConfig::default()),
    }
}

/// Run the serve command.
pub async fn run_serve(
    config_path: Option<&Path>,
    log_level: Option<String>,
    args: ServeArgs,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.apply_overrides(&ConfigOverrides {
        log_level,
        port: args.port,
        use_genetlink: args.use_genetlink,
        translate_port_ids: args.translate_port_ids,
    });
    config.validate().context("invalid configuration")?;
    init_tracing(&config.telemetry.log_level);

    let harness = Harness::new(config).context("failed to start harness")?;
    println!("P4Runtime serving on {}", harness.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::warn!("shutdown signal received (SIGINT)");
    drop(harness);
    Ok(())
}
