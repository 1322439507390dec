//! CLI command implementations.

mod config;
mod serve;

pub use config::{run_config, ConfigArgs, ConfigCommand};
pub use serve::{load_config, run_serve, ServeArgs};
