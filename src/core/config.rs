//! Configuration parsing and validation.
//!
//! Harness configuration is loaded from TOML files (or built in code via
//! [`HarnessConfig::default`]) with CLI overrides. Every field has a default,
//! so an empty document is a valid configuration.

use crate::core::error::{HarnessError, HarnessResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Port the component-test service listens on unless configured otherwise.
pub const DEFAULT_GRPC_PORT: u16 = 9999;

/// Device id the P4Runtime server answers to unless configured otherwise.
pub const DEFAULT_DEVICE_ID: u64 = 183_807_201;

/// Top-level harness configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// RPC transport configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Server-under-test options.
    #[serde(default)]
    pub server: ServerConfig,

    /// Table names of the simulated databases.
    #[serde(default)]
    pub tables: TableNames,

    /// Apply path configuration.
    #[serde(default)]
    pub apply: ApplyConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// RPC transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Loopback address to bind (e.g., "127.0.0.1").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to bind. Zero asks the OS for an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on graceful transport shutdown, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Options handed to the P4Runtime server under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// P4Runtime device id.
    #[serde(default = "default_device_id")]
    pub device_id: u64,

    /// Receive packets through the generic-netlink model.
    #[serde(default)]
    pub use_genetlink: bool,

    /// Controllers address ports by configured id instead of SONiC port name.
    #[serde(default)]
    pub translate_port_ids: bool,

    /// How long the server waits for each acknowledgment, in milliseconds.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            use_genetlink: false,
            translate_port_ids: false,
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

/// Names of the simulated tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableNames {
    /// Table holding P4RT forwarding entries.
    #[serde(default = "default_p4rt_table")]
    pub p4rt: String,

    /// Table holding port configuration.
    #[serde(default = "default_port_table")]
    pub port: String,

    /// Table holding VRF entries.
    #[serde(default = "default_vrf_table")]
    pub vrf: String,

    /// Table holding per-entry counters.
    #[serde(default = "default_counters_table")]
    pub counters: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            p4rt: default_p4rt_table(),
            port: default_port_table(),
            vrf: default_vrf_table(),
            counters: default_counters_table(),
        }
    }
}

impl TableNames {
    /// All configured names as (config key, name) pairs.
    pub fn entries(&self) -> [(&'static str, &str); 4] {
        [
            ("tables.p4rt", self.p4rt.as_str()),
            ("tables.port", self.port.as_str()),
            ("tables.vrf", self.vrf.as_str()),
            ("tables.counters", self.counters.as_str()),
        ]
    }
}

/// How queued mutations are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// A worker thread per table applies mutations as they arrive.
    #[default]
    Background,
    /// Mutations stay queued until the test steps the apply path.
    Manual,
}

/// Apply path configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Apply mode.
    #[serde(default)]
    pub mode: ApplyMode,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_GRPC_PORT
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_device_id() -> u64 {
    DEFAULT_DEVICE_ID
}

fn default_response_timeout_ms() -> u64 {
    10_000
}

fn default_p4rt_table() -> String {
    "P4RT".to_string()
}

fn default_port_table() -> String {
    "PORT_TABLE".to_string()
}

fn default_vrf_table() -> String {
    "VRF_TABLE".to_string()
}

fn default_counters_table() -> String {
    "COUNTERS".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: HarnessConfig =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: HarnessConfig =
            toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config")
    }

    /// Configuration that binds an ephemeral loopback port.
    pub fn ephemeral() -> Self {
        let mut config = Self::default();
        config.listener.port = 0;
        config
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(port) = overrides.port {
            self.listener.port = port;
        }
        if overrides.use_genetlink {
            self.server.use_genetlink = true;
        }
        if overrides.translate_port_ids {
            self.server.translate_port_ids = true;
        }
    }

    /// Address the transport binds to.
    pub fn bind_addr(&self) -> HarnessResult<SocketAddr> {
        let ip: IpAddr = self.listener.bind.parse().map_err(|_| {
            HarnessError::invalid_config(format!(
                "listener.bind must be an IP address, got: {}",
                self.listener.bind
            ))
        })?;
        Ok(SocketAddr::new(ip, self.listener.port))
    }

    /// Graceful shutdown window.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.listener.shutdown_grace_ms)
    }

    /// Per-acknowledgment wait timeout.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.server.response_timeout_ms)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> HarnessResult<()> {
        self.validate_listener()?;
        self.validate_server()?;
        self.validate_tables()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_listener(&self) -> HarnessResult<()> {
        let addr = self.bind_addr()?;
        if !addr.ip().is_loopback() {
            return Err(HarnessError::invalid_config(format!(
                "listener.bind must be a loopback address for an insecure test service, got: {}",
                addr.ip()
            )));
        }
        if self.listener.shutdown_grace_ms == 0 {
            return Err(HarnessError::invalid_config(
                "listener.shutdown_grace_ms must be > 0",
            ));
        }
        Ok(())
    }

    fn validate_server(&self) -> HarnessResult<()> {
        if self.server.device_id == 0 {
            return Err(HarnessError::invalid_config("server.device_id must be > 0"));
        }
        if self.server.response_timeout_ms == 0 {
            return Err(HarnessError::invalid_config(
                "server.response_timeout_ms must be > 0",
            ));
        }
        Ok(())
    }

    fn validate_tables(&self) -> HarnessResult<()> {
        let mut seen = HashSet::new();
        for (key, name) in self.tables.entries() {
            if name.trim().is_empty() {
                return Err(HarnessError::MissingTable {
                    table: key.to_string(),
                });
            }
            if !seen.insert(name) {
                return Err(HarnessError::DuplicateTable {
                    table: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> HarnessResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            return Err(HarnessError::invalid_config(format!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels, self.telemetry.log_level
            )));
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override gRPC port.
    pub port: Option<u16>,
    /// Force generic-netlink packet receive.
    pub use_genetlink: bool,
    /// Force port id translation.
    pub translate_port_ids: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HarnessConfig::from_toml("").unwrap();
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.listener.port, DEFAULT_GRPC_PORT);
        assert_eq!(config.tables.p4rt, "P4RT");
        assert_eq!(config.apply.mode, ApplyMode::Background);
    }

    #[test]
    fn test_apply_mode_parses() {
        let config = HarnessConfig::from_toml("[apply]\nmode = \"manual\"\n").unwrap();
        assert_eq!(config.apply.mode, ApplyMode::Manual);
    }

    #[test]
    fn test_duplicate_table_names_rejected() {
        let mut config = HarnessConfig::default();
        config.tables.vrf = "P4RT".to_string();
        assert_eq!(
            config.validate(),
            Err(HarnessError::DuplicateTable {
                table: "P4RT".to_string()
            })
        );
    }

    #[test]
    fn test_non_loopback_bind_rejected() {
        let mut config = HarnessConfig::default();
        config.listener.bind = "0.0.0.0".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = HarnessConfig::default();
        config.apply_overrides(&ConfigOverrides {
            log_level: Some("debug".into()),
            port: Some(0),
            use_genetlink: true,
            translate_port_ids: false,
        });
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.listener.port, 0);
        assert!(config.server.use_genetlink);
        assert!(!config.server.translate_port_ids);
    }
}
