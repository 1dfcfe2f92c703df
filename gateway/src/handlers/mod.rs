//! Command handlers
//!
//! One `run_*` function per CLI subcommand. [`CommandContext`] carries the
//! loaded configuration shared by all of them.

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::config::GatewayConfig;
use crate::pool::ConnectReport;

pub mod serve;
pub mod tools;

pub use serve::{run_serve, ExposureKind, ReloadTask, ServeOverrides};
pub use tools::{run_call_tool, run_status, run_tools};

pub struct CommandContext {
    pub config: GatewayConfig,
    pub config_path: Option<PathBuf>,
}

impl CommandContext {
    /// Load an explicit config path, or discover one.
    ///
    /// Without any config file the gateway starts with no backends.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        match config_path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                let config = GatewayConfig::load_from_path(&path)?;
                Ok(Self {
                    config,
                    config_path: Some(path),
                })
            }
            None => {
                let discovered = crate::config::find_config_file();
                let config = GatewayConfig::load()?.unwrap_or_else(|| {
                    tracing::warn!("No .mcp-gateway.json or .mcp-gateway.toml found; no backends configured");
                    GatewayConfig::default()
                });
                Ok(Self {
                    config,
                    config_path: discovered,
                })
            }
        }
    }
}

/// One-line summary of a connect
pub(crate) fn log_report(report: &ConnectReport) {
    if report.all_connected() {
        tracing::info!("All {} backend(s) connected", report.connected.len());
    } else {
        let failed: Vec<&str> = report.failed.iter().map(|f| f.backend.as_str()).collect();
        tracing::warn!(
            "{} backend(s) connected, unavailable: {}",
            report.connected.len(),
            failed.join(", ")
        );
    }
}
