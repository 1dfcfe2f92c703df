//! Configuration file support
//!
//! Loads the backend list and the outward exposure from
//! `.mcp-gateway.json` or `.mcp-gateway.toml`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const CONFIG_FILES: [&str; 2] = [".mcp-gateway.json", ".mcp-gateway.toml"];
const GLOBAL_CONFIG_FILES: [&str; 2] = ["config.json", "config.toml"];

/// Find a config file by walking up the directory tree, then checking global config.
///
/// Search order:
/// 1. Current directory and parent directories (walking up to root)
/// 2. `~/.config/mcp-gateway/config.{json,toml}`
pub fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        for filename in CONFIG_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                return Some(candidate);
            }
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        for filename in GLOBAL_CONFIG_FILES {
            let global_path = config_dir.join("mcp-gateway").join(filename);
            if global_path.exists() {
                return Some(global_path);
            }
        }
    }

    None
}

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,

    /// Bound on concurrent fan-out operations
    #[serde(default = "default_max_parallel_calls")]
    pub max_parallel_calls: usize,

    /// Per-backend bound on start + handshake + discovery
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    #[serde(default)]
    pub collision_policy: CollisionPolicy,

    #[serde(default)]
    pub unknown_fields: UnknownFields,

    /// Validate tool arguments against their input schema before routing
    #[serde(default = "default_validate_inputs")]
    pub validate_inputs: bool,

    #[serde(default)]
    pub server: ExposureConfig,

    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_max_parallel_calls() -> usize {
    10
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_validate_inputs() -> bool {
    true
}

fn default_server_name() -> String {
    "mcp-gateway".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            max_parallel_calls: default_max_parallel_calls(),
            startup_timeout_ms: default_startup_timeout_ms(),
            call_timeout_ms: None,
            collision_policy: CollisionPolicy::default(),
            unknown_fields: UnknownFields::default(),
            validate_inputs: default_validate_inputs(),
            server: ExposureConfig::default(),
            server_name: default_server_name(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a discovered file. `Ok(None)` when none exists.
    pub fn load() -> Result<Option<Self>> {
        if let Some(config_path) = find_config_file() {
            tracing::debug!("Loading gateway config from: {}", config_path.display());
            return Self::load_from_path(&config_path).map(Some);
        }

        tracing::debug!("No gateway config found");
        Ok(None)
    }

    /// Load from a specific path; `.toml` selects TOML, anything else JSON.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let mut config: GatewayConfig = if is_toml {
            toml::from_str(&content)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?
        };

        config.expand_env();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_calls == 0 {
            bail!("max_parallel_calls must be at least 1");
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                bail!("backend id cannot be empty");
            }
            if !seen.insert(backend.id.as_str()) {
                bail!("duplicate backend id: {}", backend.id);
            }
            backend
                .connection
                .validate()
                .with_context(|| format!("backend '{}'", backend.id))?;
        }
        Ok(())
    }

    /// Expand `$VAR` / `${VAR}` references in every connection string.
    pub fn expand_env(&mut self) {
        for backend in &mut self.backends {
            backend.connection.expand_env();
        }
    }
}

// ============================================================================
// Backends
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub connection: ConnectionSpec,
}

/// How to reach one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConnectionSpec {
    /// New process per call, message passed as trailing argument
    Process(ProcessSpec),
    /// Long-lived process speaking newline-delimited JSON on stdio
    ProcessRpc(ProcessRpcSpec),
    Http(HttpSpec),
    Socket(SocketSpec),
    /// New container per call
    Container(ContainerSpec),
    ContainerPersistent(PersistentContainerSpec),
}

impl ConnectionSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionSpec::Process(_) => "process",
            ConnectionSpec::ProcessRpc(_) => "process-rpc",
            ConnectionSpec::Http(_) => "http",
            ConnectionSpec::Socket(_) => "socket",
            ConnectionSpec::Container(_) => "container",
            ConnectionSpec::ContainerPersistent(_) => "container-persistent",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            ConnectionSpec::Process(spec) => require("command", &spec.command),
            ConnectionSpec::ProcessRpc(spec) => require("command", &spec.command),
            ConnectionSpec::Http(spec) => {
                require("url", &spec.url)?;
                if let Some(retry) = &spec.retry {
                    retry.validate()?;
                }
                Ok(())
            }
            ConnectionSpec::Socket(spec) => require("url", &spec.url),
            ConnectionSpec::Container(spec) => require("image", &spec.image),
            ConnectionSpec::ContainerPersistent(spec) => {
                require("image", &spec.image)?;
                if spec.exec_command().is_empty() {
                    bail!("persistent containers need `command` or `exec`");
                }
                Ok(())
            }
        }
    }

    fn expand_env(&mut self) {
        match self {
            ConnectionSpec::Process(spec) => {
                expand(&mut spec.command);
                spec.args.iter_mut().for_each(expand);
                expand_map(&mut spec.env);
                if let Some(cwd) = spec.cwd.as_mut() {
                    expand(cwd);
                }
            }
            ConnectionSpec::ProcessRpc(spec) => {
                expand(&mut spec.command);
                spec.args.iter_mut().for_each(expand);
                expand_map(&mut spec.env);
                if let Some(cwd) = spec.cwd.as_mut() {
                    expand(cwd);
                }
            }
            ConnectionSpec::Http(spec) => {
                expand(&mut spec.url);
                expand_map(&mut spec.headers);
            }
            ConnectionSpec::Socket(spec) => {
                expand(&mut spec.url);
                expand_map(&mut spec.headers);
            }
            ConnectionSpec::Container(spec) => {
                spec.command.iter_mut().for_each(expand);
                expand_map(&mut spec.env);
                spec.volumes.iter_mut().for_each(expand);
            }
            ConnectionSpec::ContainerPersistent(spec) => {
                spec.command.iter_mut().for_each(expand);
                if let Some(exec) = spec.exec.as_mut() {
                    exec.iter_mut().for_each(expand);
                }
                expand_map(&mut spec.env);
                spec.volumes.iter_mut().for_each(expand);
            }
        }
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("`{}` cannot be empty", field);
    }
    Ok(())
}

fn expand(value: &mut String) {
    let expanded = shellexpand::env(value.as_str())
        .unwrap_or_else(|_| value.clone().into())
        .into_owned();
    *value = expanded;
}

fn expand_map(map: &mut HashMap<String, String>) {
    map.values_mut().for_each(expand);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Program, optionally followed by space-separated leading arguments
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRpcSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Delay after spawn before the process is considered ready
    #[serde(default = "default_ready_delay_ms")]
    pub ready_delay_ms: u64,
}

fn default_ready_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_factor() -> f64 {
    1.5
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let exp = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        std::time::Duration::from_millis(millis as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.factor < 1.0 {
            bail!("retry factor must be >= 1.0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketSpec {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// `host:container[:mode]`
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "default_auto_remove")]
    pub auto_remove: bool,
    /// Container CLI binary
    #[serde(default = "default_runtime")]
    pub runtime: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentContainerSpec {
    pub image: String,
    /// Main command of the container
    #[serde(default)]
    pub command: Vec<String>,
    /// Command run by each exec; defaults to `command`
    #[serde(default)]
    pub exec: Option<Vec<String>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "default_auto_remove")]
    pub auto_remove: bool,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    #[serde(default = "default_runtime")]
    pub runtime: String,
}

impl PersistentContainerSpec {
    pub fn exec_command(&self) -> &[String] {
        self.exec.as_deref().unwrap_or(&self.command)
    }
}

fn default_auto_remove() -> bool {
    true
}

fn default_runtime() -> String {
    "docker".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::UnlessStopped => "unless-stopped",
            RestartPolicy::OnFailure => "on-failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Shell command run inside the container
    pub test: String,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
    #[serde(default)]
    pub start_period_ms: u64,
}

fn default_health_interval_ms() -> u64 {
    5_000
}

fn default_health_timeout_ms() -> u64 {
    3_000
}

fn default_health_retries() -> u32 {
    3
}

// ============================================================================
// Registry policies
// ============================================================================

/// What happens when two backends expose the same tool name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// Earliest backend in configured order keeps the name
    #[default]
    FirstWins,
    /// Latest backend in configured order keeps the name
    LastWins,
    /// Every colliding tool is registered as `<backend>__<tool>`
    Prefix,
}

/// Handling of top-level input fields absent from a tool's schema
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownFields {
    #[default]
    Passthrough,
    Reject,
}

// ============================================================================
// Outward exposure
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum ExposureConfig {
    Stdio,
    StreamableHttp {
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_port")]
        port: u16,
        #[serde(default = "default_http_path")]
        path: String,
    },
    Sse {
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_port")]
        port: u16,
        #[serde(default = "default_sse_path")]
        path: String,
        #[serde(default = "default_messages_path")]
        messages_path: String,
    },
}

impl Default for ExposureConfig {
    fn default() -> Self {
        ExposureConfig::Stdio
    }
}

pub fn default_host() -> String {
    "127.0.0.1".to_string()
}

pub fn default_port() -> u16 {
    3000
}

pub fn default_http_path() -> String {
    "/".to_string()
}

pub fn default_sse_path() -> String {
    "/sse".to_string()
}

pub fn default_messages_path() -> String {
    "/messages".to_string()
}
