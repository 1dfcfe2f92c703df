//! Backend pool and tool router
//!
//! Owns one [`BackendClient`] per configured backend. `connect` fans out
//! over all backends with bounded parallelism, then builds the tool registry
//! in configured backend order so collisions resolve the same way on every
//! run. A backend that fails to connect is closed, reported, and left out;
//! the others are unaffected.
//!
//! The registry and client map only change inside `connect`/`disconnect`.
//! Calls take a read snapshot of the owning client and release the lock
//! before talking to the backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::config::{BackendDescriptor, CollisionPolicy, GatewayConfig, UnknownFields};
use crate::error::{GatewayError, Result};
use crate::protocol::{BackendClient, CallToolResult, Tool};
use crate::schema::{self, Validator};
use crate::transport::{DefaultTransportFactory, TransportFactory};

/// Separator between backend id and tool name under the prefix policy
pub const PREFIX_SEPARATOR: &str = "__";

// ============================================================================
// Router seam
// ============================================================================

/// What outward engines need from the pool
#[async_trait]
pub trait ToolRouter: Send + Sync {
    /// Current registry snapshot
    async fn get_tools(&self) -> Vec<Tool>;

    /// Route one call to the owning backend and return its result unmodified
    async fn execute_tool(&self, name: &str, input: Value) -> Result<CallToolResult>;
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_parallel_calls: usize,
    pub startup_timeout: Duration,
    pub call_timeout: Option<Duration>,
    pub collision_policy: CollisionPolicy,
    pub unknown_fields: UnknownFields,
    pub validate_inputs: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_parallel_calls: 10,
            startup_timeout: Duration::from_secs(30),
            call_timeout: None,
            collision_policy: CollisionPolicy::FirstWins,
            unknown_fields: UnknownFields::Passthrough,
            validate_inputs: true,
        }
    }
}

impl PoolOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_parallel_calls: config.max_parallel_calls.max(1),
            startup_timeout: Duration::from_millis(config.startup_timeout_ms),
            call_timeout: config.call_timeout_ms.map(Duration::from_millis),
            collision_policy: config.collision_policy,
            unknown_fields: config.unknown_fields,
            validate_inputs: config.validate_inputs,
        }
    }
}

/// A registry entry as exposed to callers
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredTool {
    /// Backend that owns the tool
    pub owner: String,
    /// Name the backend knows the tool by
    pub backend_name: String,
    /// Descriptor under the exposed name
    pub descriptor: Tool,
}

struct ToolEntry {
    tool: RegisteredTool,
    validator: Validator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendFailure {
    pub backend: String,
    pub error: String,
}

/// Two backends exposing the same tool name.
///
/// Under the prefix policy both are kept under `<backend>__<tool>` and
/// `winner` is simply the earlier backend in configured order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCollision {
    pub tool: String,
    /// Backend whose tool is registered under the name
    pub winner: String,
    /// Backend whose tool was dropped or renamed
    pub loser: String,
}

/// Outcome of the last `connect`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectReport {
    pub connected: Vec<String>,
    pub failed: Vec<BackendFailure>,
    pub collisions: Vec<ToolCollision>,
}

impl ConnectReport {
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug)]
pub struct ToolCallOutcome {
    pub name: String,
    pub result: Result<CallToolResult>,
}

#[derive(Default)]
struct PoolState {
    connected: bool,
    clients: HashMap<String, Arc<BackendClient>>,
    registry: HashMap<String, ToolEntry>,
}

// ============================================================================
// Pool
// ============================================================================

pub struct BackendPool {
    backends: Vec<BackendDescriptor>,
    factory: Arc<dyn TransportFactory>,
    options: PoolOptions,
    state: RwLock<PoolState>,
    report: RwLock<ConnectReport>,
    /// Serializes connect and disconnect
    lifecycle: Mutex<()>,
}

impl BackendPool {
    pub fn new(
        backends: Vec<BackendDescriptor>,
        factory: Arc<dyn TransportFactory>,
        options: PoolOptions,
    ) -> Self {
        Self {
            backends,
            factory,
            options,
            state: RwLock::new(PoolState::default()),
            report: RwLock::new(ConnectReport::default()),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.backends.clone(),
            Arc::new(DefaultTransportFactory),
            PoolOptions::from_config(config),
        )
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id.clone()).collect()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    /// Report from the last `connect`
    pub async fn status(&self) -> ConnectReport {
        self.report.read().await.clone()
    }

    /// Connect every backend and build the registry.
    ///
    /// Individual backend failures are isolated and listed in the report.
    pub async fn connect(&self) -> Result<ConnectReport> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state.read().await.connected {
            return Err(GatewayError::AlreadyConnected);
        }

        tracing::info!(
            "Connecting {} backend(s), at most {} at a time",
            self.backends.len(),
            self.options.max_parallel_calls
        );

        // Completion order is arbitrary; `buffered` yields in input order.
        let attempts: Vec<_> = self
            .backends
            .iter()
            .map(|backend| async move { (backend, self.connect_backend(backend).await) })
            .collect();
        let outcomes: Vec<_> = stream::iter(attempts)
            .buffered(self.options.max_parallel_calls)
            .collect()
            .await;

        let mut report = ConnectReport::default();
        let mut clients = HashMap::new();
        let mut discovered = Vec::new();

        for (backend, outcome) in outcomes {
            match outcome {
                Ok((client, tools)) => {
                    tracing::info!("Backend '{}' connected with {} tool(s)", backend.id, tools.len());
                    report.connected.push(backend.id.clone());
                    clients.insert(backend.id.clone(), client);
                    discovered.push((backend.id.clone(), tools));
                }
                Err(e) => {
                    tracing::warn!("Backend '{}' failed to connect: {}", backend.id, e);
                    report.failed.push(BackendFailure {
                        backend: backend.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let (registry, collisions) = self.build_registry(discovered);
        report.collisions = collisions;

        tracing::info!(
            "Registry ready: {} tool(s) from {} backend(s), {} failed",
            registry.len(),
            report.connected.len(),
            report.failed.len()
        );

        {
            let mut state = self.state.write().await;
            state.clients = clients;
            state.registry = registry;
            state.connected = true;
        }
        *self.report.write().await = report.clone();

        Ok(report)
    }

    /// Start, handshake and discover one backend, closing it on any failure
    async fn connect_backend(
        &self,
        backend: &BackendDescriptor,
    ) -> Result<(Arc<BackendClient>, Vec<Tool>)> {
        let transport = self
            .factory
            .create(&backend.id, &backend.connection)
            .map_err(|e| GatewayError::TransportStart(e.to_string()))?;

        let handshake = async {
            let client = BackendClient::connect(&backend.id, transport.clone()).await?;
            let tools = client.list_tools().await?;
            Ok::<_, GatewayError>((client, tools))
        };

        let outcome = match tokio::time::timeout(self.options.startup_timeout, handshake).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::Timeout(self.options.startup_timeout.as_millis() as u64)),
        };

        match outcome {
            Ok((client, tools)) => Ok((Arc::new(client), tools)),
            Err(e) => {
                if let Err(close) = transport.close().await {
                    tracing::debug!("Closing failed backend '{}': {}", backend.id, close);
                }
                Err(e)
            }
        }
    }

    fn build_registry(
        &self,
        discovered: Vec<(String, Vec<Tool>)>,
    ) -> (HashMap<String, ToolEntry>, Vec<ToolCollision>) {
        let policy = self.options.collision_policy;

        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        for (_, tools) in &discovered {
            for tool in tools {
                *occurrences.entry(tool.name.as_ref()).or_default() += 1;
            }
        }
        let colliding: HashSet<String> = occurrences
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, _)| name.to_string())
            .collect();

        let mut registry: HashMap<String, ToolEntry> = HashMap::new();
        let mut first_owner: HashMap<String, String> = HashMap::new();
        let mut collisions = Vec::new();

        for (owner, tools) in discovered {
            for tool in tools {
                let backend_name = tool.name.to_string();
                let exposed = if policy == CollisionPolicy::Prefix && colliding.contains(&backend_name) {
                    format!("{}{}{}", owner, PREFIX_SEPARATOR, backend_name)
                } else {
                    backend_name.clone()
                };

                if let Some(existing) = registry.get(&exposed) {
                    let keep_existing = policy != CollisionPolicy::LastWins;
                    let (winner, loser) = if keep_existing {
                        (existing.tool.owner.clone(), owner.clone())
                    } else {
                        (owner.clone(), existing.tool.owner.clone())
                    };
                    tracing::warn!(
                        "Tool '{}' is exposed by both '{}' and '{}'; keeping '{}'",
                        exposed,
                        existing.tool.owner,
                        owner,
                        winner
                    );
                    collisions.push(ToolCollision {
                        tool: exposed.clone(),
                        winner,
                        loser,
                    });
                    if keep_existing {
                        continue;
                    }
                } else if exposed != backend_name {
                    // Prefix policy keeps both; report each pair once.
                    match first_owner.get(&backend_name) {
                        Some(first) if *first != owner => collisions.push(ToolCollision {
                            tool: backend_name.clone(),
                            winner: first.clone(),
                            loser: owner.clone(),
                        }),
                        Some(_) => {}
                        None => {
                            first_owner.insert(backend_name.clone(), owner.clone());
                        }
                    }
                }

                let input_schema = Value::Object(tool.input_schema.as_ref().clone());
                let validator = schema::convert(&input_schema, self.options.unknown_fields);
                let mut descriptor = tool;
                descriptor.name = exposed.clone().into();
                registry.insert(
                    exposed,
                    ToolEntry {
                        tool: RegisteredTool {
                            owner: owner.clone(),
                            backend_name,
                            descriptor,
                        },
                        validator,
                    },
                );
            }
        }

        (registry, collisions)
    }

    /// Registry entries with their owners, sorted by exposed name
    pub async fn registered_tools(&self) -> Vec<RegisteredTool> {
        let state = self.state.read().await;
        let mut tools: Vec<_> = state.registry.values().map(|e| e.tool.clone()).collect();
        tools.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        tools
    }

    pub async fn tool_owner(&self, name: &str) -> Option<String> {
        self.state
            .read()
            .await
            .registry
            .get(name)
            .map(|e| e.tool.owner.clone())
    }

    pub async fn get_tools(&self) -> Vec<Tool> {
        self.state
            .read()
            .await
            .registry
            .values()
            .map(|e| e.tool.descriptor.clone())
            .collect()
    }

    pub async fn execute_tool(&self, name: &str, input: Value) -> Result<CallToolResult> {
        let (client, backend_name) = {
            let state = self.state.read().await;
            let entry = state
                .registry
                .get(name)
                .ok_or_else(|| GatewayError::ToolNotFound(name.to_string()))?;

            if self.options.validate_inputs {
                entry
                    .validator
                    .validate(&input)
                    .map_err(|e| GatewayError::InvalidParams(e.to_string()))?;
            }

            let client = state
                .clients
                .get(&entry.tool.owner)
                .cloned()
                .ok_or_else(|| GatewayError::ToolNotFound(name.to_string()))?;
            (client, entry.tool.backend_name.clone())
        };

        tracing::debug!("Routing '{}' to backend '{}'", name, client.backend_id());

        let arguments = input.as_object().cloned();
        match self.options.call_timeout {
            Some(limit) => tokio::time::timeout(limit, client.call_tool(&backend_name, arguments))
                .await
                .map_err(|_| GatewayError::Timeout(limit.as_millis() as u64))?,
            None => client.call_tool(&backend_name, arguments).await,
        }
    }

    /// Fan out several calls with bounded parallelism.
    ///
    /// Outcomes come back in input order, each with its own result, so one
    /// failing call never affects the others.
    pub async fn execute_tools(&self, calls: Vec<ToolCall>) -> Vec<ToolCallOutcome> {
        stream::iter(calls)
            .map(|call| async move {
                let result = self.execute_tool(&call.name, call.arguments).await;
                ToolCallOutcome {
                    name: call.name,
                    result,
                }
            })
            .buffered(self.options.max_parallel_calls)
            .collect()
            .await
    }

    /// Close every backend and clear the registry.
    ///
    /// Close failures are logged, never returned. Safe to call repeatedly,
    /// and after a partial or absent `connect`.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let clients: Vec<(String, Arc<BackendClient>)> = {
            let mut state = self.state.write().await;
            state.connected = false;
            state.registry.clear();
            state.clients.drain().collect()
        };

        if clients.is_empty() {
            return;
        }

        tracing::info!("Disconnecting {} backend(s)", clients.len());

        stream::iter(clients)
            .for_each_concurrent(self.options.max_parallel_calls, |(id, client)| async move {
                if let Err(e) = client.close().await {
                    tracing::warn!("Error closing backend '{}': {}", id, e);
                }
            })
            .await;
    }
}

#[async_trait]
impl ToolRouter for BackendPool {
    async fn get_tools(&self) -> Vec<Tool> {
        BackendPool::get_tools(self).await
    }

    async fn execute_tool(&self, name: &str, input: Value) -> Result<CallToolResult> {
        BackendPool::execute_tool(self, name, input).await
    }
}
