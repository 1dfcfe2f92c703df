//! Shared test fixtures: in-memory backends behind a mock transport factory

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use mcp_gateway::config::{BackendDescriptor, ConnectionSpec, ProcessSpec};
use mcp_gateway::error::{GatewayError, Result};
use mcp_gateway::protocol::{CallToolResult, ClientJsonRpcMessage, Tool};
use mcp_gateway::transport::{ErrorHandler, Handlers, MessageHandler, Transport, TransportFactory};

/// Scripted behaviour of one fake backend
#[derive(Clone, Default)]
pub struct MockBackend {
    pub tools: Vec<Tool>,
    pub fail_start: bool,
    /// `close` records the call, then fails
    pub fail_close: bool,
    pub start_delay: Duration,
    pub call_delay: Duration,
    /// Tool name -> (code, message) returned as a JSON-RPC error
    pub errors: HashMap<String, (i32, String)>,
}

impl MockBackend {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|n| tool(n)).collect(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Default::default()
        }
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn error_on(mut self, tool: &str, code: i32, message: &str) -> Self {
        self.errors.insert(tool.to_string(), (code, message.to_string()));
        self
    }
}

pub fn tool(name: &str) -> Tool {
    tool_with_schema(name, json!({"type": "object"}))
}

pub fn tool_with_schema(name: &str, schema: Value) -> Tool {
    serde_json::from_value(json!({
        "name": name,
        "description": format!("{} tool", name),
        "inputSchema": schema,
    }))
    .unwrap()
}

/// A recorded `tools/call`
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub backend: String,
    pub tool: String,
    pub arguments: Value,
}

/// Observations shared by every transport of one factory
#[derive(Default)]
pub struct Stats {
    pub calls: Mutex<Vec<RecordedCall>>,
    pub started: Mutex<Vec<String>>,
    pub closed: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    active_calls: AtomicUsize,
    max_calls: AtomicUsize,
}

impl Stats {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    /// Highest number of backends seen starting at the same time
    pub fn max_concurrent_starts(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Highest number of tool calls seen in flight at the same time
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_calls.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn enter_call(&self) {
        let now = self.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_calls.fetch_max(now, Ordering::SeqCst);
    }

    fn exit_call(&self) {
        self.active_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockFactory {
    backends: HashMap<String, MockBackend>,
    pub stats: Arc<Stats>,
}

impl MockFactory {
    pub fn new(backends: Vec<(&str, MockBackend)>) -> Arc<Self> {
        Arc::new(Self {
            backends: backends
                .into_iter()
                .map(|(id, backend)| (id.to_string(), backend))
                .collect(),
            stats: Arc::new(Stats::default()),
        })
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, backend_id: &str, _spec: &ConnectionSpec) -> Result<Arc<dyn Transport>> {
        let backend = self
            .backends
            .get(backend_id)
            .cloned()
            .ok_or_else(|| GatewayError::Config(format!("no mock for '{}'", backend_id)))?;
        Ok(Arc::new(MockTransport {
            backend_id: backend_id.to_string(),
            backend,
            handlers: Handlers::default(),
            stats: self.stats.clone(),
        }))
    }
}

pub struct MockTransport {
    backend_id: String,
    backend: MockBackend,
    handlers: Handlers,
    stats: Arc<Stats>,
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers.set_message(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.handlers.set_error(handler);
    }

    async fn start(&self) -> Result<()> {
        self.stats.enter();
        tokio::time::sleep(self.backend.start_delay).await;
        self.stats.exit();

        if self.backend.fail_start {
            return Err(GatewayError::TransportStart(format!(
                "{} refused to start",
                self.backend_id
            )));
        }
        self.stats.started.lock().unwrap().push(self.backend_id.clone());
        Ok(())
    }

    async fn send(&self, message: ClientJsonRpcMessage) -> Result<()> {
        let request = serde_json::to_value(&message)?;
        let (Some(id), Some(method)) = (request.get("id").cloned(), request["method"].as_str()) else {
            return Ok(());
        };
        let method = method.to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let backend = self.backend.clone();
        let backend_id = self.backend_id.clone();
        let handlers = self.handlers.clone();
        let stats = self.stats.clone();

        // Reply asynchronously, like a real peer.
        tokio::spawn(async move {
            let outcome = match method.as_str() {
                "initialize" => Ok(json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": backend_id, "version": "0.0.0"}
                })),
                "tools/list" => Ok(json!({ "tools": backend.tools })),
                "tools/call" => {
                    let tool = params["name"].as_str().unwrap_or_default().to_string();
                    stats.calls.lock().unwrap().push(RecordedCall {
                        backend: backend_id.clone(),
                        tool: tool.clone(),
                        arguments: params["arguments"].clone(),
                    });
                    stats.enter_call();
                    tokio::time::sleep(backend.call_delay).await;
                    stats.exit_call();

                    match backend.errors.get(&tool) {
                        Some((code, message)) => Err((*code, message.clone())),
                        None => Ok(json!({
                            "content": [{"type": "text", "text": format!("{}:{}", backend_id, tool)}],
                            "isError": false
                        })),
                    }
                }
                other => Err((-32601, format!("Method not found: {}", other))),
            };

            let reply = match outcome {
                Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Err((code, message)) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": code, "message": message}
                }),
            };
            handlers.dispatch(serde_json::from_value(reply).unwrap());
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stats.closed.lock().unwrap().push(self.backend_id.clone());
        if self.backend.fail_close {
            return Err(GatewayError::Transport(format!(
                "{} failed to close",
                self.backend_id
            )));
        }
        Ok(())
    }
}

/// Descriptors for the given ids; the mock factory ignores the connection
pub fn descriptors(ids: &[&str]) -> Vec<BackendDescriptor> {
    ids.iter()
        .map(|id| BackendDescriptor {
            id: id.to_string(),
            connection: ConnectionSpec::Process(ProcessSpec {
                command: "unused".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                cwd: None,
            }),
        })
        .collect()
}

/// Text of the first content item of a tool result
pub fn result_text(result: &CallToolResult) -> String {
    let value = serde_json::to_value(result).unwrap();
    value["content"][0]["text"].as_str().unwrap_or_default().to_string()
}
