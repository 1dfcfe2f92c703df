//! Outward protocol engine
//!
//! One engine per client session. The session's [`GatewayServer`] is served
//! by rmcp over an in-memory link; the engine is the JSON front in between.
//! It splits batches element by element, keeps requests other than
//! `initialize` and `ping` out until the handshake is done, and maps client
//! ids (any JSON number or string) onto the link's own numeric ids so every
//! reply carries exactly the id the client sent.
//!
//! ```text
//!   client JSON ──► ProtocolEngine ──► SessionLink ──► rmcp ──► GatewayServer
//!        ▲                                                          │
//!        └──── replies (by local id) ◄── pump ◄─────────────────────┘
//!                 pushes ──► OutboundSlot
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mcp_common::{
    internal_error, invalid_params, invalid_request, method_not_found, not_initialized, McpError,
};
use rmcp::model::InitializeRequestParam;
use rmcp::service::RunningService;
use rmcp::{RoleServer, ServiceExt};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, RwLock};

use super::{
    error_reply, methods, result_reply, CallToolRequestParam, ClientJsonRpcMessage, GatewayServer,
    ServerJsonRpcMessage, JSONRPC_VERSION,
};
use crate::error::{GatewayError, Result};

/// Where server-initiated messages for a session go; `None` once it closed
pub type OutboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<Value>>>>;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    AwaitingInitialize,
    Ready,
}

/// The rmcp side of a session
struct Link {
    inbox: mpsc::UnboundedSender<ClientJsonRpcMessage>,
    /// Set once the handshake completed
    service: Option<RunningService<RoleServer, GatewayServer>>,
}

pub struct ProtocolEngine {
    server: GatewayServer,
    outbound: OutboundSlot,
    state: RwLock<EngineState>,
    link: Mutex<Option<Link>>,
    handshake: tokio::sync::Mutex<()>,
    pending: Pending,
    next_id: AtomicU64,
}

impl ProtocolEngine {
    pub fn new(server: GatewayServer, outbound: OutboundSlot) -> Self {
        Self {
            server,
            outbound,
            state: RwLock::new(EngineState::AwaitingInitialize),
            link: Mutex::new(None),
            handshake: tokio::sync::Mutex::new(()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    fn inbox(&self) -> Option<mpsc::UnboundedSender<ClientJsonRpcMessage>> {
        lock(&self.link).as_ref().map(|link| link.inbox.clone())
    }

    /// Handle a raw body holding one message or a batch.
    ///
    /// Returns `None` when nothing needs answering. Each batch element is
    /// handled on its own; a malformed one gets its own invalid-request
    /// reply.
    pub async fn handle_value(&self, body: Value) -> Option<Value> {
        match body {
            Value::Array(items) if items.is_empty() => {
                Some(error_reply(Value::Null, invalid_request("empty batch")))
            }
            Value::Array(items) => {
                let mut replies = Vec::new();
                for item in items {
                    if let Some(reply) = self.handle_message(item).await {
                        replies.push(reply);
                    }
                }
                (!replies.is_empty()).then_some(Value::Array(replies))
            }
            single => self.handle_message(single).await,
        }
    }

    /// Handle one message; requests always produce a reply
    pub async fn handle_message(&self, message: Value) -> Option<Value> {
        match Incoming::classify(message) {
            Err((id, detail)) => Some(error_reply(id, invalid_request(detail))),
            Ok(Incoming::Request { id, method, body }) => {
                Some(self.handle_request(id, &method, body).await)
            }
            Ok(Incoming::Notification { method, body }) => {
                self.forward_notification(&method, body);
                None
            }
            Ok(Incoming::Reply) => {
                tracing::debug!("Ignoring client reply");
                None
            }
        }
    }

    async fn handle_request(&self, id: Value, method: &str, body: Map<String, Value>) -> Value {
        let ready = self.state().await == EngineState::Ready;
        let reply = match method {
            methods::INITIALIZE => self.initialize(id.clone(), body).await,
            methods::PING if !ready => result_reply(id.clone(), json!({})),
            _ if !ready => error_reply(id.clone(), not_initialized()),
            _ if !methods::is_known(method) => error_reply(id.clone(), method_not_found(method)),
            _ => self.forward(id.clone(), method, body).await,
        };

        if let Some(error) = reply.get("error") {
            tracing::debug!("Request {} ({}) failed: {}", id, method, error["message"]);
        }
        reply
    }

    async fn initialize(&self, id: Value, body: Map<String, Value>) -> Value {
        let _handshake = self.handshake.lock().await;
        if self.state().await == EngineState::Ready {
            return self.forward(id, methods::INITIALIZE, body).await;
        }
        if let Err(error) = check_params(methods::INITIALIZE, &body) {
            return error_reply(id, error);
        }

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (replies, replies_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(replies_rx, self.pending.clone(), self.outbound.clone()));
        let serving = tokio::spawn(self.server.clone().serve(SessionLink {
            inbox: inbox_rx,
            outbound: replies,
        }));
        *lock(&self.link) = Some(Link {
            inbox: inbox.clone(),
            service: None,
        });

        let reply = self.forward(id.clone(), methods::INITIALIZE, body).await;
        if reply.get("error").is_some() {
            serving.abort();
            *lock(&self.link) = None;
            return reply;
        }

        // rmcp completes the handshake on `notifications/initialized`; the
        // client's own copy is not forwarded.
        let service = match initialized_notification() {
            Ok(notification) => {
                if inbox.send(notification).is_ok() {
                    match serving.await {
                        Ok(Ok(service)) => Ok(service),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(e) => Err(e.to_string()),
                    }
                } else {
                    Err("session closed".to_string())
                }
            }
            Err(e) => Err(e.to_string()),
        };

        match service {
            Ok(service) => {
                *lock(&self.link) = Some(Link {
                    inbox,
                    service: Some(service),
                });
                *self.state.write().await = EngineState::Ready;
                reply
            }
            Err(detail) => {
                *lock(&self.link) = None;
                error_reply(id, internal_error(format!("handshake failed: {}", detail)))
            }
        }
    }

    /// Hand a request to rmcp under a local id and wait for its reply
    async fn forward(&self, id: Value, method: &str, mut body: Map<String, Value>) -> Value {
        if let Err(error) = check_params(method, &body) {
            return error_reply(id, error);
        }
        let Some(inbox) = self.inbox() else {
            return error_reply(id, internal_error("session closed"));
        };

        let local = self.next_id.fetch_add(1, Ordering::SeqCst);
        body.insert("id".to_string(), json!(local));
        body.insert("jsonrpc".to_string(), json!(JSONRPC_VERSION));
        let message: ClientJsonRpcMessage = match serde_json::from_value(Value::Object(body)) {
            Ok(message) => message,
            Err(e) => return error_reply(id, invalid_params(e.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(local, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: local,
        };

        if inbox.send(message).is_err() {
            return error_reply(id, internal_error("session closed"));
        }
        match rx.await {
            Ok(mut reply) => {
                reply["id"] = id;
                reply
            }
            Err(_) => error_reply(id, internal_error("session closed")),
        }
    }

    fn forward_notification(&self, method: &str, mut body: Map<String, Value>) {
        if method == methods::INITIALIZED {
            tracing::debug!("Client confirmed initialization");
            return;
        }
        let Some(inbox) = self.inbox() else {
            tracing::debug!("Ignoring notification '{}' before initialize", method);
            return;
        };

        body.insert("jsonrpc".to_string(), json!(JSONRPC_VERSION));
        match serde_json::from_value::<ClientJsonRpcMessage>(Value::Object(body)) {
            Ok(notification) => {
                let _ = inbox.send(notification);
            }
            Err(e) => tracing::debug!("Ignoring notification '{}': {}", method, e),
        }
    }

    /// Push `notifications/tools/list_changed`; false before the handshake
    pub async fn notify_tools_changed(&self) -> bool {
        let peer = lock(&self.link)
            .as_ref()
            .and_then(|link| link.service.as_ref())
            .map(|service| service.peer().clone());
        let Some(peer) = peer else {
            return false;
        };
        match peer.notify_tool_list_changed().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("tools/list_changed not delivered: {}", e);
                false
            }
        }
    }

    /// End the rmcp session; requests still waiting get an error reply
    pub fn shutdown(&self) {
        lock(&self.link).take();
        lock(&self.pending).clear();
    }
}

/// Params of the methods the gateway answers must decode, or the request
/// is rejected before it reaches the handler
fn check_params(method: &str, body: &Map<String, Value>) -> std::result::Result<(), McpError> {
    let params = body.get("params").cloned().unwrap_or(Value::Null);
    let checked = match method {
        methods::INITIALIZE => serde_json::from_value::<InitializeRequestParam>(params).map(drop),
        methods::TOOLS_CALL => serde_json::from_value::<CallToolRequestParam>(params).map(drop),
        _ => Ok(()),
    };
    checked.map_err(|e| invalid_params(format!("invalid {} params: {}", method, e)))
}

fn initialized_notification() -> serde_json::Result<ClientJsonRpcMessage> {
    serde_json::from_value(json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": methods::INITIALIZED,
    }))
}

/// One inbound element, sorted before anything is decoded into rmcp types
enum Incoming {
    Request {
        id: Value,
        method: String,
        body: Map<String, Value>,
    },
    Notification {
        method: String,
        body: Map<String, Value>,
    },
    Reply,
}

impl Incoming {
    /// Sort one element; the error carries the id to answer with
    fn classify(message: Value) -> std::result::Result<Self, (Value, String)> {
        let Value::Object(body) = message else {
            return Err((Value::Null, "message must be an object".to_string()));
        };

        let id = body.get("id").cloned();
        let reply_id = id.clone().filter(is_valid_id).unwrap_or(Value::Null);
        if body.get("jsonrpc").is_some_and(|v| v != JSONRPC_VERSION) {
            return Err((reply_id, "jsonrpc must be \"2.0\"".to_string()));
        }

        match body.get("method") {
            Some(Value::String(method)) => {
                let method = method.clone();
                match id {
                    None => Ok(Incoming::Notification { method, body }),
                    Some(id) if is_valid_id(&id) => Ok(Incoming::Request { id, method, body }),
                    Some(_) => Err((Value::Null, "id must be a string or a number".to_string())),
                }
            }
            Some(_) => Err((reply_id, "method must be a string".to_string())),
            None if body.contains_key("result") || body.contains_key("error") => Ok(Incoming::Reply),
            None => Err((reply_id, "missing method".to_string())),
        }
    }
}

fn is_valid_id(id: &Value) -> bool {
    id.is_string() || id.is_number()
}

struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

/// Route rmcp's output: replies to waiting requests, the rest to the client
async fn pump(
    mut replies: mpsc::UnboundedReceiver<ServerJsonRpcMessage>,
    pending: Pending,
    outbound: OutboundSlot,
) {
    while let Some(message) = replies.recv().await {
        let value = match serde_json::to_value(&message) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("dropping unserializable server message: {}", e);
                continue;
            }
        };

        let waiting = match (value.get("method"), value.get("id").and_then(Value::as_u64)) {
            (None, Some(id)) => lock(&pending).remove(&id),
            _ => None,
        };
        match waiting {
            Some(tx) => {
                let _ = tx.send(value);
            }
            None => match lock(&outbound).as_ref() {
                Some(tx) => {
                    let _ = tx.send(value);
                }
                None => tracing::debug!("dropping server message for a closed session"),
            },
        }
    }
}

/// rmcp transport between the engine and the session's server
struct SessionLink {
    inbox: mpsc::UnboundedReceiver<ClientJsonRpcMessage>,
    outbound: mpsc::UnboundedSender<ServerJsonRpcMessage>,
}

impl rmcp::transport::Transport<RoleServer> for SessionLink {
    type Error = GatewayError;

    fn send(
        &mut self,
        item: ServerJsonRpcMessage,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let sent = self
            .outbound
            .send(item)
            .map_err(|_| GatewayError::TransportClosed("session closed".to_string()));
        std::future::ready(sent)
    }

    fn receive(&mut self) -> impl Future<Output = Option<ClientJsonRpcMessage>> + Send {
        self.inbox.recv()
    }

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send {
        self.inbox.close();
        std::future::ready(Ok(()))
    }
}
