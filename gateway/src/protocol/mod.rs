//! MCP wire model shared by backend clients and outward engines
//!
//! Messages and payloads are the `rmcp` model types: backend transports carry
//! [`ClientJsonRpcMessage`] out and [`ServerJsonRpcMessage`] in. The helpers
//! here cover what the gateway's own framings need on top of that: the id of
//! an outgoing request, lenient decoding of replies, and error envelopes.

pub mod client;
pub mod engine;
pub mod handler;

use serde_json::{json, Value};

pub use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientJsonRpcMessage, JsonObject, JsonRpcMessage,
    RequestId, ServerJsonRpcMessage, Tool,
};

pub use client::{BackendClient, GatewayClient};
pub use engine::{EngineState, OutboundSlot, ProtocolEngine};
pub use handler::GatewayServer;

pub const JSONRPC_VERSION: &str = "2.0";
pub const CLIENT_NAME: &str = "mcp-gateway";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

    /// Methods the gateway answers itself
    pub fn is_known(method: &str) -> bool {
        matches!(method, INITIALIZE | PING | TOOLS_LIST | TOOLS_CALL)
    }
}

/// Id of an outgoing request; `None` for notifications and replies
pub fn request_id(message: &ClientJsonRpcMessage) -> Option<RequestId> {
    match message {
        JsonRpcMessage::Request(request) => Some(request.id.clone()),
        _ => None,
    }
}

/// Decode one inbound message, tolerating a missing `jsonrpc` member
pub fn decode_server_message(mut value: Value) -> serde_json::Result<ServerJsonRpcMessage> {
    if let Value::Object(map) = &mut value {
        map.entry("jsonrpc")
            .or_insert_with(|| Value::String(JSONRPC_VERSION.to_string()));
    }
    serde_json::from_value(value)
}

/// Decode a body holding one message or a batch.
///
/// Batch elements are decoded one by one so a bad element never hides the
/// good ones next to it.
pub fn decode_server_batch(value: Value) -> Vec<serde_json::Result<ServerJsonRpcMessage>> {
    match value {
        Value::Array(items) => items.into_iter().map(decode_server_message).collect(),
        single => vec![decode_server_message(single)],
    }
}

/// Error reply envelope; `id` is `null` when the request id is unknown
pub fn error_reply(id: Value, error: rmcp::ErrorData) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error,
    })
}

pub fn result_reply(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}
