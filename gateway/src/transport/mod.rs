//! Backend transports
//!
//! One capability interface, one implementation per connection kind:
//!
//! ```text
//!   ConnectionSpec ──► TransportFactory::create ──► Arc<dyn Transport>
//!
//!   process               one process per send, message as trailing arg
//!   process-rpc           long-lived process, newline-delimited JSON
//!   http                  POST per message + GET push stream
//!   socket                WebSocket, one text frame per message
//!   container             one container per send
//!   container-persistent  one container, `exec` per send
//! ```
//!
//! Responses and server-initiated messages arrive through the message
//! handler. Stream failures arrive through the error handler; request/response
//! transports report failures from `send` itself.

pub mod container;
pub mod http;
pub mod oneshot;
pub mod process;
pub mod socket;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ConnectionSpec;
use crate::error::{GatewayError, Result};
use crate::protocol::{
    result_reply, ClientJsonRpcMessage, RequestId, ServerJsonRpcMessage, JSONRPC_VERSION,
};

pub use container::{ContainerTransport, PersistentContainerTransport};
pub use http::HttpTransport;
pub use oneshot::OneShotProcessTransport;
pub use process::PersistentProcessTransport;
pub use socket::SocketTransport;

pub type MessageHandler = Arc<dyn Fn(ServerJsonRpcMessage) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(GatewayError) + Send + Sync>;

/// A started transport carries messages to and from one peer.
///
/// Lifecycle: created → `start` → `send`* → `close`. `close` is idempotent
/// and always releases the underlying process, socket or container.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection kind, for logging
    fn kind(&self) -> &'static str;

    /// Register the handler for inbound messages. Replaces any previous one.
    fn on_message(&self, handler: MessageHandler);

    /// Register the handler for stream failures. Replaces any previous one.
    fn on_error(&self, handler: ErrorHandler);

    async fn start(&self) -> Result<()>;

    async fn send(&self, message: ClientJsonRpcMessage) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds transports from connection specs
pub trait TransportFactory: Send + Sync {
    fn create(&self, backend_id: &str, spec: &ConnectionSpec) -> Result<Arc<dyn Transport>>;
}

/// Factory for the six built-in connection kinds
#[derive(Debug, Clone, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, backend_id: &str, spec: &ConnectionSpec) -> Result<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match spec {
            ConnectionSpec::Process(spec) => {
                Arc::new(OneShotProcessTransport::new(backend_id, spec.clone()))
            }
            ConnectionSpec::ProcessRpc(spec) => {
                Arc::new(PersistentProcessTransport::new(backend_id, spec.clone()))
            }
            ConnectionSpec::Http(spec) => Arc::new(HttpTransport::new(backend_id, spec.clone())?),
            ConnectionSpec::Socket(spec) => Arc::new(SocketTransport::new(backend_id, spec.clone())),
            ConnectionSpec::Container(spec) => {
                Arc::new(ContainerTransport::new(backend_id, spec.clone()))
            }
            ConnectionSpec::ContainerPersistent(spec) => {
                Arc::new(PersistentContainerTransport::new(backend_id, spec.clone()))
            }
        };
        Ok(transport)
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Message and error handler slots shared between a transport and its tasks
#[derive(Clone, Default)]
pub struct Handlers {
    message: Arc<Mutex<Option<MessageHandler>>>,
    error: Arc<Mutex<Option<ErrorHandler>>>,
}

impl Handlers {
    pub fn set_message(&self, handler: MessageHandler) {
        *self.message.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn set_error(&self, handler: ErrorHandler) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn dispatch(&self, message: ServerJsonRpcMessage) {
        let handler = self
            .message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(message),
            None => tracing::debug!("dropping message with no handler registered"),
        }
    }

    pub fn fail(&self, error: GatewayError) {
        let handler = self
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(error),
            None => tracing::warn!("transport error with no handler registered: {}", error),
        }
    }
}

/// Turn the output of a per-call backend into the reply for `id`.
///
/// JSON-RPC replies have their id rewritten; an object carrying only
/// `result` or `error` is taken as the reply; any other JSON value becomes
/// the result.
pub fn correlate_output(id: &RequestId, output: &str) -> Result<ServerJsonRpcMessage> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::Parse("empty output".to_string()));
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| GatewayError::Parse(format!("{}: {}", e, trimmed)))?;
    let id = serde_json::to_value(id)?;

    let reply = match value {
        Value::Object(mut map)
            if !map.contains_key("method")
                && (map.contains_key("result") || map.contains_key("error")) =>
        {
            map.insert("id".to_string(), id);
            map.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
            Value::Object(map)
        }
        other => result_reply(id, other),
    };

    serde_json::from_value(reply).map_err(|e| GatewayError::Parse(format!("{}: {}", e, trimmed)))
}

/// Split a command line into program and leading arguments
pub(crate) fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(String::from);
    let program = parts.next()?;
    Some((program, parts.collect()))
}
