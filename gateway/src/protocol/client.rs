//! Backend-facing protocol client
//!
//! An rmcp client session over any gateway [`Transport`]. [`BackendLink`]
//! adapts the callback-style transport to rmcp's pull-based one; rmcp does
//! the handshake, request correlation and pagination.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use rmcp::model::{ClientInfo, Implementation};
use rmcp::service::RunningService;
use rmcp::{ClientHandler, RoleClient, ServiceExt};
use tokio::sync::mpsc;

use super::{
    CallToolRequestParam, CallToolResult, ClientJsonRpcMessage, JsonObject, ServerJsonRpcMessage,
    Tool, CLIENT_NAME,
};
use crate::error::{GatewayError, Result};
use crate::transport::Transport;

/// Sender half of a link's inbox; taking it ends the rmcp session
type InboxSlot = Arc<Mutex<Option<mpsc::UnboundedSender<ServerJsonRpcMessage>>>>;

fn close_inbox(slot: &InboxSlot) {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take();
}

/// rmcp transport over a started gateway transport
pub struct BackendLink {
    transport: Arc<dyn Transport>,
    inbox: mpsc::UnboundedReceiver<ServerJsonRpcMessage>,
}

impl BackendLink {
    /// Wire handlers onto `transport` without starting it
    fn attach(backend_id: &str, transport: Arc<dyn Transport>) -> (Self, InboxSlot) {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot: InboxSlot = Arc::new(Mutex::new(Some(tx)));

        let messages = slot.clone();
        transport.on_message(Arc::new(move |message: ServerJsonRpcMessage| {
            if let Some(tx) = messages.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                let _ = tx.send(message);
            }
        }));

        let failed = slot.clone();
        let backend = backend_id.to_string();
        transport.on_error(Arc::new(move |error: GatewayError| {
            tracing::warn!(backend = %backend, "transport failed: {}", error);
            // rmcp fails whatever is still pending once the inbox ends
            close_inbox(&failed);
        }));

        let link = Self {
            transport,
            inbox: rx,
        };
        (link, slot)
    }
}

impl rmcp::transport::Transport<RoleClient> for BackendLink {
    type Error = GatewayError;

    fn send(
        &mut self,
        item: ClientJsonRpcMessage,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let transport = self.transport.clone();
        async move { transport.send(item).await }
    }

    fn receive(&mut self) -> impl Future<Output = Option<ServerJsonRpcMessage>> + Send {
        self.inbox.recv()
    }

    /// The gateway transport is closed by [`BackendClient::close`], exactly once
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send {
        self.inbox.close();
        std::future::ready(Ok(()))
    }
}

/// Client identity presented to backends
#[derive(Debug, Clone, Default)]
pub struct GatewayClient;

impl ClientHandler for GatewayClient {
    fn get_info(&self) -> ClientInfo {
        let mut client_info = Implementation::from_build_env();
        client_info.name = CLIENT_NAME.into();
        client_info.version = env!("CARGO_PKG_VERSION").into();
        ClientInfo {
            client_info,
            ..Default::default()
        }
    }
}

/// One initialized backend session
pub struct BackendClient {
    backend_id: String,
    transport: Arc<dyn Transport>,
    inbox: InboxSlot,
    service: RunningService<RoleClient, GatewayClient>,
}

impl BackendClient {
    /// Start the transport and perform the initialize handshake
    pub async fn connect(backend_id: &str, transport: Arc<dyn Transport>) -> Result<Self> {
        let (link, inbox) = BackendLink::attach(backend_id, transport.clone());
        transport.start().await?;

        let service = GatewayClient.serve(link).await.map_err(|e| {
            GatewayError::TransportStart(format!("handshake with '{}' failed: {}", backend_id, e))
        })?;
        tracing::debug!(backend = %backend_id, kind = transport.kind(), "handshake complete");

        Ok(Self {
            backend_id: backend_id.to_string(),
            transport,
            inbox,
            service,
        })
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// All tools, following pagination
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        Ok(self.service.list_all_tools().await?)
    }

    /// Call a tool; the result is returned as the backend sent it
    pub async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
        let request = CallToolRequestParam {
            name: name.to_string().into(),
            arguments,
            task: None,
        };
        Ok(self.service.call_tool(request).await?)
    }

    /// End the session and close the transport
    pub async fn close(&self) -> Result<()> {
        close_inbox(&self.inbox);
        self.transport.close().await
    }
}
