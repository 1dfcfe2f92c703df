//! Outward MCP server handler
//!
//! The rmcp [`ServerHandler`] every client session is served by. Tool
//! listing and calls go straight to the [`ToolRouter`]; the handshake
//! echoes the client's protocol version and advertises list-change
//! notifications.

use std::sync::Arc;

use mcp_common::McpError;
use rmcp::model::{
    Implementation, InitializeRequestParam, InitializeResult, ListToolsResult,
    PaginatedRequestParam, ServerCapabilities, ServerInfo,
};
use rmcp::service::RequestContext;
use rmcp::{RoleServer, ServerHandler};
use serde_json::Value;

use super::{CallToolRequestParam, CallToolResult};
use crate::pool::ToolRouter;

const INSTRUCTIONS: &str = "Aggregates the tools of several backend servers behind one endpoint.";

#[derive(Clone)]
pub struct GatewayServer {
    router: Arc<dyn ToolRouter>,
    name: String,
}

impl GatewayServer {
    pub fn new(router: Arc<dyn ToolRouter>, name: impl Into<String>) -> Self {
        Self {
            router,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        let mut server_info = Implementation::from_build_env();
        server_info.name = self.name.clone().into();
        server_info.version = env!("CARGO_PKG_VERSION").into();
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info,
            ..Default::default()
        }
    }

    async fn initialize(
        &self,
        request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        tracing::info!(
            "Client initialized: {} {}",
            request.client_info.name,
            request.client_info.version
        );
        Ok(InitializeResult {
            protocol_version: request.protocol_version,
            ..self.get_info()
        })
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let mut tools = self.router.get_tools().await;
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ListToolsResult {
            tools,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = Value::Object(request.arguments.unwrap_or_default());
        self.router
            .execute_tool(&request.name, arguments)
            .await
            .map_err(McpError::from)
    }
}
