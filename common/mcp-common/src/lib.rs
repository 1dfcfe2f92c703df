//! MCP Common - Shared utilities for the gateway
//!
//! - **Initialization**: [`init_tracing`] and [`init_tracing_with_level`],
//!   always writing to stderr
//! - **Errors**: the JSON-RPC error codes the gateway hands to outward
//!   clients, plus constructors for each of them

pub mod error;
pub mod init;

pub use error::{
    bad_request, internal_error, invalid_params, invalid_request, method_not_found,
    not_initialized, parse_error, session_not_found, McpResult,
};
pub use init::{init_tracing, init_tracing_with_level};

pub use rmcp::{model::ErrorCode, ErrorData as McpError};
