//! Gateway that aggregates the tools of many MCP backends behind one endpoint

pub mod config;
pub mod container;
pub mod error;
pub mod handlers;
pub mod pool;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{GatewayError, Result};
pub use pool::{BackendPool, ConnectReport, PoolOptions, ToolRouter};
pub use session::SessionManager;
