//! Gateway error taxonomy

use thiserror::Error;

use crate::container::ContainerError;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Spawn, connect or container-create failure for one backend
    #[error("failed to start transport: {0}")]
    TransportStart(String),

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Non-zero exit of a per-call process
    #[error("process failed with code {code}: {stderr}")]
    ProcessFailed { code: i32, stderr: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Error returned by the backend itself
    #[error("backend error {code}: {message}")]
    BackendCall {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Malformed output from a one-shot or container backend
    #[error("failed to parse backend output: {0}")]
    Parse(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Message for an event stream that is not open
    #[error("Session not found")]
    SessionNotFound,

    #[error("Bad Request: {0}")]
    BadSessionRequest(String),

    /// A push stream is already open for the session
    #[error("Conflict: {0}")]
    StreamConflict(String),

    #[error("pool is already connected")]
    AlreadyConnected,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// True for errors raised before any backend was contacted.
    pub fn is_tool_not_found(&self) -> bool {
        matches!(self, GatewayError::ToolNotFound(_))
    }
}

impl From<GatewayError> for rmcp::ErrorData {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::BackendCall {
                code,
                message,
                data,
            } => rmcp::ErrorData::new(rmcp::model::ErrorCode(code), message, data),
            GatewayError::ToolNotFound(_) | GatewayError::InvalidParams(_) => {
                mcp_common::invalid_params(err.to_string())
            }
            GatewayError::SessionNotFound => mcp_common::session_not_found(err.to_string()),
            GatewayError::BadSessionRequest(_) => mcp_common::bad_request(err.to_string()),
            other => mcp_common::internal_error(other.to_string()),
        }
    }
}

impl From<rmcp::service::ServiceError> for GatewayError {
    fn from(err: rmcp::service::ServiceError) -> Self {
        match err {
            rmcp::service::ServiceError::McpError(error) => GatewayError::BackendCall {
                code: error.code.0,
                message: error.message.into_owned(),
                data: error.data,
            },
            other => GatewayError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_code_is_preserved() {
        let err: rmcp::ErrorData = GatewayError::BackendCall {
            code: -32099,
            message: "quota exceeded".into(),
            data: Some(serde_json::json!({"retry": 5})),
        }
        .into();
        assert_eq!(err.code.0, -32099);
        assert_eq!(err.message, "quota exceeded");
        assert!(err.data.is_some());
    }

    #[test]
    fn test_unknown_tool_is_invalid_params() {
        let err: rmcp::ErrorData = GatewayError::ToolNotFound("nope".into()).into();
        assert_eq!(err.code.0, -32602);
        assert!(err.message.contains("Tool not found: nope"));
    }

    #[test]
    fn test_bad_session_request_message() {
        let err: rmcp::ErrorData =
            GatewayError::BadSessionRequest("No valid session ID provided".into()).into();
        assert_eq!(err.code.0, -32000);
        assert_eq!(err.message, "Bad Request: No valid session ID provided");
    }

    #[test]
    fn test_session_not_found_code() {
        let err: rmcp::ErrorData = GatewayError::SessionNotFound.into();
        assert_eq!(err.code.0, -32001);
        assert_eq!(err.message, "Session not found");
    }

    #[test]
    fn test_service_error_keeps_backend_code() {
        let service = rmcp::service::ServiceError::McpError(rmcp::ErrorData::new(
            rmcp::model::ErrorCode(-32050),
            "quota exceeded",
            None,
        ));
        match GatewayError::from(service) {
            GatewayError::BackendCall { code, message, .. } => {
                assert_eq!(code, -32050);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_other_errors_are_internal() {
        let err: rmcp::ErrorData = GatewayError::Timeout(50).into();
        assert_eq!(err.code.0, -32603);
    }
}
