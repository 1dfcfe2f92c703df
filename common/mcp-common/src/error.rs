//! Protocol error helpers
//!
//! Fixed JSON-RPC error codes used on outward-facing errors, and a
//! constructor for each error the gateway produces itself.

use rmcp::model::ErrorCode;
use rmcp::ErrorData as McpError;

/// Type alias for results that surface as protocol errors
pub type McpResult<T> = Result<T, McpError>;

/// Missing or unrecognized session id on a session-scoped endpoint
pub const BAD_REQUEST: ErrorCode = ErrorCode(-32000);
/// Message submitted for a stream that does not exist
pub const SESSION_NOT_FOUND: ErrorCode = ErrorCode(-32001);
/// Request received before the initialize exchange completed
pub const NOT_INITIALIZED: ErrorCode = ErrorCode(-32002);

pub fn internal_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

pub fn invalid_params(message: impl Into<String>) -> McpError {
    McpError::invalid_params(message.into(), None)
}

pub fn method_not_found(method: &str) -> McpError {
    McpError::new(
        ErrorCode::METHOD_NOT_FOUND,
        format!("Method not found: {}", method),
        None,
    )
}

/// Element of a body that is JSON but not a JSON-RPC message
pub fn invalid_request(detail: impl std::fmt::Display) -> McpError {
    McpError::new(
        ErrorCode::INVALID_REQUEST,
        format!("Invalid Request: {}", detail),
        None,
    )
}

/// Body that could not be decoded as JSON-RPC
pub fn parse_error(detail: impl std::fmt::Display) -> McpError {
    McpError::new(ErrorCode::PARSE_ERROR, format!("Parse error: {}", detail), None)
}

pub fn bad_request(message: impl Into<String>) -> McpError {
    McpError::new(BAD_REQUEST, message.into(), None)
}

pub fn session_not_found(message: impl Into<String>) -> McpError {
    McpError::new(SESSION_NOT_FOUND, message.into(), None)
}

pub fn not_initialized() -> McpError {
    McpError::new(NOT_INITIALIZED, "Server not initialized", None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_keeps_detail() {
        let decode = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = parse_error(&decode);
        assert_eq!(err.code, ErrorCode::PARSE_ERROR);
        assert!(err.message.starts_with("Parse error: "));
    }

    #[test]
    fn test_fixed_session_codes() {
        assert_eq!(bad_request("x").code.0, -32000);
        assert_eq!(session_not_found("x").code.0, -32001);
        assert_eq!(not_initialized().code.0, -32002);
        assert_eq!(method_not_found("nope").code, ErrorCode::METHOD_NOT_FOUND);
        assert_eq!(invalid_request("batch element").code.0, -32600);
    }
}
