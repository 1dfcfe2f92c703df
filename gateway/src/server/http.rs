//! Streaming HTTP exposure
//!
//! One path, three methods:
//! - `POST` carries client messages; the session id travels in the
//!   `mcp-session-id` header and is assigned on initialize
//! - `GET` opens the session's server-to-client event stream
//! - `DELETE` ends the session

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Json, Router,
};
use futures_util::stream::{self, Stream};
use mcp_common::McpError;
use serde_json::Value;

use super::{parse_error, with_layers, KEEP_ALIVE_INTERVAL};
use crate::error::GatewayError;
use crate::protocol::error_reply;
use crate::session::{PushStream, SessionManager};
use crate::transport::http::SESSION_HEADER;

pub fn router(sessions: Arc<SessionManager>, path: &str) -> Router {
    let routes = Router::new()
        .route(path, post(handle_post).get(handle_get).delete(handle_delete))
        .with_state(sessions);
    with_layers(routes)
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

async fn handle_post(
    State(sessions): State<Arc<SessionManager>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(parse_error(&e.to_string()))).into_response(),
    };

    match sessions.handle_post(session_id(&headers), body).await {
        Ok(outcome) => {
            let mut response = match outcome.reply {
                Some(reply) => Json(reply).into_response(),
                None => StatusCode::ACCEPTED.into_response(),
            };
            if let Ok(value) = HeaderValue::from_str(&outcome.session_id) {
                response.headers_mut().insert(SESSION_HEADER, value);
            }
            response
        }
        Err(e) => error_response(e),
    }
}

async fn handle_get(State(sessions): State<Arc<SessionManager>>, headers: HeaderMap) -> Response {
    match sessions.open_stream(session_id(&headers)) {
        Ok(push) => {
            tracing::debug!("Push stream opened for session {}", push.session_id());
            event_stream(push).into_response()
        }
        Err(e) => session_error_response(e),
    }
}

async fn handle_delete(State(sessions): State<Arc<SessionManager>>, headers: HeaderMap) -> Response {
    match sessions.terminate(session_id(&headers)) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => session_error_response(e),
    }
}

fn event_stream(push: PushStream) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let events = stream::unfold(push, |mut push| async move {
        let message = push.recv().await?;
        let event = Event::default().event("message").data(message.to_string());
        Some((Ok::<_, Infallible>(event), push))
    });
    Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

/// JSON-RPC error body for POST failures
fn error_response(err: GatewayError) -> Response {
    let status = match &err {
        GatewayError::BadSessionRequest(_) => StatusCode::BAD_REQUEST,
        GatewayError::StreamConflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = error_reply(Value::Null, McpError::from(err));
    (status, Json(body)).into_response()
}

/// Plain-text errors for GET and DELETE
fn session_error_response(err: GatewayError) -> Response {
    match err {
        GatewayError::BadSessionRequest(_) => {
            (StatusCode::BAD_REQUEST, "Invalid or missing session ID").into_response()
        }
        GatewayError::StreamConflict(message) => (StatusCode::CONFLICT, message).into_response(),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}
