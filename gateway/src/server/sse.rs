//! Event-stream exposure
//!
//! `GET <path>` opens a stream and creates a session bound to it. The first
//! event names the endpoint the client posts to; replies come back on the
//! stream as `message` events. Closing the stream removes the session.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use super::{parse_error, with_layers, KEEP_ALIVE_INTERVAL};
use crate::session::{PushStream, SessionGuard, SessionManager};

#[derive(Clone)]
struct SseState {
    sessions: Arc<SessionManager>,
    messages_path: String,
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

pub fn router(sessions: Arc<SessionManager>, path: &str, messages_path: &str) -> Router {
    let state = SseState {
        sessions,
        messages_path: messages_path.to_string(),
    };
    let routes = Router::new()
        .route(path, get(open_stream))
        .route(messages_path, post(post_message))
        .with_state(state);
    with_layers(routes)
}

async fn open_stream(
    State(state): State<SseState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let session = state.sessions.create_session();
    let guard = SessionGuard::new(state.sessions.clone(), session.id());
    let endpoint = format!("{}?sessionId={}", state.messages_path, session.id());
    tracing::info!("Event stream opened for session {}", session.id());

    // A fresh session always has its inbox.
    let push = session.attach_stream();

    let first = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let rest = stream::unfold((push, guard), |(push, guard)| async move {
        let mut push: PushStream = push?;
        let message = push.recv().await?;
        let event = Event::default().event("message").data(message.to_string());
        Some((Ok::<_, Infallible>(event), (Some(push), guard)))
    });

    Sse::new(first.chain(rest)).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

async fn post_message(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing sessionId parameter").into_response();
    };
    let session = match state.sessions.find(&session_id) {
        Ok(session) => session,
        Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };

    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            session.push(parse_error(&e.to_string()));
            return (StatusCode::BAD_REQUEST, "Invalid message").into_response();
        }
    };

    tokio::spawn(async move {
        if let Some(reply) = session.engine().handle_value(body).await {
            if !session.push(reply) {
                tracing::debug!("Session {} closed before reply", session.id());
            }
        }
    });

    (StatusCode::ACCEPTED, "Accepted").into_response()
}
