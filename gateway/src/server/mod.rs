//! Outward exposures
//!
//! The gateway answers clients over one of three transports, all backed by
//! the same [`SessionManager`]:
//! - stdio: newline-delimited JSON-RPC on stdin/stdout, one session
//! - streaming HTTP: `POST`/`GET`/`DELETE` on a single path ([`http`])
//! - event-stream: `GET /sse` plus `POST /messages` ([`sse`])

pub mod http;
pub mod sse;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ExposureConfig;
use crate::protocol::error_reply;
use crate::session::SessionManager;

/// Interval between keep-alive comments on event streams
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Serve on the configured exposure until `shutdown` resolves
pub async fn serve(
    exposure: &ExposureConfig,
    sessions: Arc<SessionManager>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let outcome = match exposure {
        ExposureConfig::Stdio => {
            tracing::info!("Serving on stdio");
            let stdin = BufReader::new(tokio::io::stdin());
            serve_lines(sessions.clone(), stdin, tokio::io::stdout(), shutdown).await
        }
        ExposureConfig::StreamableHttp { host, port, path } => {
            let app = http::router(sessions.clone(), path);
            bind_and_serve(host, *port, app, shutdown, "streaming HTTP").await
        }
        ExposureConfig::Sse {
            host,
            port,
            path,
            messages_path,
        } => {
            let app = sse::router(sessions.clone(), path, messages_path);
            bind_and_serve(host, *port, app, shutdown, "event-stream").await
        }
    };

    sessions.close_all();
    outcome
}

async fn bind_and_serve(
    host: &str,
    port: u16,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
    label: &str,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Serving {} on http://{}", label, addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

// ============================================================================
// stdio
// ============================================================================

/// Line-delimited JSON-RPC over any reader/writer pair.
///
/// Requests are answered in arrival order; server pushes (such as
/// `tools/list_changed`) are interleaved between replies. Returns on EOF
/// or when `shutdown` resolves.
pub async fn serve_lines<R, W>(
    sessions: Arc<SessionManager>,
    reader: R,
    mut writer: W,
    shutdown: impl Future<Output = ()>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let session = sessions.create_session();
    let mut pushes = session
        .attach_stream()
        .context("stdio session already has a stream")?;
    let mut lines = reader.lines();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    tracing::info!("stdin closed");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let reply = match serde_json::from_str::<Value>(line) {
                    Ok(body) => session.engine().handle_value(body).await,
                    Err(e) => Some(parse_error(&e.to_string())),
                };
                if let Some(reply) = reply {
                    write_line(&mut writer, &reply).await?;
                }
            }
            Some(pushed) = pushes.recv() => {
                write_line(&mut writer, &pushed).await?;
            }
            _ = &mut shutdown => break,
        }
    }

    drop(pushes);
    sessions.remove(session.id());
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await.context("Failed to write stdout")?;
    writer.flush().await.context("Failed to flush stdout")?;
    Ok(())
}

// ============================================================================
// Shared HTTP pieces
// ============================================================================

pub(crate) fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
}

pub(crate) fn with_layers(router: Router) -> Router {
    router
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors())
}

async fn not_found(uri: Uri) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not Found",
            "message": format!("The requested URL {} was not found on this server", uri),
            "status": 404,
        })),
    )
        .into_response()
}

pub(crate) fn parse_error(detail: &str) -> Value {
    error_reply(Value::Null, mcp_common::parse_error(detail))
}
