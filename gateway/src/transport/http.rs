//! Streaming HTTP backend transport
//!
//! Each message is POSTed; replies come back as a JSON body or as an event
//! stream. Once the server assigns a session, a GET stream carries
//! server-pushed messages and is re-opened with backoff when it drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{ErrorHandler, Handlers, MessageHandler, Transport};
use crate::config::{HttpSpec, RetryPolicy};
use crate::error::{GatewayError, Result};
use crate::protocol::{decode_server_batch, ClientJsonRpcMessage};

pub const SESSION_HEADER: &str = "mcp-session-id";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

// ============================================================================
// Event-stream decoding
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder, fed arbitrary byte chunks
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(SseEvent {
                        event: self.event.take(),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                } else {
                    self.event = None;
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "data" => self.data.push(value.to_string()),
                "event" => self.event = Some(value.to_string()),
                _ => {}
            }
        }

        events
    }
}

fn dispatch_event(handlers: &Handlers, backend: &str, event: SseEvent) {
    if !matches!(event.event.as_deref(), None | Some("message")) {
        return;
    }
    let value = match serde_json::from_str(&event.data) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(backend = %backend, "ignoring malformed event: {}", e);
            return;
        }
    };
    for decoded in decode_server_batch(value) {
        match decoded {
            Ok(message) => handlers.dispatch(message),
            Err(e) => tracing::warn!(backend = %backend, "ignoring invalid message: {}", e),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct HttpTransport {
    backend_id: String,
    spec: HttpSpec,
    client: reqwest::Client,
    headers: HeaderMap,
    handlers: Handlers,
    session_id: Arc<RwLock<Option<String>>>,
    push_task: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl HttpTransport {
    pub fn new(backend_id: &str, spec: HttpSpec) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &spec.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| GatewayError::Config(format!("invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| GatewayError::Config(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::TransportStart(format!("HTTP client: {}", e)))?;

        Ok(Self {
            backend_id: backend_id.to_string(),
            spec,
            client,
            headers,
            handlers: Handlers::default(),
            session_id: Arc::new(RwLock::new(None)),
            push_task: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn post_once(&self, body: &str) -> std::result::Result<Response, reqwest::Error> {
        let mut request = self
            .client
            .post(&self.spec.url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, ACCEPT_BOTH)
            .body(body.to_string());
        if let Some(session) = self.session_id.read().await.as_ref() {
            request = request.header(SESSION_HEADER, session);
        }
        if let Some(timeout) = self.spec.timeout_ms {
            request = request.timeout(Duration::from_millis(timeout));
        }
        request.send().await
    }

    /// POST, retrying connection failures under the configured policy
    async fn post(&self, body: &str) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            match self.post_once(body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() => {
                    return Err(GatewayError::Timeout(self.spec.timeout_ms.unwrap_or_default()))
                }
                Err(e) if e.is_connect() => match &self.spec.retry {
                    Some(policy) if attempt < policy.attempts => {
                        let delay = policy.delay_for(attempt);
                        tracing::debug!(
                            backend = %self.backend_id,
                            "connect failed, retrying in {:?}: {}",
                            delay,
                            e
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    _ => return Err(GatewayError::Transport(e.to_string())),
                },
                Err(e) => return Err(GatewayError::Transport(e.to_string())),
            }
        }
    }

    async fn remember_session(&self, session: Option<String>) {
        let Some(session) = session else {
            return;
        };

        let is_new = {
            let mut current = self.session_id.write().await;
            let is_new = current.as_deref() != Some(session.as_str());
            *current = Some(session);
            is_new
        };

        if is_new {
            self.spawn_push_stream().await;
        }
    }

    async fn spawn_push_stream(&self) {
        let task = tokio::spawn(push_stream_loop(PushStream {
            backend_id: self.backend_id.clone(),
            url: self.spec.url.clone(),
            client: self.client.clone(),
            headers: self.headers.clone(),
            session_id: self.session_id.clone(),
            retry: self.spec.retry.clone(),
            handlers: self.handlers.clone(),
            closed: self.closed.clone(),
        }));

        if let Some(previous) = self.push_task.lock().await.replace(task) {
            previous.abort();
        }
    }
}

struct PushStream {
    backend_id: String,
    url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    session_id: Arc<RwLock<Option<String>>>,
    retry: Option<RetryPolicy>,
    handlers: Handlers,
    closed: Arc<AtomicBool>,
}

enum PushEnd {
    /// Server does not offer a push stream
    Unsupported,
    /// `opened` is set when the server accepted the stream before it ended
    Dropped { reason: String, opened: bool },
}

impl PushEnd {
    fn dropped(reason: impl Into<String>, opened: bool) -> Self {
        PushEnd::Dropped {
            reason: reason.into(),
            opened,
        }
    }
}

impl PushStream {
    async fn run_once(&self) -> PushEnd {
        let mut request = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(session) = self.session_id.read().await.as_ref() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return PushEnd::dropped(e.to_string(), false),
        };

        match response.status() {
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_FOUND => return PushEnd::Unsupported,
            status if !status.is_success() => {
                return PushEnd::dropped(format!("HTTP {}", status), false)
            }
            _ => {}
        }

        let mut decoder = SseDecoder::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.feed(&bytes) {
                        dispatch_event(&self.handlers, &self.backend_id, event);
                    }
                }
                Err(e) => return PushEnd::dropped(e.to_string(), true),
            }
        }
        PushEnd::dropped("stream ended", true)
    }
}

async fn push_stream_loop(stream: PushStream) {
    let mut failures = 0u32;
    loop {
        let end = stream.run_once().await;
        if stream.closed.load(Ordering::SeqCst) {
            return;
        }

        let reason = match end {
            PushEnd::Unsupported => {
                tracing::debug!(backend = %stream.backend_id, "server offers no push stream");
                return;
            }
            PushEnd::Dropped { reason, opened } => {
                // Only consecutive failed reconnects count against the policy
                if opened {
                    failures = 0;
                }
                reason
            }
        };

        match &stream.retry {
            Some(policy) if failures < policy.attempts => {
                let delay = policy.delay_for(failures);
                failures += 1;
                tracing::debug!(
                    backend = %stream.backend_id,
                    "push stream dropped ({}), reconnecting in {:?}",
                    reason,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Some(_) => {
                stream.handlers.fail(GatewayError::TransportClosed(format!(
                    "push stream for '{}' lost after {} reconnects: {}",
                    stream.backend_id, failures, reason
                )));
                return;
            }
            None => {
                tracing::debug!(backend = %stream.backend_id, "push stream ended: {}", reason);
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers.set_message(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.handlers.set_error(handler);
    }

    async fn start(&self) -> Result<()> {
        reqwest::Url::parse(&self.spec.url)
            .map_err(|e| GatewayError::TransportStart(format!("invalid url '{}': {}", self.spec.url, e)))?;
        Ok(())
    }

    async fn send(&self, message: ClientJsonRpcMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportClosed(self.backend_id.clone()));
        }

        let response = self.post(&serde_json::to_string(&message)?).await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Transport(format!("HTTP {}: {}", status, body.trim())));
        }

        let session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.remember_session(session).await;

        if status == StatusCode::ACCEPTED {
            return Ok(());
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_stream {
            let mut decoder = SseDecoder::default();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let bytes = chunk.map_err(|e| GatewayError::Transport(e.to_string()))?;
                for event in decoder.feed(&bytes) {
                    dispatch_event(&self.handlers, &self.backend_id, event);
                }
            }
            return Ok(());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| GatewayError::Parse(e.to_string()))?;
        for reply in decode_server_batch(value) {
            self.handlers
                .dispatch(reply.map_err(|e| GatewayError::Parse(e.to_string()))?);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(task) = self.push_task.lock().await.take() {
            task.abort();
        }

        if let Some(session) = self.session_id.write().await.take() {
            let request = self
                .client
                .delete(&self.spec.url)
                .headers(self.headers.clone())
                .header(SESSION_HEADER, session)
                .timeout(Duration::from_secs(5));
            if let Err(e) = request.send().await {
                tracing::debug!(backend = %self.backend_id, "session delete failed: {}", e);
            }
        }

        Ok(())
    }
}
