//! WebSocket backend transport, one text frame per message

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{ErrorHandler, Handlers, MessageHandler, Transport};
use crate::config::SocketSpec;
use crate::error::{GatewayError, Result};
use crate::protocol::{decode_server_batch, ClientJsonRpcMessage};

type Sink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct SocketTransport {
    backend_id: String,
    spec: SocketSpec,
    handlers: Handlers,
    sink: Mutex<Option<Sink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl SocketTransport {
    pub fn new(backend_id: &str, spec: SocketSpec) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            spec,
            handlers: Handlers::default(),
            sink: Mutex::new(None),
            reader: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self
            .spec
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::TransportStart(format!("invalid url '{}': {}", self.spec.url, e)))?;

        let headers = request.headers_mut();
        for (name, value) in &self.spec.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| GatewayError::Config(format!("invalid header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| GatewayError::Config(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }
        if !self.spec.protocols.is_empty() {
            let protocols = HeaderValue::from_str(&self.spec.protocols.join(", "))
                .map_err(|e| GatewayError::Config(format!("invalid subprotocol: {}", e)))?;
            headers.insert("Sec-WebSocket-Protocol", protocols);
        }

        Ok(request)
    }
}

fn dispatch_text(handlers: &Handlers, backend: &str, text: &str) {
    let value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(backend = %backend, "ignoring malformed frame: {}", e);
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

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> &'static str {
        "socket"
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers.set_message(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.handlers.set_error(handler);
    }

    async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportClosed(self.backend_id.clone()));
        }

        let request = self.request()?;
        let timeout = Duration::from_millis(self.spec.connect_timeout_ms);

        let (stream, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| {
                GatewayError::TransportStart(format!(
                    "connect to '{}' timed out after {}ms",
                    self.spec.url, self.spec.connect_timeout_ms
                ))
            })?
            .map_err(|e| GatewayError::TransportStart(format!("connect to '{}': {}", self.spec.url, e)))?;

        tracing::info!("Connected socket backend '{}' at {}", self.backend_id, self.spec.url);

        let (sink, mut source) = stream.split();
        *self.sink.lock().await = Some(sink);

        let handlers = self.handlers.clone();
        let backend = self.backend_id.clone();
        let closed = self.closed.clone();
        let reader = tokio::spawn(async move {
            let mut failure = None;
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch_text(&handlers, &backend, &text),
                    Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => dispatch_text(&handlers, &backend, text),
                        Err(_) => tracing::warn!(backend = %backend, "ignoring non-UTF-8 frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }

            if !closed.load(Ordering::SeqCst) {
                let reason = failure.unwrap_or_else(|| "closed by peer".to_string());
                handlers.fail(GatewayError::TransportClosed(format!(
                    "socket backend '{}': {}",
                    backend, reason
                )));
            }
        });
        *self.reader.lock().await = Some(reader);

        Ok(())
    }

    async fn send(&self, message: ClientJsonRpcMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportClosed(self.backend_id.clone()));
        }
        let text = serde_json::to_string(&message)?;

        let mut sink = self.sink.lock().await;
        let sink = sink
            .as_mut()
            .ok_or_else(|| GatewayError::Transport(format!("socket '{}' not started", self.backend_id)))?;

        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| GatewayError::TransportClosed(format!("socket '{}': {}", self.backend_id, e)))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                tracing::debug!(backend = %self.backend_id, "socket close: {}", e);
            }
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        Ok(())
    }
}
