//! Session-scoped server transport manager
//!
//! Maps session ids to their own [`ProtocolEngine`] and outbound queue.
//! Sessions are created only by an initialize request that carries no
//! session id; every other request must name a live session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{GatewayError, Result};
use crate::pool::ToolRouter;
use crate::protocol::{methods, GatewayServer, OutboundSlot, ProtocolEngine};

pub const NO_VALID_SESSION: &str = "No valid session ID provided";

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    id: String,
    engine: Arc<ProtocolEngine>,
    /// Shared with the engine, which pushes server-initiated messages here
    outbound: OutboundSlot,
    /// Present while no push stream is attached
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
}

impl Session {
    fn new(id: String, server: GatewayServer) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound: OutboundSlot = Arc::new(Mutex::new(Some(tx)));
        Self {
            id,
            engine: Arc::new(ProtocolEngine::new(server, outbound.clone())),
            outbound,
            inbox: Mutex::new(Some(rx)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Queue a server-to-client message; false once the session is closed
    pub fn push(&self, message: Value) -> bool {
        match self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Attach the single push stream, or `None` if one is already attached
    pub fn attach_stream(self: &Arc<Self>) -> Option<PushStream> {
        let rx = self.inbox.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        Some(PushStream {
            session: self.clone(),
            rx: Some(rx),
        })
    }

    /// Ends any attached stream once queued messages drain
    fn close(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.engine.shutdown();
    }
}

/// Server-to-client messages for one session.
///
/// Dropping it detaches the stream so a later request can attach again.
pub struct PushStream {
    session: Arc<Session>,
    rx: Option<mpsc::UnboundedReceiver<Value>>,
}

impl PushStream {
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.as_mut()?.recv().await
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            if !self.session.is_closed() {
                *self
                    .session
                    .inbox
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(rx);
            }
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// What a POST did
#[derive(Debug)]
pub struct PostOutcome {
    pub session_id: String,
    pub created: bool,
    /// Reply body, absent when the input held no requests
    pub reply: Option<Value>,
}

pub struct SessionManager {
    router: Arc<dyn ToolRouter>,
    server_name: String,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(router: Arc<dyn ToolRouter>, server_name: impl Into<String>) -> Self {
        Self {
            router,
            server_name: server_name.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_session(&self) -> Arc<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let server = GatewayServer::new(self.router.clone(), self.server_name.clone());
        let session = Arc::new(Session::new(id.clone(), server));

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), session.clone());
        tracing::info!("Session {} created ({} active)", id, self.len());
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Like [`get`](Self::get), failing with [`GatewayError::SessionNotFound`]
    pub fn find(&self, id: &str) -> Result<Arc<Session>> {
        self.get(id).ok_or(GatewayError::SessionNotFound)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(session) = &removed {
            session.close();
            tracing::info!("Session {} closed", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn require(&self, session_id: Option<&str>) -> Result<Arc<Session>> {
        session_id
            .and_then(|id| self.get(id))
            .ok_or_else(|| GatewayError::BadSessionRequest(NO_VALID_SESSION.to_string()))
    }

    /// Route a POST body to its session.
    ///
    /// A known id reuses that session. No id plus an initialize request
    /// creates one. Anything else is rejected without touching state.
    pub async fn handle_post(&self, session_id: Option<&str>, body: Value) -> Result<PostOutcome> {
        let (session, created) = match session_id {
            Some(_) => (self.require(session_id)?, false),
            None if contains_initialize(&body) => (self.create_session(), true),
            None => return Err(GatewayError::BadSessionRequest(NO_VALID_SESSION.to_string())),
        };

        let reply = session.engine().handle_value(body).await;
        Ok(PostOutcome {
            session_id: session.id().to_string(),
            created,
            reply,
        })
    }

    /// Attach the server-to-client stream of an existing session
    pub fn open_stream(&self, session_id: Option<&str>) -> Result<PushStream> {
        let session = self.require(session_id)?;
        session.attach_stream().ok_or_else(|| {
            GatewayError::StreamConflict(format!(
                "a stream is already open for session {}",
                session.id()
            ))
        })
    }

    pub fn terminate(&self, session_id: Option<&str>) -> Result<()> {
        let session = self.require(session_id)?;
        self.remove(session.id());
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Send `tools/list_changed` to every initialized session, returning how
    /// many took it
    pub async fn notify_tools_changed(&self) -> usize {
        let mut notified = 0;
        for session in self.snapshot() {
            if session.engine().notify_tools_changed().await {
                notified += 1;
            }
        }
        notified
    }

    pub fn close_all(&self) {
        let drained: Vec<_> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !drained.is_empty() {
            tracing::info!("Closing {} session(s)", drained.len());
        }
        for (_, session) in drained {
            session.close();
        }
    }
}

/// Removes its session when dropped; ties a session to one connection
pub struct SessionGuard {
    manager: Arc<SessionManager>,
    id: String,
}

impl SessionGuard {
    pub fn new(manager: Arc<SessionManager>, id: impl Into<String>) -> Self {
        Self {
            manager,
            id: id.into(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.remove(&self.id);
    }
}

fn contains_initialize(body: &Value) -> bool {
    let is_init = |v: &Value| {
        v.get("method").and_then(Value::as_str) == Some(methods::INITIALIZE) && v.get("id").is_some()
    };
    match body {
        Value::Array(items) => items.iter().any(is_init),
        single => is_init(single),
    }
}
