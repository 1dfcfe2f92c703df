//! Container-backed transports
//!
//! `ContainerTransport` runs one container per request: the serialized
//! message is appended to the image command and the container's exit is the
//! completion signal. `PersistentContainerTransport` starts one long-lived
//! container and runs an `exec` per request inside it.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{correlate_output, ErrorHandler, Handlers, MessageHandler, Transport};
use crate::config::{ContainerSpec, PersistentContainerSpec};
use crate::container::{Container, ContainerOutput, ContainerRuntime, RunOptions};
use crate::error::{GatewayError, Result};
use crate::protocol::{request_id, ClientJsonRpcMessage, RequestId, ServerJsonRpcMessage};

/// Parse a container's output as the reply to `id`.
///
/// Stdout is preferred; when it is empty the combined output is tried so
/// images that log their reply to stderr still work.
fn parse_reply(id: &RequestId, output: &ContainerOutput) -> Result<ServerJsonRpcMessage> {
    let source = if output.stdout.trim().is_empty() {
        output.combined()
    } else {
        output.stdout.clone()
    };
    correlate_output(id, &source).map_err(|e| match e {
        GatewayError::Parse(detail) => {
            GatewayError::Parse(format!("Failed to parse docker tool output: {}", detail))
        }
        other => other,
    })
}

// ============================================================================
// Per-request containers
// ============================================================================

pub struct ContainerTransport {
    backend_id: String,
    spec: ContainerSpec,
    runtime: ContainerRuntime,
    handlers: Handlers,
    closed: AtomicBool,
}

impl ContainerTransport {
    pub fn new(backend_id: &str, spec: ContainerSpec) -> Self {
        let runtime = ContainerRuntime::new(spec.runtime.clone());
        Self {
            backend_id: backend_id.to_string(),
            spec,
            runtime,
            handlers: Handlers::default(),
            closed: AtomicBool::new(false),
        }
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            image: self.spec.image.clone(),
            command: self.spec.command.clone(),
            env: self.spec.env.clone(),
            volumes: self.spec.volumes.clone(),
            network: self.spec.network.clone(),
        }
    }
}

#[async_trait]
impl Transport for ContainerTransport {
    fn kind(&self) -> &'static str {
        "container"
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers.set_message(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.handlers.set_error(handler);
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, message: ClientJsonRpcMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportClosed(self.backend_id.clone()));
        }
        let Some(id) = request_id(&message) else {
            return Ok(());
        };

        let output = self
            .runtime
            .run_ephemeral(&self.options(), self.spec.auto_remove, &serde_json::to_string(&message)?)
            .await?;
        let reply = parse_reply(&id, &output)?;
        self.handlers.dispatch(reply);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Persistent container
// ============================================================================

pub struct PersistentContainerTransport {
    backend_id: String,
    spec: PersistentContainerSpec,
    runtime: ContainerRuntime,
    handlers: Handlers,
    container: Mutex<Option<Container>>,
    closed: AtomicBool,
}

impl PersistentContainerTransport {
    pub fn new(backend_id: &str, spec: PersistentContainerSpec) -> Self {
        let runtime = ContainerRuntime::new(spec.runtime.clone());
        Self {
            backend_id: backend_id.to_string(),
            spec,
            runtime,
            handlers: Handlers::default(),
            container: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn container(&self) -> Option<Container> {
        self.container.lock().await.clone()
    }

    /// Stop and, with `auto_remove`, remove the container.
    ///
    /// A failed stop still removes it (forcibly, since it may be running);
    /// the first error is returned once cleanup has been attempted.
    async fn teardown(&self, container: &Container) -> Result<()> {
        let stopped = self.runtime.stop(&container.name).await;
        if let Err(e) = &stopped {
            tracing::warn!(backend = %self.backend_id, "stopping {} failed: {}", container.name, e);
        }

        let removed = match (&stopped, self.spec.auto_remove) {
            (Ok(()), true) => self.runtime.remove(&container.name).await,
            (Err(_), _) => self.runtime.force_remove(&container.name).await,
            (Ok(()), false) => Ok(()),
        };
        if let Err(e) = &removed {
            tracing::warn!(backend = %self.backend_id, "removing {} failed: {}", container.name, e);
        }

        stopped?;
        removed?;
        Ok(())
    }
}

#[async_trait]
impl Transport for PersistentContainerTransport {
    fn kind(&self) -> &'static str {
        "container-persistent"
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

        let mut slot = self.container.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let options = RunOptions {
            image: self.spec.image.clone(),
            command: self.spec.command.clone(),
            env: self.spec.env.clone(),
            volumes: self.spec.volumes.clone(),
            network: self.spec.network.clone(),
        };
        let container = self
            .runtime
            .run_detached(&options, self.spec.restart_policy, self.spec.health_check.as_ref())
            .await
            .map_err(|e| GatewayError::TransportStart(e.to_string()))?;

        if let Some(check) = &self.spec.health_check {
            if let Err(e) = self.runtime.wait_healthy(&container.name, check).await {
                if let Err(cleanup) = self.runtime.force_remove(&container.name).await {
                    tracing::warn!(backend = %self.backend_id, "cleanup failed: {}", cleanup);
                }
                return Err(GatewayError::TransportStart(e.to_string()));
            }
        }

        *slot = Some(container);
        Ok(())
    }

    async fn send(&self, message: ClientJsonRpcMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportClosed(self.backend_id.clone()));
        }
        let Some(id) = request_id(&message) else {
            return Ok(());
        };

        let container = self
            .container
            .lock()
            .await
            .clone()
            .ok_or_else(|| GatewayError::Transport(format!("container '{}' not started", self.backend_id)))?;

        let mut command = self.spec.exec_command().to_vec();
        command.push(serde_json::to_string(&message)?);

        let output = self.runtime.exec(&container, &command, &self.spec.env).await?;
        let reply = parse_reply(&id, &output)?;
        self.handlers.dispatch(reply);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let container = self.container.lock().await.take();
        match container {
            Some(container) => {
                tracing::info!("Stopping container {} for '{}'", container.name, self.backend_id);
                self.teardown(&container).await
            }
            None => Ok(()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{HealthCheck, RestartPolicy};
    use crate::transport::testing::{call, collect, request};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    struct FakeRuntime {
        script: PathBuf,
        log: PathBuf,
        payload: PathBuf,
    }

    /// A fake container CLI: records every invocation and emulates
    /// `run`, `exec`, `inspect`, `stop`, `rm` and `ps`. Tool invocations
    /// store their trailing argument and print a fixed tool result.
    fn fake_runtime(dir: &Path, health: &str, stop_exit: i32) -> FakeRuntime {
        let log = dir.join("calls.log");
        let payload = dir.join("payload.json");
        let script = dir.join("fake-docker");
        let body = format!(
            r#"#!/bin/sh
echo "$*" >> "{log}"
for last in "$@"; do :; done
reply='{{"result":{{"content":[{{"type":"text","text":"ok"}}]}}}}'
case "$1" in
  run)
    if [ "$2" = "-d" ]; then echo "cid-123"; else printf '%s' "$last" > "{payload}"; printf '%s' "$reply"; fi ;;
  exec) printf '%s' "$last" > "{payload}"; printf '%s' "$reply" ;;
  inspect) echo "{health}" ;;
  ps) ;;
  stop) echo "stop refused" >&2; exit {stop_exit} ;;
  rm) ;;
esac
"#,
            log = log.display(),
            payload = payload.display(),
            health = health,
            stop_exit = stop_exit,
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        FakeRuntime { script, log, payload }
    }

    fn calls(log: &Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn payload(fake: &FakeRuntime) -> Value {
        serde_json::from_str(&std::fs::read_to_string(&fake.payload).unwrap()).unwrap()
    }

    fn per_request(runtime: &Path, auto_remove: bool) -> ContainerSpec {
        ContainerSpec {
            image: "echo:latest".into(),
            command: vec!["tool".into()],
            env: HashMap::new(),
            volumes: Vec::new(),
            network: None,
            auto_remove,
            runtime: runtime.display().to_string(),
        }
    }

    #[tokio::test]
    async fn test_per_request_passes_message_and_returns_reply() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_runtime(dir.path(), "healthy", 0);
        let transport = ContainerTransport::new("box", per_request(&fake.script, true));
        let seen = collect(&transport);

        transport.send(call(4, "echo")).await.unwrap();

        assert_eq!(payload(&fake)["params"]["name"], "echo");
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["id"], 4);
        assert_eq!(seen[0]["result"]["content"][0]["text"], "ok");

        let calls = calls(&fake.log);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("run --name mcp-gateway-"));
        assert!(calls[0].contains("--rm echo:latest tool"));
    }

    #[tokio::test]
    async fn test_per_request_without_auto_remove_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_runtime(dir.path(), "healthy", 0);
        let transport = ContainerTransport::new("box", per_request(&fake.script, false));

        transport.send(request(1, "ping", None)).await.unwrap();

        let calls = calls(&fake.log);
        assert_eq!(calls.len(), 2);
        assert!(calls[1].starts_with("rm -f mcp-gateway-"));
    }

    fn persistent(runtime: &Path, health_check: Option<HealthCheck>) -> PersistentContainerSpec {
        PersistentContainerSpec {
            image: "svc:1".into(),
            command: vec!["serve".into()],
            exec: Some(vec!["tool".into(), "--once".into()]),
            env: HashMap::new(),
            volumes: Vec::new(),
            network: None,
            auto_remove: true,
            restart_policy: RestartPolicy::No,
            health_check,
            runtime: runtime.display().to_string(),
        }
    }

    fn health(test: &str) -> HealthCheck {
        HealthCheck {
            test: test.into(),
            interval_ms: 100,
            timeout_ms: 100,
            retries: 1,
            start_period_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_persistent_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_runtime(dir.path(), "healthy", 0);
        let transport =
            PersistentContainerTransport::new("svc", persistent(&fake.script, Some(health("true"))));
        let seen = collect(&transport);

        transport.start().await.unwrap();
        let container = transport.container().await.unwrap();
        assert_eq!(container.id, "cid-123");

        transport.send(request(2, "tools/list", None)).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(payload(&fake)["method"], "tools/list");

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let calls = calls(&fake.log);
        let verbs: Vec<&str> = calls.iter().map(|c| c.split(' ').next().unwrap()).collect();
        assert_eq!(verbs, vec!["run", "inspect", "exec", "stop", "rm"]);
        assert!(calls[2].contains(&format!("{} tool --once", container.name)));
    }

    #[tokio::test]
    async fn test_failed_stop_still_force_removes() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_runtime(dir.path(), "healthy", 1);
        let transport = PersistentContainerTransport::new("svc", persistent(&fake.script, None));

        transport.start().await.unwrap();
        let container = transport.container().await.unwrap();

        let err = transport.close().await.unwrap_err();
        assert!(matches!(err, GatewayError::Container(_)));

        let calls = calls(&fake.log);
        assert_eq!(calls.last().unwrap(), &format!("rm -f {}", container.name));
        assert!(transport.container().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_stop_without_auto_remove_still_removes() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_runtime(dir.path(), "healthy", 1);
        let mut spec = persistent(&fake.script, None);
        spec.auto_remove = false;
        let transport = PersistentContainerTransport::new("svc", spec);

        transport.start().await.unwrap();
        assert!(transport.close().await.is_err());
        assert!(calls(&fake.log).last().unwrap().starts_with("rm -f "));
    }

    #[tokio::test]
    async fn test_unhealthy_container_fails_start_and_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_runtime(dir.path(), "unhealthy", 0);
        let transport =
            PersistentContainerTransport::new("svc", persistent(&fake.script, Some(health("false"))));

        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, GatewayError::TransportStart(_)));
        assert!(calls(&fake.log).last().unwrap().starts_with("rm -f"));
    }

    #[tokio::test]
    #[ignore = "requires a docker daemon and the alpine image"]
    async fn test_per_request_with_docker_leaves_no_container() {
        let spec = ContainerSpec {
            image: "alpine:3".into(),
            command: vec![
                "sh".into(),
                "-c".into(),
                r#"printf '{"result":{"content":[{"type":"text","text":"from alpine"}]}}'"#.into(),
                "sh".into(),
            ],
            env: HashMap::new(),
            volumes: Vec::new(),
            network: None,
            auto_remove: true,
            runtime: "docker".into(),
        };
        let transport = ContainerTransport::new("alpine", spec);
        let seen = collect(&transport);

        transport.send(call(1, "hello")).await.unwrap();
        assert_eq!(seen.lock().unwrap()[0]["result"]["content"][0]["text"], "from alpine");

        let running = ContainerRuntime::new("docker").list_running().await.unwrap();
        assert!(running.is_empty());
    }
}
