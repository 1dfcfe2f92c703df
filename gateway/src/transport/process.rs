//! Long-lived process speaking newline-delimited JSON over stdio

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::{split_command, ErrorHandler, Handlers, MessageHandler, Transport};
use crate::config::ProcessRpcSpec;
use crate::error::{GatewayError, Result};
use crate::protocol::{decode_server_batch, ClientJsonRpcMessage};

#[derive(Default)]
struct Running {
    stdin: Option<ChildStdin>,
    kill: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
    waiter: Option<JoinHandle<()>>,
}

pub struct PersistentProcessTransport {
    backend_id: String,
    spec: ProcessRpcSpec,
    handlers: Handlers,
    running: Mutex<Running>,
    started: AtomicBool,
    closed: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
}

impl PersistentProcessTransport {
    pub fn new(backend_id: &str, spec: ProcessRpcSpec) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            spec,
            handlers: Handlers::default(),
            running: Mutex::new(Running::default()),
            started: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for PersistentProcessTransport {
    fn kind(&self) -> &'static str {
        "process-rpc"
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
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (program, mut args) = split_command(&self.spec.command)
            .ok_or_else(|| GatewayError::TransportStart("empty command".to_string()))?;
        args.extend(self.spec.args.iter().cloned());

        tracing::info!("Starting backend process '{}': {} {:?}", self.backend_id, program, args);

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::TransportStart(format!("failed to spawn '{}': {}", program, e))
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::TransportStart("stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        let mut tasks = Vec::new();

        // Reader: one message per line, dispatched in arrival order
        let handlers = self.handlers.clone();
        let backend = self.backend_id.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let value = match serde_json::from_str(line) {
                            Ok(value) => value,
                            Err(e) => {
                                tracing::warn!(backend = %backend, "ignoring unparsable line: {}", e);
                                continue;
                            }
                        };
                        for decoded in decode_server_batch(value) {
                            match decoded {
                                Ok(message) => handlers.dispatch(message),
                                Err(e) => {
                                    tracing::warn!(backend = %backend, "ignoring invalid message: {}", e)
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(backend = %backend, "stdout read failed: {}", e);
                        break;
                    }
                }
            }
        }));

        if let Some(stderr) = stderr {
            let backend = self.backend_id.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(backend = %backend, "{}", line);
                }
            }));
        }

        // Waiter: owns the child, reports unexpected exit, kills on request
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let handlers = self.handlers.clone();
        let backend = self.backend_id.clone();
        let closed = self.closed.clone();
        let exited = self.exited.clone();
        let waiter = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    exited.store(true, Ordering::SeqCst);
                    if !closed.load(Ordering::SeqCst) {
                        let detail = match status {
                            Ok(status) => format!("backend process '{}' exited: {}", backend, status),
                            Err(e) => format!("backend process '{}' wait failed: {}", backend, e),
                        };
                        tracing::warn!("{}", detail);
                        handlers.fail(GatewayError::TransportClosed(detail));
                    }
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::debug!(backend = %backend, "kill failed: {}", e);
                    }
                    exited.store(true, Ordering::SeqCst);
                }
            }
        });

        {
            let mut running = self.running.lock().await;
            running.stdin = stdin;
            running.kill = Some(kill_tx);
            running.tasks = tasks;
            running.waiter = Some(waiter);
        }

        tokio::time::sleep(Duration::from_millis(self.spec.ready_delay_ms)).await;

        if self.exited.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportStart(format!(
                "backend process '{}' exited during startup",
                self.backend_id
            )));
        }

        Ok(())
    }

    async fn send(&self, message: ClientJsonRpcMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.exited.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportClosed(self.backend_id.clone()));
        }

        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let mut running = self.running.lock().await;
        let stdin = running
            .stdin
            .as_mut()
            .ok_or_else(|| GatewayError::TransportClosed(self.backend_id.clone()))?;

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        written.map_err(|e| {
            GatewayError::TransportClosed(format!("write to '{}' failed: {}", self.backend_id, e))
        })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut running = self.running.lock().await;
        running.stdin = None;
        if let Some(kill) = running.kill.take() {
            let _ = kill.send(());
        }
        if let Some(waiter) = running.waiter.take() {
            let _ = waiter.await;
        }
        for task in running.tasks.drain(..) {
            task.abort();
        }

        tracing::debug!("Closed backend process '{}'", self.backend_id);
        Ok(())
    }
}
