//! One process per call
//!
//! The serialized message is appended as the final argument; the process
//! prints its reply on stdout and exits. Exit is the completion signal.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;

use super::{correlate_output, split_command, ErrorHandler, Handlers, MessageHandler, Transport};
use crate::config::ProcessSpec;
use crate::error::{GatewayError, Result};
use crate::protocol::{request_id, ClientJsonRpcMessage};

pub struct OneShotProcessTransport {
    backend_id: String,
    program: String,
    args: Vec<String>,
    spec: ProcessSpec,
    handlers: Handlers,
    closed: AtomicBool,
}

impl OneShotProcessTransport {
    pub fn new(backend_id: &str, spec: ProcessSpec) -> Self {
        let (program, mut args) = split_command(&spec.command).unwrap_or_default();
        args.extend(spec.args.iter().cloned());
        Self {
            backend_id: backend_id.to_string(),
            program,
            args,
            spec,
            handlers: Handlers::default(),
            closed: AtomicBool::new(false),
        }
    }

    async fn invoke(&self, payload: String) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(payload)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.spec.cwd {
            cmd.current_dir(cwd);
        }

        let output = cmd
            .spawn()
            .map_err(|e| {
                GatewayError::TransportStart(format!("failed to spawn '{}': {}", self.program, e))
            })?
            .wait_with_output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = output.status.code().unwrap_or(-1);
            tracing::debug!(backend = %self.backend_id, code, "one-shot process failed");
            return Err(GatewayError::ProcessFailed { code, stderr });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Transport for OneShotProcessTransport {
    fn kind(&self) -> &'static str {
        "process"
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers.set_message(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.handlers.set_error(handler);
    }

    async fn start(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(GatewayError::TransportStart("empty command".to_string()));
        }
        Ok(())
    }

    async fn send(&self, message: ClientJsonRpcMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportClosed(self.backend_id.clone()));
        }

        // Only requests get a reply; nothing to run for the rest.
        let Some(id) = request_id(&message) else {
            return Ok(());
        };

        let stdout = self.invoke(serde_json::to_string(&message)?).await?;
        let reply = correlate_output(&id, &stdout)?;
        self.handlers.dispatch(reply);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
