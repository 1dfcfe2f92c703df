//! Serve command handler
//!
//! Connects the backend pool, then serves the configured exposure until
//! Ctrl-C or SIGTERM. On unix, SIGHUP reconnects every backend and tells
//! live sessions that the tool list changed.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{log_report, CommandContext};
use crate::config::{
    default_host, default_http_path, default_messages_path, default_port, default_sse_path,
    ExposureConfig,
};
use crate::pool::BackendPool;
use crate::server;
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExposureKind {
    Stdio,
    StreamableHttp,
    Sse,
}

/// Command-line overrides for the configured exposure
#[derive(Debug, Clone, Default)]
pub struct ServeOverrides {
    pub transport: Option<ExposureKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
}

/// Apply overrides on top of the configured exposure.
///
/// Switching transport starts from that transport's defaults, and fields
/// that do not apply to the chosen transport are ignored.
pub fn resolve_exposure(configured: &ExposureConfig, overrides: &ServeOverrides) -> ExposureConfig {
    let base = match (overrides.transport, configured) {
        (None, configured) => configured.clone(),
        (Some(ExposureKind::Stdio), _) => ExposureConfig::Stdio,
        (Some(ExposureKind::StreamableHttp), c @ ExposureConfig::StreamableHttp { .. }) => c.clone(),
        (Some(ExposureKind::Sse), c @ ExposureConfig::Sse { .. }) => c.clone(),
        (Some(ExposureKind::StreamableHttp), _) => ExposureConfig::StreamableHttp {
            host: default_host(),
            port: default_port(),
            path: default_http_path(),
        },
        (Some(ExposureKind::Sse), _) => ExposureConfig::Sse {
            host: default_host(),
            port: default_port(),
            path: default_sse_path(),
            messages_path: default_messages_path(),
        },
    };

    match base {
        ExposureConfig::Stdio => ExposureConfig::Stdio,
        ExposureConfig::StreamableHttp { host, port, path } => ExposureConfig::StreamableHttp {
            host: overrides.host.clone().unwrap_or(host),
            port: overrides.port.unwrap_or(port),
            path: overrides.path.clone().unwrap_or(path),
        },
        ExposureConfig::Sse {
            host,
            port,
            path,
            messages_path,
        } => ExposureConfig::Sse {
            host: overrides.host.clone().unwrap_or(host),
            port: overrides.port.unwrap_or(port),
            path: overrides.path.clone().unwrap_or(path),
            messages_path,
        },
    }
}

/// Handle the `serve` command
pub async fn run_serve(ctx: &CommandContext, overrides: ServeOverrides) -> Result<()> {
    let exposure = resolve_exposure(&ctx.config.server, &overrides);

    let pool = Arc::new(BackendPool::from_config(&ctx.config));
    let report = pool.connect().await?;
    log_report(&report);

    let sessions = Arc::new(SessionManager::new(pool.clone(), ctx.config.server_name.clone()));
    let (trigger, triggers) = mpsc::channel(1);
    let hangups = forward_hangups(trigger);
    let reload = ReloadTask::spawn(pool.clone(), sessions.clone(), triggers);

    let outcome = server::serve(&exposure, sessions, shutdown_signal()).await;

    if let Some(hangups) = hangups {
        hangups.abort();
    }
    // A reload in flight finishes first, so every backend it started is
    // owned by the pool when it disconnects.
    reload.stop().await;
    pool.disconnect().await;
    tracing::info!("Gateway stopped");
    outcome
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// Reconnects the pool on every trigger.
///
/// Stopping never interrupts a reconnect; it waits for the one in flight.
pub struct ReloadTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReloadTask {
    pub fn spawn(
        pool: Arc<BackendPool>,
        sessions: Arc<SessionManager>,
        mut triggers: mpsc::Receiver<()>,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    trigger = triggers.recv() => {
                        if trigger.is_none() {
                            break;
                        }
                    }
                }
                reload(&pool, &sessions).await;
            }
        });
        Self { stop, task }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Reload task ended abnormally: {}", e);
        }
    }
}

async fn reload(pool: &BackendPool, sessions: &SessionManager) {
    tracing::info!("Reconnecting backends");
    pool.disconnect().await;
    match pool.connect().await {
        Ok(report) => {
            log_report(&report);
            let notified = sessions.notify_tools_changed().await;
            tracing::info!("Notified {} session(s) of tool changes", notified);
        }
        Err(e) => tracing::error!("Reconnect failed: {}", e),
    }
}

/// Turn each SIGHUP into a reload trigger
#[cfg(unix)]
fn forward_hangups(trigger: mpsc::Sender<()>) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!("SIGHUP reload unavailable: {}", e);
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("Received SIGHUP");
            if trigger.send(()).await.is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
fn forward_hangups(_trigger: mpsc::Sender<()>) -> Option<JoinHandle<()>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(port: u16) -> ExposureConfig {
        ExposureConfig::StreamableHttp {
            host: "0.0.0.0".into(),
            port,
            path: "/mcp".into(),
        }
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        assert_eq!(
            resolve_exposure(&http(8080), &ServeOverrides::default()),
            http(8080)
        );
    }

    #[test]
    fn test_port_override_keeps_other_fields() {
        let overrides = ServeOverrides {
            port: Some(9000),
            ..Default::default()
        };
        assert_eq!(resolve_exposure(&http(8080), &overrides), http(9000));
    }

    #[test]
    fn test_switching_transport_uses_its_defaults() {
        let overrides = ServeOverrides {
            transport: Some(ExposureKind::Sse),
            port: Some(4000),
            ..Default::default()
        };
        assert_eq!(
            resolve_exposure(&http(8080), &overrides),
            ExposureConfig::Sse {
                host: "127.0.0.1".into(),
                port: 4000,
                path: "/sse".into(),
                messages_path: "/messages".into(),
            }
        );

        let stdio = ServeOverrides {
            transport: Some(ExposureKind::Stdio),
            port: Some(1),
            ..Default::default()
        };
        assert_eq!(resolve_exposure(&http(8080), &stdio), ExposureConfig::Stdio);
    }
}
