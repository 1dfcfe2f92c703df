//! Container lifecycle management over a docker-compatible CLI
//!
//! Every operation shells out to the configured runtime binary
//! (`docker` unless overridden) and captures its output.
//!
//! ```rust,ignore
//! let runtime = ContainerRuntime::new("docker");
//! let container = runtime.run_detached(&options, RestartPolicy::No, None).await?;
//! let output = runtime.exec(&container, &["tool".into(), message], &env).await?;
//! runtime.stop(&container.name).await?;
//! ```

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, instrument};

use crate::config::{HealthCheck, RestartPolicy};

const NAME_PREFIX: &str = "mcp-gateway";

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container command failed (exit code {code}): {stderr}")]
    CommandFailed { code: i32, stderr: String },

    #[error("failed to spawn container runtime: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("container runtime '{0}' not found - ensure it is installed and in PATH")]
    NotFound(String),

    #[error("container {name} is {status}")]
    Unhealthy { name: String, status: String },

    #[error("container {0} did not become healthy in time")]
    HealthTimeout(String),
}

pub type ContainerResult<T> = Result<T, ContainerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStrategy {
    PerRequest,
    Persistent,
}

/// A container started by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Id reported by the runtime
    pub id: String,
    /// Name assigned at creation, used for every later command
    pub name: String,
    pub image: String,
    pub strategy: ContainerStrategy,
}

/// Image, command and mounts shared by both container strategies
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    /// `host:container[:mode]`
    pub volumes: Vec<String>,
    pub network: Option<String>,
}

impl Container {
    /// A container for a single request, named before it is created.
    ///
    /// The runtime never reports an id for a foreground `run`, so the name
    /// doubles as the id.
    pub fn per_request(image: &str) -> Self {
        let name = generate_name();
        Self {
            id: name.clone(),
            name,
            image: image.to_string(),
            strategy: ContainerStrategy::PerRequest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ContainerOutput {
    /// Stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        combined.push_str(&self.stderr);
        combined
    }
}

pub fn generate_name() -> String {
    format!("{}-{}", NAME_PREFIX, uuid::Uuid::new_v4())
}

fn millis(ms: u64) -> String {
    format!("{}ms", ms)
}

#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Run one runtime command, failing on non-zero exit
    async fn execute(&self, args: &[String]) -> ContainerResult<ContainerOutput> {
        debug!("executing: {} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ContainerError::NotFound(self.binary.clone())
                } else {
                    ContainerError::Spawn(e)
                }
            })?
            .wait_with_output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            error!(code, stderr = %stderr, "container command failed");
            return Err(ContainerError::CommandFailed { code, stderr });
        }

        Ok(ContainerOutput { stdout, stderr })
    }

    fn push_run_options(args: &mut Vec<String>, options: &RunOptions) {
        let mut env: Vec<_> = options.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        for volume in &options.volumes {
            args.push("-v".into());
            args.push(volume.clone());
        }
        if let Some(network) = &options.network {
            args.push("--network".into());
            args.push(network.clone());
        }
    }

    /// Arguments for a container that runs `command + [trailing]` and exits
    pub fn ephemeral_args(
        name: &str,
        options: &RunOptions,
        auto_remove: bool,
        trailing: &str,
    ) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--name".to_string(), name.to_string()];
        if auto_remove {
            args.push("--rm".into());
        }
        Self::push_run_options(&mut args, options);
        args.push(options.image.clone());
        args.extend(options.command.iter().cloned());
        args.push(trailing.to_string());
        args
    }

    /// Arguments for a detached long-lived container
    pub fn detached_args(
        name: &str,
        options: &RunOptions,
        restart: RestartPolicy,
        health: Option<&HealthCheck>,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--restart".to_string(),
            restart.as_str().to_string(),
        ];
        if let Some(check) = health {
            args.extend([
                "--health-cmd".to_string(),
                check.test.clone(),
                "--health-interval".to_string(),
                millis(check.interval_ms),
                "--health-timeout".to_string(),
                millis(check.timeout_ms),
                "--health-retries".to_string(),
                check.retries.to_string(),
                "--health-start-period".to_string(),
                millis(check.start_period_ms),
            ]);
        }
        Self::push_run_options(&mut args, options);
        args.push(options.image.clone());
        args.extend(options.command.iter().cloned());
        args
    }

    /// Create a container, run it to completion with `trailing` appended to
    /// its command, and make sure it is gone afterwards.
    #[instrument(skip(self, options, trailing), fields(image = %options.image))]
    pub async fn run_ephemeral(
        &self,
        options: &RunOptions,
        auto_remove: bool,
        trailing: &str,
    ) -> ContainerResult<ContainerOutput> {
        let container = Container::per_request(&options.image);
        let args = Self::ephemeral_args(&container.name, options, auto_remove, trailing);
        let result = self.execute(&args).await;

        // `--rm` covers the success path; everything else is removed here.
        if !auto_remove || result.is_err() {
            if let Err(e) = self.force_remove(&container.name).await {
                debug!("cleanup of {} skipped: {}", container.name, e);
            }
        }

        result
    }

    #[instrument(skip(self, options, health), fields(image = %options.image))]
    pub async fn run_detached(
        &self,
        options: &RunOptions,
        restart: RestartPolicy,
        health: Option<&HealthCheck>,
    ) -> ContainerResult<Container> {
        let name = generate_name();
        let args = Self::detached_args(&name, options, restart, health);
        let output = self.execute(&args).await?;

        let id = output
            .stdout
            .lines()
            .last()
            .map(|line| line.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| name.clone());

        tracing::info!("Started container {} ({})", name, id);

        Ok(Container {
            id,
            name,
            image: options.image.clone(),
            strategy: ContainerStrategy::Persistent,
        })
    }

    /// Run `command` inside a running container
    #[instrument(skip(self, command, env), fields(container = %container.name))]
    pub async fn exec(
        &self,
        container: &Container,
        command: &[String],
        env: &HashMap<String, String>,
    ) -> ContainerResult<ContainerOutput> {
        let mut args = vec!["exec".to_string()];
        let mut env: Vec<_> = env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(container.name.clone());
        args.extend(command.iter().cloned());
        self.execute(&args).await
    }

    /// Health status reported by the runtime, `None` when no check is configured
    pub async fn health_status(&self, name: &str) -> ContainerResult<Option<String>> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{if .State.Health}}{{.State.Health.Status}}{{end}}".to_string(),
            name.to_string(),
        ];
        let output = self.execute(&args).await?;
        let status = output.stdout.trim().to_string();
        Ok(if status.is_empty() { None } else { Some(status) })
    }

    /// Poll until the container reports `healthy`.
    ///
    /// Gives up after `start_period + retries * interval`, or as soon as the
    /// runtime reports `unhealthy`.
    pub async fn wait_healthy(&self, name: &str, check: &HealthCheck) -> ContainerResult<()> {
        let interval = Duration::from_millis(check.interval_ms.max(100));
        let budget = Duration::from_millis(
            check.start_period_ms + check.interval_ms.saturating_mul(u64::from(check.retries.max(1))),
        );
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            match self.health_status(name).await?.as_deref() {
                Some("healthy") | None => return Ok(()),
                Some("unhealthy") => {
                    return Err(ContainerError::Unhealthy {
                        name: name.to_string(),
                        status: "unhealthy".to_string(),
                    })
                }
                Some(status) => debug!("container {} is {}", name, status),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ContainerError::HealthTimeout(name.to_string()));
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn stop(&self, name: &str) -> ContainerResult<()> {
        self.execute(&["stop".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    pub async fn remove(&self, name: &str) -> ContainerResult<()> {
        self.execute(&["rm".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    pub async fn force_remove(&self, name: &str) -> ContainerResult<()> {
        self.execute(&["rm".to_string(), "-f".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    /// Names of running containers created by the gateway
    pub async fn list_running(&self) -> ContainerResult<Vec<String>> {
        let args = [
            "ps".to_string(),
            "--filter".to_string(),
            format!("name={}-", NAME_PREFIX),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let output = self.execute(&args).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }
}
