//! Service launcher.
//!
//! Replaces the running worker instance only when the manifest changed,
//! then polls for a running state within a bounded backoff window. A
//! failed health check reports recent container logs; the removed prior
//! instance is not auto-restored (manual recovery:
//! `nodeup provision --force-redeploy`).

use std::time::Duration;

use async_trait::async_trait;

use crate::command;
use crate::engine::EngineKind;
use crate::error::{ProvisionError, Result};
use crate::manifest::DeploymentManifest;
use crate::retry::{wait_until, RetryPolicy};

/// Namespaced instance name; stable across runs so redeploys can find the
/// prior instance.
pub const INSTANCE_NAME: &str = "nodeup-worker";

/// Observed state of the managed instance. Owned by the runtime, only
/// observed here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Present,
    Absent,
}

/// Engine CLI seam: the exact container operations the launcher needs.
#[async_trait]
pub trait EngineCli: Send + Sync {
    async fn pull(&self, image: &str) -> Result<()>;
    async fn run(&self, name: &str, manifest: &DeploymentManifest) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn rm(&self, name: &str) -> Result<()>;
    async fn state(&self, name: &str) -> Result<InstanceState>;
    /// Recent log output for diagnostics.
    async fn logs_tail(&self, name: &str, lines: u32) -> Result<String>;
}

/// Subprocess-backed implementation driving `docker`/`podman`.
pub struct ShellEngineCli {
    program: &'static str,
}

impl ShellEngineCli {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            program: kind.as_str(),
        }
    }

    async fn checked(&self, args: &[&str], what: &str) -> Result<command::CmdOutput> {
        let out = command::run_default(self.program, args).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(ProvisionError::Command(format!(
                "{} {} failed: {}",
                self.program,
                what,
                out.last_stderr_line()
            )))
        }
    }
}

#[async_trait]
impl EngineCli for ShellEngineCli {
    async fn pull(&self, image: &str) -> Result<()> {
        tracing::info!("[ServiceLauncher] Pulling {}", image);
        self.checked(&["pull", image], "pull").await.map(|_| ())
    }

    async fn run(&self, name: &str, manifest: &DeploymentManifest) -> Result<()> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--restart".into(),
            "unless-stopped".into(),
            "--network".into(),
            "host".into(),
        ];
        if let Some(cpus) = manifest.resources.cpus {
            args.push(format!("--cpus={}", cpus));
        }
        if let Some(memory) = &manifest.resources.memory {
            args.push(format!("--memory={}", memory));
        }
        for bind in &manifest.binds {
            args.push("-v".into());
            args.push(bind.render());
        }
        for (key, value) in &manifest.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(manifest.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.checked(&arg_refs, "run").await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.checked(&["stop", name], "stop").await.map(|_| ())
    }

    async fn rm(&self, name: &str) -> Result<()> {
        self.checked(&["rm", "-f", name], "rm").await.map(|_| ())
    }

    async fn state(&self, name: &str) -> Result<InstanceState> {
        let out = command::run_default(
            self.program,
            &["inspect", "--format", "{{.State.Running}}", name],
        )
        .await?;
        if !out.success() {
            return Ok(InstanceState::Absent);
        }
        Ok(match out.stdout.trim() {
            "true" => InstanceState::Running,
            _ => InstanceState::Present,
        })
    }

    async fn logs_tail(&self, name: &str, lines: u32) -> Result<String> {
        let tail = lines.to_string();
        let out = command::run_default(self.program, &["logs", "--tail", &tail, name]).await?;
        // Engines write container logs to both streams.
        Ok(format!("{}{}", out.stdout, out.stderr))
    }
}

/// What the launcher did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Manifest unchanged and the instance is already running.
    Preserved,
    /// New instance deployed and healthy.
    Deployed,
    /// Start was skipped on request (`--skip-start`).
    Skipped,
}

/// Health polling budget: ~2 minutes worst case.
fn health_policy() -> RetryPolicy {
    RetryPolicy::new(8, Duration::from_secs(1), Duration::from_secs(30))
}

/// Deploy (or preserve) the worker instance.
///
/// `redeploy` comes from the manifest hash gate; when false the running
/// instance is verified and left alone.
pub async fn deploy(
    cli: &dyn EngineCli,
    manifest: &DeploymentManifest,
    redeploy: bool,
) -> Result<LaunchOutcome> {
    deploy_with_policy(cli, manifest, redeploy, health_policy()).await
}

/// Same as [`deploy`] with an explicit health-poll budget.
pub async fn deploy_with_policy(
    cli: &dyn EngineCli,
    manifest: &DeploymentManifest,
    redeploy: bool,
    health: RetryPolicy,
) -> Result<LaunchOutcome> {
    if !redeploy {
        match cli.state(INSTANCE_NAME).await? {
            InstanceState::Running => {
                tracing::info!(
                    "[ServiceLauncher] Manifest unchanged and '{}' running; preserving",
                    INSTANCE_NAME
                );
                return Ok(LaunchOutcome::Preserved);
            }
            state => {
                // Unchanged manifest but no healthy instance: deploy anyway.
                tracing::warn!(
                    "[ServiceLauncher] Manifest unchanged but instance is {:?}; redeploying",
                    state
                );
            }
        }
    }

    // Remove the prior instance only if one exists.
    match cli.state(INSTANCE_NAME).await? {
        InstanceState::Absent => {}
        InstanceState::Running => {
            tracing::info!("[ServiceLauncher] Stopping prior instance '{}'", INSTANCE_NAME);
            cli.stop(INSTANCE_NAME).await?;
            cli.rm(INSTANCE_NAME).await?;
        }
        InstanceState::Present => {
            cli.rm(INSTANCE_NAME).await?;
        }
    }

    cli.pull(&manifest.image).await?;
    cli.run(INSTANCE_NAME, manifest).await?;

    let healthy = wait_until(health, "worker instance running", move || async move {
        matches!(cli.state(INSTANCE_NAME).await, Ok(InstanceState::Running))
    })
    .await;

    if healthy.is_ready() {
        tracing::info!("[ServiceLauncher] '{}' is running", INSTANCE_NAME);
        Ok(LaunchOutcome::Deployed)
    } else {
        let logs = cli
            .logs_tail(INSTANCE_NAME, 40)
            .await
            .unwrap_or_else(|e| format!("(could not capture logs: {})", e));
        tracing::error!(
            "[ServiceLauncher] '{}' never reached running state; recent logs:\n{}",
            INSTANCE_NAME,
            logs
        );
        Err(ProvisionError::LaunchHealthCheckFailure {
            instance: INSTANCE_NAME.to_string(),
            reason: format!("not running after bounded retries; recent logs: {}", logs.trim()),
        })
    }
}
