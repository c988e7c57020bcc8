//! Subprocess execution with captured output and a hard timeout.
//!
//! Every external CLI (package managers, systemctl, the container engine)
//! goes through here, so there is exactly one place that spawns processes
//! and one timeout policy.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::ProvisionError;

/// Default ceiling for external commands. Package installs can be slow;
/// callers with tighter bounds pass their own duration.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, for one-line error summaries.
    pub fn last_stderr_line(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output")
    }
}

/// Run `program` with `args`, capturing stdout/stderr.
///
/// Returns `Ok` even on non-zero exit; callers inspect `exit_code`.
/// Spawn failures and timeouts map to [`ProvisionError::Command`].
pub async fn run(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CmdOutput, ProvisionError> {
    tracing::debug!("[CommandRunner] {} {}", program, args.join(" "));

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ProvisionError::Command(format!(
                "Failed to spawn '{}': {}",
                program, e
            )));
        }
        Err(_) => {
            return Err(ProvisionError::Command(format!(
                "'{}' timed out after {:?}",
                program, timeout
            )));
        }
    };

    let result = CmdOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if !result.success() {
        tracing::debug!(
            "[CommandRunner] '{}' exited {}: {}",
            program,
            result.exit_code,
            result.last_stderr_line()
        );
    }

    Ok(result)
}

/// Run with the default timeout.
pub async fn run_default(program: &str, args: &[&str]) -> Result<CmdOutput, ProvisionError> {
    run(program, args, DEFAULT_COMMAND_TIMEOUT).await
}
