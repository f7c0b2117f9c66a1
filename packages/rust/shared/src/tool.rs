//! Time-boxed invocation of external command-line tools.
//!
//! The normalizer, integrity checker, and rasterizer all run through
//! [`run_tool`], so spawning, timeouts, and process cleanup live in one place.

use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::ToolError;

/// A program plus fixed leading arguments, as written in `folio.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

/// Captured result of a finished tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Run `command` with `extra_args`, killing it if it outlives `timeout`.
///
/// A non-zero exit status is *not* an error here; callers decide what a
/// failing status means (a checker's "fail" verdict is a valid answer).
pub async fn run_tool(
    command: &ToolCommand,
    extra_args: &[OsString],
    timeout: Duration,
) -> std::result::Result<ToolOutput, ToolError> {
    debug!(program = %command.program, args = ?extra_args, "running external tool");

    let child = Command::new(&command.program)
        .args(&command.args)
        .args(extra_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ToolError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    // Dropping the future on timeout drops the child, which kills it.
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ToolError::Timeout {
            program: command.program.clone(),
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(|source| ToolError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    Ok(ToolOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Like [`run_tool`], but a non-zero exit status becomes [`ToolError::Failed`].
pub async fn run_tool_checked(
    command: &ToolCommand,
    extra_args: &[OsString],
    timeout: Duration,
) -> std::result::Result<ToolOutput, ToolError> {
    let output = run_tool(command, extra_args, timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(ToolError::Failed {
            program: command.program.clone(),
            status: output.status,
            stderr: output.stderr,
        })
    }
}
