//! Subprocess execution for git/tmux/agent commands.
//!
//! Every collaborator call goes through `run_command`, which captures
//! stdout + stderr, enforces a timeout, and turns a non-zero exit into a
//! structured `CommandError` carrying the command line and its stderr.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Output of a successful command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Trimmed stdout, `None` when empty.
    pub fn text(&self) -> Option<String> {
        let text = self.stdout.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    #[error("`{command}` failed: {stderr}")]
    Failed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },
    #[error("failed to run `{command}`: {message}")]
    Spawn { command: String, message: String },
    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },
}

impl CommandError {
    /// stderr of the failed command (empty for spawn/timeouts).
    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

fn display_command(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.contains(char::is_whitespace) || arg.is_empty() {
            line.push('\'');
            line.push_str(arg);
            line.push('\'');
        } else {
            line.push_str(arg);
        }
    }
    line
}

/// Run `program args…` in `cwd` with the default timeout.
pub async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<CommandOutput, CommandError> {
    run_command_with(program, args, cwd, None, DEFAULT_TIMEOUT).await
}

/// Run a command, optionally feeding `stdin`, and fail after `timeout`.
///
/// The child is spawned with `kill_on_drop`, so dropping the returned
/// future (e.g. the losing side of a `select!`) also kills the process.
pub async fn run_command_with(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let command_line = display_command(program, args);
    let start = Instant::now();

    let result = tokio::time::timeout(timeout, spawn_and_wait(program, args, cwd, stdin)).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(CommandError::Spawn {
                command: command_line,
                message: e.to_string(),
            })
        }
        Err(_) => {
            return Err(CommandError::TimedOut {
                command: command_line,
                timeout,
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    debug!(
        component = "process",
        event = "process.exited",
        command = %command_line,
        exit_code = ?output.status.code(),
        duration_ms,
    );

    if !output.status.success() {
        return Err(CommandError::Failed {
            command: command_line,
            stderr: stderr.trim().to_string(),
            exit_code: output.status.code(),
        });
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        duration_ms,
    })
}

async fn spawn_and_wait(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    stdin: Option<&str>,
) -> Result<std::process::Output, std::io::Error> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn()?;
    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }
    }
    child.wait_with_output().await
}
