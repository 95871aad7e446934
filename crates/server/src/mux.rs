//! tmux session operations, run through the `tmux` CLI.
//!
//! Session targets always use the `=name` exact-match form so tmux never
//! resolves a name by prefix onto an unrelated session.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::completion::{parse_completion_line, CompletionEvent};
use crate::pane_classifier::is_shell_command;
use crate::process::{run_command, CommandError};

/// Everything needed to (re)create a tab session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSpec {
    pub name: String,
    pub cwd: PathBuf,
    /// Typed into the session's shell after creation; a plain shell when unset.
    pub command: Option<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaneInfo {
    pub pane_id: String,
    pub path: PathBuf,
    pub command: String,
    pub title: String,
    pub active: bool,
}

/// Result of one bulk working-directory enforcement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CwdEnforcement {
    /// Panes that were outside the expected directory and got a `cd`.
    pub corrected: usize,
    /// Panes still outside it (busy with a non-shell program).
    pub remaining: usize,
}

/// Foreground state of a session's panes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionActivity {
    /// Some pane runs something other than an interactive shell.
    pub any_non_idle: bool,
    pub active_title: String,
}

/// Defunct child processes of one tmux server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZombieSample {
    pub server_pid: u32,
    pub zombies: usize,
}

#[async_trait]
pub trait MuxCollaborator: Send + Sync {
    async fn create_session(&self, spec: &SessionSpec) -> Result<(), CommandError>;
    async fn kill_session(&self, name: &str) -> Result<(), CommandError>;
    async fn rename_session(&self, from: &str, to: &str) -> Result<(), CommandError>;
    /// Names of live sessions; empty when no server is running.
    async fn list_sessions(&self) -> Result<Vec<String>, CommandError>;
    async fn has_session(&self, name: &str) -> Result<bool, CommandError>;

    /// Type literal text into the active pane (no Enter).
    async fn send_text(&self, session: &str, text: &str) -> Result<(), CommandError>;
    async fn send_enter(&self, session: &str) -> Result<(), CommandError>;

    async fn set_env(&self, session: &str, key: &str, value: &str) -> Result<(), CommandError>;
    async fn get_env(&self, session: &str, key: &str) -> Result<Option<String>, CommandError>;

    async fn active_pane(&self, session: &str) -> Result<Option<PaneInfo>, CommandError>;
    /// The session's own start directory (`#{session_path}`).
    async fn session_path(&self, session: &str) -> Result<Option<PathBuf>, CommandError>;
    async fn capture_pane(&self, session: &str, lines: usize) -> Result<String, CommandError>;

    /// Attach the bell hook that appends to the completion log. Idempotent.
    async fn attach_completion_hook(&self, session: &str) -> Result<(), CommandError>;
    /// Completion events appended since the previous drain.
    async fn drain_completion_events(&self) -> Result<Vec<CompletionEvent>, CommandError>;

    /// `cd` every shell pane of `session` that sits outside `path`.
    async fn enforce_pane_cwd(
        &self,
        session: &str,
        path: &Path,
    ) -> Result<CwdEnforcement, CommandError>;
    async fn session_activity(&self, session: &str) -> Result<SessionActivity, CommandError>;

    /// Kill the whole tmux server.
    async fn restart_server(&self) -> Result<(), CommandError>;
    async fn zombie_samples(&self) -> Result<Vec<ZombieSample>, CommandError>;
}

const PANE_FORMAT: &str =
    "#{pane_id}\t#{pane_active}\t#{pane_current_path}\t#{pane_current_command}\t#{pane_title}";

/// `MuxCollaborator` backed by the `tmux` binary.
pub struct TmuxCli {
    socket: Option<String>,
    completion_log: PathBuf,
    log_offset: Mutex<u64>,
}

impl TmuxCli {
    /// Events already in the completion log are skipped.
    pub fn new(socket: Option<String>, completion_log: PathBuf) -> Self {
        let offset = std::fs::metadata(&completion_log)
            .map(|m| m.len())
            .unwrap_or(0);
        Self {
            socket,
            completion_log,
            log_offset: Mutex::new(offset),
        }
    }

    async fn tmux(&self, args: &[&str]) -> Result<String, CommandError> {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 2);
        if let Some(socket) = self.socket.as_deref() {
            full.push("-L");
            full.push(socket);
        }
        full.extend_from_slice(args);
        run_command("tmux", &full, None).await.map(|o| o.stdout)
    }

    async fn list_panes(&self, session: &str) -> Result<Vec<PaneInfo>, CommandError> {
        let target = session_target(session);
        let out = self
            .tmux(&["list-panes", "-s", "-t", &target, "-F", PANE_FORMAT])
            .await?;
        Ok(out.lines().filter_map(parse_pane_line).collect())
    }
}

fn session_target(name: &str) -> String {
    format!("={name}")
}

fn pane_target(name: &str) -> String {
    format!("={name}:")
}

fn is_no_server(err: &CommandError) -> bool {
    let stderr = err.stderr();
    stderr.contains("no server running")
        || stderr.contains("error connecting to")
        || stderr.contains("No such file or directory")
}

fn is_missing_session(err: &CommandError) -> bool {
    let stderr = err.stderr();
    is_no_server(err) || stderr.contains("can't find session") || stderr.contains("session not found")
}

fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    let mut parts = line.splitn(5, '\t');
    let pane_id = parts.next()?.to_string();
    let active = parts.next()? == "1";
    let path = PathBuf::from(parts.next()?);
    let command = parts.next()?.to_string();
    let title = parts.next().unwrap_or("").to_string();
    Some(PaneInfo {
        pane_id,
        path,
        command,
        title,
        active,
    })
}

/// Parse `show-environment` output: `KEY=value`, or `-KEY` when unset.
fn parse_env_line(line: &str, key: &str) -> Option<String> {
    let line = line.trim();
    let value = line.strip_prefix(key)?.strip_prefix('=')?;
    Some(value.to_string())
}

/// Count defunct children of `parent` in `ps -A -o ppid=,stat=` output.
fn count_zombies(ps_output: &str, parent: u32) -> usize {
    ps_output
        .lines()
        .filter(|line| {
            let mut cols = line.split_whitespace();
            let ppid = cols.next().and_then(|p| p.parse::<u32>().ok());
            let stat = cols.next().unwrap_or("");
            ppid == Some(parent) && stat.starts_with('Z')
        })
        .count()
}

/// `alert-bell` hook appending `<epoch>\t<session>` to the completion log.
fn bell_hook_command(log: &Path) -> String {
    format!(
        "run-shell \"printf '%s\\t%s\\n' '#{{session_activity}}' '#{{session_name}}' >> {}\"",
        shell_quote(log)
    )
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

#[async_trait]
impl MuxCollaborator for TmuxCli {
    async fn create_session(&self, spec: &SessionSpec) -> Result<(), CommandError> {
        let cwd = spec.cwd.to_string_lossy().to_string();
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args = vec!["new-session", "-d", "-s", spec.name.as_str(), "-c", cwd.as_str()];
        for pair in &env {
            args.push("-e");
            args.push(pair.as_str());
        }
        self.tmux(&args).await?;

        if let Some(command) = spec.command.as_deref() {
            self.send_text(&spec.name, command).await?;
            self.send_enter(&spec.name).await?;
        }
        debug!(
            component = "mux",
            event = "mux.session_created",
            session = %spec.name,
            cwd = %cwd,
        );
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), CommandError> {
        let target = session_target(name);
        match self.tmux(&["kill-session", "-t", &target]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing_session(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rename_session(&self, from: &str, to: &str) -> Result<(), CommandError> {
        let target = session_target(from);
        self.tmux(&["rename-session", "-t", &target, to])
            .await
            .map(drop)
    }

    async fn list_sessions(&self) -> Result<Vec<String>, CommandError> {
        match self.tmux(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(out) => Ok(out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if is_no_server(&e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn has_session(&self, name: &str) -> Result<bool, CommandError> {
        let target = session_target(name);
        match self.tmux(&["has-session", "-t", &target]).await {
            Ok(_) => Ok(true),
            Err(CommandError::Failed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn send_text(&self, session: &str, text: &str) -> Result<(), CommandError> {
        let target = pane_target(session);
        self.tmux(&["send-keys", "-t", &target, "-l", text])
            .await
            .map(drop)
    }

    async fn send_enter(&self, session: &str) -> Result<(), CommandError> {
        let target = pane_target(session);
        self.tmux(&["send-keys", "-t", &target, "Enter"])
            .await
            .map(drop)
    }

    async fn set_env(&self, session: &str, key: &str, value: &str) -> Result<(), CommandError> {
        let target = session_target(session);
        self.tmux(&["set-environment", "-t", &target, key, value])
            .await
            .map(drop)
    }

    async fn get_env(&self, session: &str, key: &str) -> Result<Option<String>, CommandError> {
        let target = session_target(session);
        match self.tmux(&["show-environment", "-t", &target, key]).await {
            Ok(out) => Ok(out.lines().find_map(|l| parse_env_line(l, key))),
            Err(e) if e.stderr().contains("unknown variable") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn active_pane(&self, session: &str) -> Result<Option<PaneInfo>, CommandError> {
        match self.list_panes(session).await {
            Ok(panes) => Ok(panes.into_iter().find(|p| p.active)),
            Err(e) if is_missing_session(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn session_path(&self, session: &str) -> Result<Option<PathBuf>, CommandError> {
        let target = pane_target(session);
        let out = self
            .tmux(&["display-message", "-p", "-t", &target, "#{session_path}"])
            .await?;
        let path = out.trim();
        Ok((!path.is_empty()).then(|| PathBuf::from(path)))
    }

    async fn capture_pane(&self, session: &str, lines: usize) -> Result<String, CommandError> {
        let target = pane_target(session);
        let start = format!("-{lines}");
        self.tmux(&["capture-pane", "-p", "-J", "-t", &target, "-S", &start])
            .await
    }

    async fn attach_completion_hook(&self, session: &str) -> Result<(), CommandError> {
        let target = session_target(session);
        let hook = bell_hook_command(&self.completion_log);
        self.tmux(&["set-hook", "-t", &target, "alert-bell", &hook])
            .await
            .map(drop)
    }

    async fn drain_completion_events(&self) -> Result<Vec<CompletionEvent>, CommandError> {
        let io_err = |e: std::io::Error| CommandError::Spawn {
            command: format!("read {}", self.completion_log.display()),
            message: e.to_string(),
        };
        let mut file = match tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.completion_log)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };

        let mut offset = *self.log_offset.lock();
        let len = file.metadata().await.map_err(io_err)?.len();
        // Truncated or rotated underneath us: start over.
        if len < offset {
            offset = 0;
        }
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).await.map_err(io_err)?;

        // Only consume complete lines.
        let consumed = tail.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        offset += consumed as u64;
        // Fully consumed and nothing appended since: empty the log. Hooks
        // append with O_APPEND, so later writes land at the new end.
        if offset > 0
            && consumed == tail.len()
            && file.metadata().await.map_err(io_err)?.len() == offset
        {
            file.set_len(0).await.map_err(io_err)?;
            offset = 0;
        }
        *self.log_offset.lock() = offset;

        let now = chrono::Utc::now();
        Ok(String::from_utf8_lossy(&tail[..consumed])
            .lines()
            .filter_map(|line| parse_completion_line(line, now))
            .collect())
    }

    async fn enforce_pane_cwd(
        &self,
        session: &str,
        path: &Path,
    ) -> Result<CwdEnforcement, CommandError> {
        let mut result = CwdEnforcement::default();
        for pane in self.list_panes(session).await? {
            if pane.path.starts_with(path) {
                continue;
            }
            if is_shell_command(&pane.command) {
                let cd = format!("cd {}", shell_quote(path));
                self.tmux(&["send-keys", "-t", &pane.pane_id, "-l", &cd])
                    .await?;
                self.tmux(&["send-keys", "-t", &pane.pane_id, "Enter"])
                    .await?;
                result.corrected += 1;
            } else {
                result.remaining += 1;
            }
        }
        Ok(result)
    }

    async fn session_activity(&self, session: &str) -> Result<SessionActivity, CommandError> {
        let panes = self.list_panes(session).await?;
        Ok(SessionActivity {
            any_non_idle: panes.iter().any(|p| !is_shell_command(&p.command)),
            active_title: panes
                .iter()
                .find(|p| p.active)
                .map(|p| p.title.clone())
                .unwrap_or_default(),
        })
    }

    async fn restart_server(&self) -> Result<(), CommandError> {
        match self.tmux(&["kill-server"]).await {
            Ok(_) => Ok(()),
            Err(e) if is_no_server(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn zombie_samples(&self) -> Result<Vec<ZombieSample>, CommandError> {
        let pid = match self.tmux(&["display-message", "-p", "#{pid}"]).await {
            Ok(out) => out.trim().parse::<u32>().ok(),
            Err(e) if is_no_server(&e) => None,
            Err(e) => return Err(e),
        };
        let Some(server_pid) = pid else {
            return Ok(Vec::new());
        };
        let ps = run_command("ps", &["-A", "-o", "ppid=,stat="], None).await?;
        Ok(vec![ZombieSample {
            server_pid,
            zombies: count_zombies(&ps.stdout, server_pid),
        }])
    }
}
