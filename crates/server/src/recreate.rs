//! Session start and recreation.
//!
//! A live session is only replaced when it no longer belongs to its thread;
//! a shell that merely wandered off the worktree is sent back with `cd`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::AgentConfig;
use crate::error::{OrchestratorError, Result};
use crate::mux::SessionSpec;
use crate::orchestrator::{Orchestrator, THREAD_ID_ENV};
use crate::process::CommandError;
use crate::thread::Thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateOutcome {
    /// Live and pointing at the right thread; nothing done.
    Alive,
    /// Live, but panes were moved back into the worktree.
    CorrectedCwd,
    Recreated,
    /// Another recreation of the same session is in flight.
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionContext {
    Match,
    /// Same thread, working directory outside the worktree.
    Drifted,
    Mismatch,
}

/// `path` lies inside the thread's directory. For the main thread (bound to
/// the repo root) the worktree base of sibling threads does not count.
fn path_belongs(thread: &Thread, path: &Path, worktree_base: Option<&Path>) -> bool {
    if !path.starts_with(&thread.worktree_path) {
        return false;
    }
    match (thread.is_main, worktree_base) {
        (true, Some(base)) => !path.starts_with(base),
        _ => true,
    }
}

impl Orchestrator {
    /// Command typed into a new tab: the configured terminal injection, then
    /// the agent's start command.
    pub(crate) fn session_spec(
        &self,
        thread: &Thread,
        session: &str,
        agent: Option<&AgentConfig>,
    ) -> SessionSpec {
        let injection = self
            .read(|s| s.settings.terminal_injection.clone())
            .filter(|i| !i.trim().is_empty());
        let command = match (injection, agent) {
            (Some(inject), Some(agent)) => Some(format!("{inject}; {}", agent.start_command)),
            (Some(inject), None) => Some(inject),
            (None, Some(agent)) => Some(agent.start_command.clone()),
            (None, None) => None,
        };
        SessionSpec {
            name: session.to_string(),
            cwd: thread.worktree_path.clone(),
            command,
            env: self.session_env(thread, session),
        }
    }

    /// Create a tab session, arm completion detection for agents and queue
    /// the agent context injection.
    pub(crate) async fn start_session(
        &self,
        thread: &Thread,
        session: &str,
        agent: Option<&AgentConfig>,
    ) -> Result<(), CommandError> {
        let spec = self.session_spec(thread, session, agent);
        self.mux.create_session(&spec).await?;

        let Some(agent) = agent else {
            return Ok(());
        };
        if let Err(e) = self.mux.attach_completion_hook(session).await {
            warn!(
                component = "recreate",
                event = "recreate.hook_failed",
                session = %session,
                error = %e,
                "Failed to attach completion hook"
            );
        }

        let (context, delay) = self.read(|s| {
            (
                s.settings.agent_context_injection.clone(),
                s.settings.reconcile.injection_delay(),
            )
        });
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            let mux = Arc::clone(&self.mux);
            let session = session.to_string();
            let agent_id = agent.id.clone();
            tokio::spawn(async move {
                // Give the agent time to draw its input box.
                tokio::time::sleep(delay * 2).await;
                let sent = match mux.send_text(&session, &context).await {
                    Ok(()) => mux.send_enter(&session).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!(
                        component = "recreate",
                        event = "recreate.injection_failed",
                        session = %session,
                        agent = %agent_id,
                        error = %e,
                        "Failed to send agent context"
                    );
                }
            });
        }
        Ok(())
    }

    /// Agent that runs in `session`: the thread's selected agent for agent
    /// tabs, nothing for plain shells.
    pub(crate) fn agent_for(&self, thread: &Thread, session: &str) -> Option<AgentConfig> {
        if !thread.is_agent_session(session) {
            return None;
        }
        self.read(|s| {
            thread
                .selected_agent_type
                .as_deref()
                .and_then(|id| s.settings.agent(id))
                .or_else(|| {
                    s.settings
                        .default_agent
                        .as_deref()
                        .and_then(|id| s.settings.agent(id))
                })
                .cloned()
        })
    }

    fn worktree_base_for(&self, thread: &Thread) -> Option<PathBuf> {
        self.project_for(thread).map(|p| p.worktree_base())
    }

    /// Pane directory first, then the session's thread id variable, then the
    /// session's own start directory.
    pub(crate) async fn session_context(
        &self,
        thread: &Thread,
        session: &str,
    ) -> Result<SessionContext, CommandError> {
        let base = self.worktree_base_for(thread);
        if let Some(pane) = self.mux.active_pane(session).await? {
            if path_belongs(thread, &pane.path, base.as_deref()) {
                return Ok(SessionContext::Match);
            }
        }
        if let Some(owner) = self.mux.get_env(session, THREAD_ID_ENV).await? {
            return Ok(if owner == thread.id {
                SessionContext::Drifted
            } else {
                SessionContext::Mismatch
            });
        }
        match self.mux.session_path(session).await? {
            Some(path) if path == thread.worktree_path => Ok(SessionContext::Drifted),
            _ => Ok(SessionContext::Mismatch),
        }
    }

    /// Make `session` of `thread_id` live and pointing at its thread.
    #[instrument(name = "thread.recreate_session", skip(self))]
    pub async fn recreate_session(&self, thread_id: &str, session: &str) -> Result<RecreateOutcome> {
        let Some(_claim) = self.recreating.try_claim(session) else {
            return Ok(RecreateOutcome::InProgress);
        };
        let thread = self.resolve_thread(Some(thread_id), None)?;
        if !thread.has_session(session) {
            return Err(OrchestratorError::SessionNotFound(session.to_string()));
        }

        if self.mux.has_session(session).await? {
            match self.session_context(&thread, session).await? {
                SessionContext::Match => return Ok(RecreateOutcome::Alive),
                SessionContext::Drifted => {
                    let fixed = self
                        .mux
                        .enforce_pane_cwd(session, &thread.worktree_path)
                        .await?;
                    debug!(
                        component = "recreate",
                        event = "recreate.cwd_corrected",
                        session = %session,
                        corrected = fixed.corrected,
                        remaining = fixed.remaining,
                    );
                    return Ok(RecreateOutcome::CorrectedCwd);
                }
                SessionContext::Mismatch => {
                    warn!(
                        component = "recreate",
                        event = "recreate.context_mismatch",
                        session = %session,
                        thread = %thread.name,
                        "Session belongs elsewhere, replacing it"
                    );
                    self.mux.kill_session(session).await?;
                }
            }
        }

        let agent = self.agent_for(&thread, session);
        self.start_session(&thread, session, agent.as_ref()).await?;
        info!(
            component = "recreate",
            event = "recreate.session_recreated",
            thread_id = %thread.id,
            session = %session,
            agent = ?agent.as_ref().map(|a| a.id.as_str()),
            "Session recreated"
        );
        Ok(RecreateOutcome::Recreated)
    }
}
