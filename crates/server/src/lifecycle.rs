//! Archive, delete and worktree recovery.
//!
//! Archive and delete commit the model change, persist and notify first;
//! killing sessions and removing the worktree happen afterwards and only
//! contribute to the returned `CleanupReport`.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::error::{CleanupReport, OrchestratorError, Result};
use crate::orchestrator::{FleetEvent, Orchestrator, THREAD_ID_ENV};
use crate::session_names::tab_session_name;
use crate::thread::Thread;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverOutcome {
    Recovered,
    /// The project's repository root is gone; nothing to attach to.
    MainThreadMissing,
    ProjectNotFound,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Archive { automatic: bool },
    Delete,
}

impl Orchestrator {
    #[instrument(name = "thread.archive", skip(self))]
    pub async fn archive_thread(&self, thread_id: &str) -> Result<CleanupReport> {
        let _guard = self.lock_thread(thread_id).await;
        self.remove_locked(thread_id, Removal::Archive { automatic: false })
            .await
    }

    /// Archive a thread whose worktree vanished underneath it. The caller
    /// prunes the repository's worktree registrations.
    pub(crate) async fn archive_missing(&self, thread_id: &str) -> Result<CleanupReport> {
        let _guard = self.lock_thread(thread_id).await;
        self.remove_locked(thread_id, Removal::Archive { automatic: true })
            .await
    }

    #[instrument(name = "thread.delete", skip(self))]
    pub async fn delete_thread(&self, thread_id: &str) -> Result<CleanupReport> {
        let report = {
            let _guard = self.lock_thread(thread_id).await;
            self.remove_locked(thread_id, Removal::Delete).await?
        };
        self.forget_thread_lock(thread_id);
        Ok(report)
    }

    async fn remove_locked(&self, thread_id: &str, removal: Removal) -> Result<CleanupReport> {
        let thread = self.resolve_thread(Some(thread_id), None)?;
        if thread.is_main {
            return Err(OrchestratorError::CannotDeleteMainThread);
        }
        let project = self.project_for(&thread);

        self.mutate(|s| {
            if s
                .focused_session
                .as_deref()
                .is_some_and(|f| thread.has_session(f))
            {
                s.focused_session = None;
            }
            match removal {
                Removal::Delete => s.threads.retain(|t| t.id != thread.id),
                Removal::Archive { .. } => {
                    if let Some(t) = s.thread_mut(&thread.id) {
                        t.is_archived = true;
                        t.is_pinned = false;
                        t.clear_sessions();
                    }
                }
            }
        });
        {
            let mut pending = self.pending_cwd.lock();
            for session in &thread.tmux_session_names {
                pending.remove(session);
            }
        }
        self.persist().await?;

        let event = match removal {
            Removal::Delete => "lifecycle.thread_deleted",
            Removal::Archive { .. } => "lifecycle.thread_archived",
        };
        info!(
            component = "lifecycle",
            event,
            thread_id = %thread.id,
            name = %thread.name,
            "Thread removed from the active list"
        );
        self.notify(match removal {
            Removal::Delete => FleetEvent::ThreadDeleted {
                thread_id: thread.id.clone(),
            },
            Removal::Archive { automatic } => FleetEvent::ThreadArchived {
                thread_id: thread.id.clone(),
                automatic,
            },
        });

        let mut report = self.kill_sessions(&thread.tmux_session_names).await;
        if let Some(project) = &project {
            let automatic = matches!(removal, Removal::Archive { automatic: true });
            if !automatic && tokio::fs::symlink_metadata(&thread.worktree_path).await.is_ok() {
                report.check(
                    "remove worktree",
                    self.git
                        .remove_worktree(&project.repo_path, &thread.worktree_path)
                        .await,
                );
            }
            if removal == Removal::Delete {
                if let Some(branch) = &thread.branch_name {
                    report.check(
                        "delete branch",
                        self.git.delete_branch(&project.repo_path, branch).await,
                    );
                }
            }
            report.merge(sweep_broken_links(&project.worktree_base()).await);
        }
        report.merge(self.sweep_orphans().await);
        Ok(report)
    }

    async fn kill_sessions(&self, sessions: &[String]) -> CleanupReport {
        let mut report = CleanupReport::default();
        let live: HashSet<String> = match self.mux.list_sessions().await {
            Ok(live) => live.into_iter().collect(),
            Err(e) => {
                report.record("list sessions", e);
                return report;
            }
        };
        for session in sessions.iter().filter(|s| live.contains(*s)) {
            report.check("kill session", self.mux.kill_session(session).await);
        }
        report
    }

    /// Kill live sessions tagged with a thread id that is no longer active.
    /// Untagged sessions belong to the user and are never touched.
    pub(crate) async fn sweep_orphans(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let live = match self.mux.list_sessions().await {
            Ok(live) => live,
            Err(e) => {
                report.record("list sessions", e);
                return report;
            }
        };
        let (recorded, active): (HashSet<String>, HashSet<String>) = self.read(|s| {
            (
                s.recorded_sessions(),
                s.active().map(|t| t.id.clone()).collect(),
            )
        });

        let mut killed = 0;
        for session in live.iter().filter(|s| !recorded.contains(*s)) {
            let owner = match self.mux.get_env(session, THREAD_ID_ENV).await {
                Ok(owner) => owner,
                Err(e) => {
                    debug!(
                        component = "lifecycle",
                        event = "lifecycle.orphan_check_failed",
                        session = %session,
                        error = %e,
                    );
                    continue;
                }
            };
            if owner.is_some_and(|id| !active.contains(&id)) {
                report.check("kill orphaned session", self.mux.kill_session(session).await);
                killed += 1;
            }
        }
        if killed > 0 {
            info!(
                component = "lifecycle",
                event = "lifecycle.orphans_killed",
                killed,
                "Killed orphaned sessions"
            );
        }
        report
    }

    /// Bring back the worktree of a thread whose directory disappeared.
    /// Archived threads come back active with a fresh primary tab.
    #[instrument(name = "thread.recover", skip(self))]
    pub async fn recover_worktree(&self, thread_id: &str) -> Result<RecoverOutcome> {
        let _guard = self.lock_thread(thread_id).await;
        let thread = self.resolve_record(Some(thread_id), None)?;
        let Some(project) = self.project_for(&thread) else {
            return Ok(RecoverOutcome::ProjectNotFound);
        };
        if thread.is_main {
            return Ok(if project.repo_path.is_dir() {
                RecoverOutcome::Recovered
            } else {
                RecoverOutcome::MainThreadMissing
            });
        }

        let outcome = match self.recover_locked(&thread, &project.repo_path).await {
            Ok(()) => RecoverOutcome::Recovered,
            Err(e) => {
                warn!(
                    component = "lifecycle",
                    event = "lifecycle.recover_failed",
                    thread_id = %thread.id,
                    error = %e,
                    "Worktree recovery failed"
                );
                RecoverOutcome::Failed(e.to_string())
            }
        };
        Ok(outcome)
    }

    async fn recover_locked(&self, thread: &Thread, repo: &Path) -> Result<()> {
        if thread.is_archived && self.read(|s| s.name_taken(&thread.name, Some(&thread.id))) {
            return Err(OrchestratorError::DuplicateName(thread.name.clone()));
        }
        let existing = thread.worktree_path.is_dir();
        if existing {
            self.check_worktree_owner(thread).await?;
        }

        self.git.prune_worktrees(repo).await?;
        let stale = self.kill_sessions(&thread.tmux_session_names).await;
        if !stale.is_clean() {
            debug!(
                component = "lifecycle",
                event = "lifecycle.stale_sessions",
                failures = stale.failures.len(),
            );
        }

        if !existing {
            if let Some(parent) = thread.worktree_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| OrchestratorError::io("create worktree base", e))?;
            }
            let branch = thread.branch_name.clone().unwrap_or_else(|| thread.name.clone());
            if self.git.branch_exists(repo, &branch).await? {
                self.git
                    .attach_worktree(repo, &thread.worktree_path, &branch)
                    .await?;
            } else {
                let base = match &thread.base_branch {
                    Some(base) => base.clone(),
                    None => match self.project_for(thread) {
                        Some(project) => self.base_branch(&project).await,
                        None => "main".to_string(),
                    },
                };
                self.git
                    .create_worktree(repo, &thread.worktree_path, &branch, &base)
                    .await?;
            }
        }

        let sessions = if thread.is_archived {
            let session = tab_session_name(&thread.name, 1);
            let agent = thread
                .selected_agent_type
                .as_deref()
                .and_then(|id| self.read(|s| s.settings.agent(id).cloned()));
            if let Some(agent) = &agent {
                self.pretrust(agent, &thread.worktree_path).await;
            }
            self.start_session(thread, &session, agent.as_ref()).await?;
            self.mutate(|s| {
                if let Some(t) = s.thread_mut(&thread.id) {
                    t.is_archived = false;
                    t.push_session(&session, agent.is_some());
                }
            });
            Vec::new()
        } else {
            thread.tmux_session_names.clone()
        };
        self.persist().await?;

        for session in sessions {
            if let Err(e) = self.recreate_session(&thread.id, &session).await {
                warn!(
                    component = "lifecycle",
                    event = "lifecycle.recover_session_failed",
                    session = %session,
                    error = %e,
                    "Session could not be recreated after recovery"
                );
            }
        }
        info!(
            component = "lifecycle",
            event = "lifecycle.worktree_recovered",
            thread_id = %thread.id,
            path = %thread.worktree_path.display(),
            "Worktree recovered"
        );
        Ok(())
    }

    /// An existing directory is only reused when no other active thread owns
    /// it and it has the thread's branch checked out.
    async fn check_worktree_owner(&self, thread: &Thread) -> Result<()> {
        let conflict = |reason: String| OrchestratorError::WorktreeConflict {
            path: thread.worktree_path.display().to_string(),
            reason,
        };
        let owner = self.read(|s| {
            s.active()
                .find(|t| t.id != thread.id && t.worktree_path == thread.worktree_path)
                .map(|t| t.name.clone())
        });
        if let Some(owner) = owner {
            return Err(conflict(format!("in use by thread {owner}")));
        }
        let expected = thread.branch_name.as_deref().unwrap_or(&thread.name);
        match self.git.current_branch(&thread.worktree_path).await? {
            Some(head) if head == expected => Ok(()),
            Some(head) => Err(conflict(format!("{head} is checked out, expected {expected}"))),
            None => Err(conflict(format!("detached HEAD, expected {expected}"))),
        }
    }
}

/// Remove symlinks under `base` whose target no longer exists.
pub(crate) async fn sweep_broken_links(base: &Path) -> CleanupReport {
    let mut report = CleanupReport::default();
    let Ok(mut entries) = tokio::fs::read_dir(base).await else {
        return report;
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                report.record("read worktree base", e);
                break;
            }
        };
        let path = entry.path();
        let is_link = entry.file_type().await.is_ok_and(|t| t.is_symlink());
        // `try_exists` follows the link.
        if is_link && !tokio::fs::try_exists(&path).await.unwrap_or(true) {
            report.check("remove broken symlink", tokio::fs::remove_file(&path).await);
        }
    }
    report
}
