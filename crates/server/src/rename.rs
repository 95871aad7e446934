//! Thread rename.
//!
//! The worktree directory never moves, so agents keep their working
//! directory. The branch and every derived session are renamed, and a
//! symlink named after the new name points at the unmoved worktree.
//!
//! Order matters: branch, then symlink, then sessions. A failure in the
//! session phase undoes the sessions already renamed, the symlink and the
//! branch, so the record never references names that do not exist.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::ai_naming::{slug_candidates, SlugOutcome};
use crate::error::{CleanupReport, OrchestratorError, Result};
use crate::naming::validate_name;
use crate::orchestrator::{FleetEvent, Orchestrator, PendingCwd, SESSION_ENV};
use crate::process::CommandError;
use crate::session_names::{as_lookup, session_rename_map, temp_session_name};
use crate::thread::Thread;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenameReport {
    pub old_name: String,
    pub new_name: String,
    /// Live sessions renamed (old → new).
    pub renamed_sessions: Vec<(String, String)>,
    /// Dead sessions re-keyed without a tmux rename; recreated later.
    pub skipped_dead: Vec<String>,
    pub symlink: Option<PathBuf>,
    pub cleanup: CleanupReport,
}

/// Where one session is in the two-phase rename.
struct SessionMove {
    original: String,
    temp: String,
    target: String,
    current: String,
}

/// Completed filesystem/git steps, for rollback.
#[derive(Default)]
struct Applied {
    branch: Option<(String, String)>,
    symlink: Option<PathBuf>,
}

impl Orchestrator {
    #[instrument(name = "thread.rename", skip(self))]
    pub async fn rename_thread(&self, thread_id: &str, new_name: &str) -> Result<RenameReport> {
        let _guard = self.lock_thread(thread_id).await;
        self.rename_locked(thread_id, new_name).await
    }

    /// Rename with the thread's lock already held.
    pub(crate) async fn rename_locked(&self, thread_id: &str, new_name: &str) -> Result<RenameReport> {
        // 1. Validate.
        let new_name = validate_name(new_name)?.to_string();
        let thread = self.resolve_thread(Some(thread_id), None)?;
        let old_name = thread.name.clone();
        if new_name == old_name || self.read(|s| s.name_taken(&new_name, None)) {
            return Err(OrchestratorError::DuplicateName(new_name));
        }
        let _reservation = self
            .reserve_name(&new_name)
            .ok_or_else(|| OrchestratorError::DuplicateName(new_name.clone()))?;
        let project = self
            .project_for(&thread)
            .ok_or_else(|| OrchestratorError::ProjectNotFound(thread.project_id.clone()))?;

        // 2. Rename map and collision checks.
        let moves = session_rename_map(&old_name, &new_name, &thread.tmux_session_names);
        self.check_collisions(&thread, &project.repo_path, &new_name, &moves)
            .await?;
        let live: HashSet<String> = self.mux.list_sessions().await?.into_iter().collect();
        let link = (!thread.is_main).then(|| project.worktree_base().join(&new_name));
        if let Some(link) = &link {
            check_link_target(link, &thread.worktree_path).await?;
        }

        let mut applied = Applied::default();

        // 3. Branch.
        if let Some(branch) = thread.branch_name.clone().filter(|b| *b != new_name) {
            self.git
                .rename_branch(&project.repo_path, &branch, &new_name)
                .await?;
            applied.branch = Some((branch, new_name.clone()));
        }

        // 4. Symlink to the unmoved worktree.
        if let Some(link) = &link {
            if *link != thread.worktree_path && tokio::fs::symlink_metadata(link).await.is_err() {
                if let Err(e) = tokio::fs::symlink(&thread.worktree_path, link).await {
                    self.rollback(&project.repo_path, &applied, &mut []).await;
                    return Err(OrchestratorError::io("create rename symlink", e));
                }
                applied.symlink = Some(link.clone());
            }
        }

        // 5. Sessions, two-phase.
        let (live_moves, dead): (Vec<_>, Vec<_>) =
            moves.iter().cloned().partition(|(from, _)| live.contains(from));
        let nonce: String = fleetdock_protocol::new_id().chars().take(8).collect();
        let mut pending: Vec<SessionMove> = live_moves
            .into_iter()
            .enumerate()
            .map(|(i, (original, target))| SessionMove {
                temp: temp_session_name(&nonce, i),
                current: original.clone(),
                original,
                target,
            })
            .collect();

        if let Err(e) = self.move_sessions(&mut pending, |m| m.temp.clone()).await {
            self.rollback(&project.repo_path, &applied, &mut pending).await;
            return Err(e.into());
        }
        if let Err(e) = self.move_sessions(&mut pending, |m| m.target.clone()).await {
            self.rollback(&project.repo_path, &applied, &mut pending).await;
            return Err(e.into());
        }

        // 6. Re-key, persist, notify.
        let lookup = as_lookup(&moves);
        self.mutate(|s| {
            if let Some(t) = s.thread_mut(thread_id) {
                t.rekey_sessions(&lookup);
                t.name = new_name.clone();
                if !t.is_main {
                    t.branch_name = Some(new_name.clone());
                }
                t.name_is_generated = false;
            }
            if let Some(focused) = s.focused_session.as_ref().and_then(|f| lookup.get(f)) {
                s.focused_session = Some(focused.clone());
            }
        });
        self.persist().await?;

        let mut report = RenameReport {
            old_name: old_name.clone(),
            new_name: new_name.clone(),
            renamed_sessions: pending
                .iter()
                .map(|m| (m.original.clone(), m.target.clone()))
                .collect(),
            skipped_dead: dead.into_iter().map(|(from, _)| from).collect(),
            symlink: applied.symlink.clone(),
            cleanup: CleanupReport::default(),
        };

        info!(
            component = "rename",
            event = "rename.completed",
            thread_id = %thread_id,
            old_name = %old_name,
            new_name = %new_name,
            sessions = report.renamed_sessions.len(),
            skipped_dead = report.skipped_dead.len(),
            "Thread renamed"
        );
        self.notify(FleetEvent::ThreadRenamed {
            thread_id: thread_id.to_string(),
            old_name: old_name.clone(),
            new_name: new_name.clone(),
        });

        self.after_rename(&thread, &project.worktree_base(), &mut report)
            .await;
        Ok(report)
    }

    async fn check_collisions(
        &self,
        thread: &Thread,
        repo: &Path,
        new_name: &str,
        moves: &[(String, String)],
    ) -> Result<()> {
        // (a) A branch with the target name, unless it is this thread's own.
        if !thread.is_main
            && thread.branch_name.as_deref() != Some(new_name)
            && self.git.branch_exists(repo, new_name).await?
        {
            return Err(OrchestratorError::DuplicateName(new_name.to_string()));
        }

        // (b) Targets colliding with each other or with untouched tabs.
        let moved: HashSet<&str> = moves.iter().map(|(from, _)| from.as_str()).collect();
        let mut targets = HashSet::new();
        for (_, to) in moves {
            let clashes_untouched = thread
                .tmux_session_names
                .iter()
                .any(|s| s == to && !moved.contains(s.as_str()));
            if !targets.insert(to.as_str()) || clashes_untouched {
                return Err(OrchestratorError::DuplicateName(to.clone()));
            }
        }

        // (c) Targets already used by live or recorded sessions elsewhere.
        let live: HashSet<String> = self.mux.list_sessions().await?.into_iter().collect();
        let recorded = self.read(|s| {
            s.active()
                .filter(|t| t.id != thread.id)
                .flat_map(|t| t.tmux_session_names.iter().cloned())
                .collect::<HashSet<_>>()
        });
        for target in targets {
            if (live.contains(target) && !moved.contains(target)) || recorded.contains(target) {
                return Err(OrchestratorError::DuplicateName(target.to_string()));
            }
        }
        Ok(())
    }

    /// Rename every session to `to(move)`. All renames are attempted; the
    /// first error is returned after the others have run.
    async fn move_sessions(
        &self,
        moves: &mut [SessionMove],
        to: impl Fn(&SessionMove) -> String,
    ) -> Result<(), CommandError> {
        let mut first_error = None;
        for m in moves.iter_mut() {
            let target = to(m);
            match self.mux.rename_session(&m.current, &target).await {
                Ok(()) => m.current = target,
                Err(e) => {
                    warn!(
                        component = "rename",
                        event = "rename.session_failed",
                        from = %m.current,
                        to = %target,
                        error = %e,
                        "Session rename failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Undo completed steps in reverse: sessions, symlink, branch.
    async fn rollback(&self, repo: &Path, applied: &Applied, moves: &mut [SessionMove]) {
        let mut report = CleanupReport::default();
        for m in moves.iter_mut().filter(|m| m.current != m.original) {
            match self.mux.rename_session(&m.current, &m.original).await {
                Ok(()) => m.current = m.original.clone(),
                Err(e) => report.record("restore session name", e),
            }
        }
        if let Some(link) = &applied.symlink {
            report.check("remove rename symlink", tokio::fs::remove_file(link).await);
        }
        if let Some((old, new)) = &applied.branch {
            report.check(
                "restore branch name",
                self.git.rename_branch(repo, new, old).await,
            );
        }
        warn!(
            component = "rename",
            event = "rename.rolled_back",
            restored_sessions = moves.len(),
            rollback_failures = report.failures.len(),
            "Rename rolled back"
        );
    }

    /// Best-effort follow-ups once the new name is committed.
    async fn after_rename(&self, before: &Thread, worktree_base: &Path, report: &mut RenameReport) {
        let Some(thread) = self.thread(&before.id) else {
            return;
        };

        for (_, session) in &report.renamed_sessions {
            report.cleanup.check(
                "update session env",
                self.mux.set_env(session, SESSION_ENV, session).await,
            );
            if thread.is_agent_session(session) {
                report.cleanup.check(
                    "re-arm completion hook",
                    self.mux.attach_completion_hook(session).await,
                );
            }
        }

        // New panes in renamed sessions start in tmux's remembered path.
        let deadline = Instant::now() + self.read(|s| s.settings.reconcile.pending_cwd());
        {
            let mut pending = self.pending_cwd.lock();
            for (_, session) in &report.renamed_sessions {
                pending.insert(
                    session.clone(),
                    PendingCwd {
                        path: thread.worktree_path.clone(),
                        deadline,
                    },
                );
            }
        }

        // A link left by an earlier rename now carries a stale name.
        if !before.is_main {
            let previous = worktree_base.join(&before.name);
            if previous != thread.worktree_path && is_link_to(&previous, &thread.worktree_path).await {
                report.cleanup.check(
                    "remove previous rename symlink",
                    tokio::fs::remove_file(&previous).await,
                );
            }
        }
    }

    /// Rename a thread still carrying its generated placeholder name after
    /// the first prompt typed into one of its agent tabs. Returns the new
    /// name when a rename happened.
    pub async fn auto_rename_after_first_prompt(
        &self,
        thread_id: &str,
        session: &str,
        prompt: &str,
    ) -> Option<String> {
        let _claim = self.auto_rename.try_claim(thread_id)?;
        let thread = self.resolve_thread(Some(thread_id), None).ok()?;
        if !thread.name_is_generated || thread.auto_named || !thread.is_agent_session(session) {
            return None;
        }
        self.update_thread(thread_id, |t| t.auto_named = true).ok()?;
        self.persist_quietly("auto_rename").await;

        let timeout = self.read(|s| s.settings.reconcile.slug_timeout());
        let candidates = match slug_candidates(self.slugger.as_ref(), prompt, timeout).await {
            SlugOutcome::Skip => return None,
            SlugOutcome::Candidates(list) => list,
        };

        let _guard = self.lock_thread(thread_id).await;
        for candidate in candidates {
            match self.rename_locked(thread_id, &candidate).await {
                Ok(report) => return Some(report.new_name),
                Err(OrchestratorError::DuplicateName(_)) => continue,
                Err(e) => {
                    debug!(
                        component = "rename",
                        event = "rename.auto_aborted",
                        thread_id = %thread_id,
                        candidate = %candidate,
                        error = %e,
                    );
                    return None;
                }
            }
        }
        None
    }

    /// Rename from a free-text description: the slug generator's name
    /// first, naive slugs of the description after. A generator that
    /// declares the text unnameable (`SLUG: EMPTY`) leaves the name alone.
    pub async fn rename_from_description(
        &self,
        thread_id: &str,
        description: &str,
    ) -> Result<RenameReport> {
        let timeout = self.read(|s| s.settings.reconcile.slug_timeout());
        let candidates = match slug_candidates(self.slugger.as_ref(), description, timeout).await {
            SlugOutcome::Candidates(list) if !list.is_empty() => list,
            _ => return Err(OrchestratorError::NoNameDerivable(description.to_string())),
        };

        let _guard = self.lock_thread(thread_id).await;
        let attempts = candidates.len();
        for candidate in candidates {
            match self.rename_locked(thread_id, &candidate).await {
                Err(OrchestratorError::DuplicateName(_)) => continue,
                other => return other,
            }
        }
        Err(OrchestratorError::NameGenerationFailed { attempts })
    }
}

async fn is_link_to(link: &Path, target: &Path) -> bool {
    matches!(tokio::fs::read_link(link).await, Ok(dest) if dest == target)
}

/// The symlink location must be free or already point at this worktree.
async fn check_link_target(link: &Path, worktree: &Path) -> Result<()> {
    if link == worktree || tokio::fs::symlink_metadata(link).await.is_err() {
        return Ok(());
    }
    if is_link_to(link, worktree).await {
        return Ok(());
    }
    Err(OrchestratorError::DuplicateName(
        link.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFleet;

    #[tokio::test]
    async fn rename_moves_branch_sessions_and_links_worktree() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        fleet.orchestrator.add_tab(&t.id, None).await.unwrap();
        fleet.orchestrator.focus_session("x").await.unwrap();

        let report = fleet.orchestrator.rename_thread(&t.id, "y").await.unwrap();
        assert_eq!(report.renamed_sessions.len(), 2);
        assert!(report.cleanup.is_clean());

        assert!(fleet.git.has_branch("y"));
        assert!(!fleet.git.has_branch("x"));
        // The directory did not move; a link named after the new name points at it.
        let old_dir = fleet.repo.join("worktrees/x");
        let link = fleet.repo.join("worktrees/y");
        assert!(old_dir.is_dir());
        assert_eq!(std::fs::read_link(&link).unwrap(), old_dir);

        assert!(fleet.mux.is_live("y") && fleet.mux.is_live("y_2"));
        assert!(!fleet.mux.is_live("x"));
        assert_eq!(fleet.mux.env_of("y", SESSION_ENV).as_deref(), Some("y"));

        let renamed = fleet.orchestrator.resolve_thread(Some(&t.id), None).unwrap();
        assert_eq!(renamed.name, "y");
        assert_eq!(renamed.branch_name.as_deref(), Some("y"));
        assert_eq!(renamed.tmux_session_names, vec!["y", "y_2"]);
        assert!(renamed.is_agent_session("y"));
        assert_eq!(renamed.last_selected_session.as_deref(), Some("y"));
        assert_eq!(renamed.worktree_path, old_dir);

        // Completion signals for the new name resolve back to the thread.
        assert_eq!(
            fleet.orchestrator.thread_for_session("y").map(|t| t.id),
            Some(t.id.clone())
        );
        assert!(fleet.orchestrator.pending_cwd.lock().contains_key("y"));
    }

    #[tokio::test]
    async fn rename_to_own_name_is_duplicate() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        assert!(matches!(
            fleet.orchestrator.rename_thread(&t.id, "x").await,
            Err(OrchestratorError::DuplicateName(name)) if name == "x"
        ));
    }

    #[tokio::test]
    async fn rename_to_other_threads_name_is_duplicate() {
        let fleet = TestFleet::new().await;
        let a = fleet.create("webapp", Some("a")).await;
        fleet.create("webapp", Some("b")).await;
        assert!(matches!(
            fleet.orchestrator.rename_thread(&a.id, "b").await,
            Err(OrchestratorError::DuplicateName(_))
        ));
        assert!(fleet.git.has_branch("a"));
    }

    #[tokio::test]
    async fn rename_rejects_invalid_names_and_foreign_branches() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        assert!(matches!(
            fleet.orchestrator.rename_thread(&t.id, "a/b").await,
            Err(OrchestratorError::InvalidName(_))
        ));
        assert!(matches!(
            fleet.orchestrator.rename_thread(&t.id, "").await,
            Err(OrchestratorError::InvalidName(_))
        ));
        fleet.git.add_branch("taken");
        assert!(matches!(
            fleet.orchestrator.rename_thread(&t.id, "taken").await,
            Err(OrchestratorError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn rename_rejects_live_session_collision() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        fleet.mux.spawn_stray("y");
        assert!(matches!(
            fleet.orchestrator.rename_thread(&t.id, "y").await,
            Err(OrchestratorError::DuplicateName(_))
        ));
        assert!(fleet.git.has_branch("x"));
    }

    #[tokio::test]
    async fn partial_session_failure_rolls_everything_back() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        fleet.orchestrator.add_tab(&t.id, None).await.unwrap();
        fleet.orchestrator.add_tab(&t.id, None).await.unwrap();
        fleet.mux.fail_rename_from("x_2");

        let err = fleet.orchestrator.rename_thread(&t.id, "y").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Command(_)));

        // Sessions 1 and 3 were renamed to temps and then restored.
        let renames: Vec<String> = fleet
            .mux
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("rename:"))
            .collect();
        assert!(renames.iter().any(|c| c.starts_with("rename:x->")));
        assert!(renames.iter().any(|c| c.starts_with("rename:x_3->")));
        for session in ["x", "x_2", "x_3"] {
            assert!(fleet.mux.is_live(session), "{session} should be restored");
        }
        assert!(!fleet.mux.is_live("y"));

        let after = fleet.orchestrator.resolve_thread(Some(&t.id), None).unwrap();
        assert_eq!(after.name, "x");
        assert_eq!(after.branch_name.as_deref(), Some("x"));
        assert_eq!(after.tmux_session_names, vec!["x", "x_2", "x_3"]);
        assert!(fleet.git.has_branch("x"));
        assert!(!fleet.git.has_branch("y"));
        assert!(std::fs::symlink_metadata(fleet.repo.join("worktrees/y")).is_err());
        assert!(fleet.orchestrator.read(|s| !s.name_taken("y", None)));
    }

    #[tokio::test]
    async fn dead_sessions_are_rekeyed_not_renamed() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        fleet.orchestrator.add_tab(&t.id, None).await.unwrap();
        fleet.mux.kill_externally("x_2");

        let report = fleet.orchestrator.rename_thread(&t.id, "y").await.unwrap();
        assert_eq!(report.skipped_dead, vec!["x_2"]);
        let after = fleet.orchestrator.resolve_thread(Some(&t.id), None).unwrap();
        assert_eq!(after.tmux_session_names, vec!["y", "y_2"]);
        assert!(!fleet.mux.is_live("y_2"));
    }

    #[tokio::test]
    async fn second_rename_replaces_stale_link() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        fleet.orchestrator.rename_thread(&t.id, "y").await.unwrap();
        let report = fleet.orchestrator.rename_thread(&t.id, "z").await.unwrap();
        assert!(report.cleanup.is_clean());
        assert!(std::fs::symlink_metadata(fleet.repo.join("worktrees/y")).is_err());
        assert_eq!(
            std::fs::read_link(fleet.repo.join("worktrees/z")).unwrap(),
            fleet.repo.join("worktrees/x")
        );
    }

    #[tokio::test]
    async fn rename_from_description_uses_slug() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        fleet.slugger.set_reply("SLUG: fix-auth-flow");
        let report = fleet
            .orchestrator
            .rename_from_description(&t.id, "the auth flow is broken")
            .await
            .unwrap();
        assert_eq!(report.new_name, "fix-auth-flow");
    }

    #[tokio::test]
    async fn rename_from_description_keeps_name_on_empty_slug() {
        let fleet = TestFleet::new().await;
        fleet.slugger.set_reply("SLUG: EMPTY");
        let t = fleet.create("webapp", Some("x")).await;
        let result = fleet
            .orchestrator
            .rename_from_description(&t.id, "why is CI red?")
            .await;
        assert!(
            matches!(result, Err(OrchestratorError::NoNameDerivable(_))),
            "{result:?}"
        );
        assert_eq!(fleet.orchestrator.thread(&t.id).unwrap().name, "x");
        assert!(fleet.git.has_branch("x"));
        assert!(fleet.mux.is_live("x"));
    }

    #[tokio::test]
    async fn rename_from_description_falls_back_to_naive() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        let report = fleet
            .orchestrator
            .rename_from_description(&t.id, "Add retry logic")
            .await
            .unwrap();
        assert_eq!(report.new_name, "add-retry-logic");
    }

    #[tokio::test]
    async fn auto_rename_runs_once_for_generated_names() {
        let fleet = TestFleet::new().await;
        fleet.slugger.set_reply("SLUG: add-retry-logic");
        let t = fleet.create("webapp", None).await;
        let session = t.tmux_session_names[0].clone();

        let got = fleet
            .orchestrator
            .auto_rename_after_first_prompt(&t.id, &session, "Add retry logic to the client")
            .await;
        assert_eq!(got.as_deref(), Some("add-retry-logic"));

        let again = fleet
            .orchestrator
            .auto_rename_after_first_prompt(&t.id, "add-retry-logic", "something else")
            .await;
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn auto_rename_falls_through_duplicate_candidates() {
        let fleet = TestFleet::new().await;
        fleet.create("webapp", Some("add-retry-logic")).await;
        fleet.slugger.set_reply("SLUG: add-retry-logic");
        let t = fleet.create("webapp", None).await;
        let session = t.tmux_session_names[0].clone();

        let got = fleet
            .orchestrator
            .auto_rename_after_first_prompt(&t.id, &session, "Add retry logic")
            .await;
        assert_eq!(got.as_deref(), Some("add-retry-logic-2"));
    }

    #[tokio::test]
    async fn auto_rename_skips_questions_and_user_named_threads() {
        let fleet = TestFleet::new().await;
        fleet.slugger.set_reply("SLUG: EMPTY");
        let t = fleet.create("webapp", None).await;
        let session = t.tmux_session_names[0].clone();
        assert!(fleet
            .orchestrator
            .auto_rename_after_first_prompt(&t.id, &session, "why is CI red?")
            .await
            .is_none());
        assert_eq!(
            fleet.orchestrator.resolve_thread(Some(&t.id), None).unwrap().name,
            t.name
        );

        fleet.slugger.set_reply("SLUG: anything");
        let named = fleet.create("webapp", Some("chosen")).await;
        assert!(fleet
            .orchestrator
            .auto_rename_after_first_prompt(&named.id, "chosen", "do things")
            .await
            .is_none());
    }
}
