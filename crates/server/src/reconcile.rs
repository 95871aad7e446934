//! Reconciliation loop
//!
//! Every tick re-derives live state from git, tmux and the filesystem and
//! folds it back into the thread model. Each step tolerates failures of the
//! others; nothing here returns an error to a caller.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::completion::CompletionDeduper;
use crate::config::ReconcileConfig;
use crate::health::MuxHealth;
use crate::orchestrator::{FleetEvent, Orchestrator};
use crate::pane_classifier::{title_indicates_busy, waiting_reason};
use crate::thread::Thread;

/// Lines of pane text inspected for input prompts.
const CAPTURE_LINES: usize = 40;

/// Worktrees checked at once during the periodic git refresh.
const GIT_REFRESH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    Busy,
    Waiting,
}

pub struct ReconciliationLoop {
    orchestrator: Arc<Orchestrator>,
    health: Arc<MuxHealth>,
    deduper: CompletionDeduper,
    /// Sessions already announced as waiting; cleared when they stop waiting.
    waiting_notified: HashSet<String>,
    ticks: u64,
}

impl ReconciliationLoop {
    pub fn new(orchestrator: Arc<Orchestrator>, health: Arc<MuxHealth>) -> Self {
        let dedup = orchestrator.settings().reconcile.completion_dedup();
        Self {
            orchestrator,
            health,
            deduper: CompletionDeduper::new(dedup),
            waiting_notified: HashSet::new(),
            ticks: 0,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let period = self.orchestrator.settings().reconcile.tick_interval();
        info!(
            component = "reconcile",
            event = "reconcile.started",
            interval_ms = period.as_millis() as u64,
            "Reconciliation loop started"
        );
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
        info!(
            component = "reconcile",
            event = "reconcile.stopped",
            ticks = self.ticks,
            "Reconciliation loop stopped"
        );
    }

    pub async fn tick(&mut self) {
        let config = self.orchestrator.settings().reconcile;
        let started = Instant::now();

        self.sweep_missing_worktrees().await;
        if !self.health.monitor_suspended() {
            self.recreate_dead_sessions().await;
        }
        self.detect_completions().await;
        self.detect_waiting().await;
        self.sync_busy(&config).await;
        self.maintain_hooks().await;
        self.enforce_pending_cwd().await;
        if self.ticks % config.health_every_ticks.max(1) == 0 {
            self.health.check(config.zombie_threshold).await;
        }
        if self.ticks % config.dirty_every_ticks.max(1) == 0 {
            self.refresh_git_state().await;
        }
        self.deduper.prune(Instant::now());
        self.ticks += 1;

        debug!(
            component = "reconcile",
            event = "reconcile.tick",
            tick = self.ticks,
            elapsed_ms = started.elapsed().as_millis() as u64,
        );
    }

    fn active(&self) -> Vec<Thread> {
        self.orchestrator
            .threads()
            .iter()
            .filter(|t| !t.is_archived)
            .cloned()
            .collect()
    }

    /// Set or clear a runtime flag. Sessions renamed away in the meantime
    /// are left alone.
    fn set_flag(&self, thread_id: &str, session: &str, flag: Flag, on: bool) {
        let result = self.orchestrator.update_thread(thread_id, |t| {
            if on && !t.has_session(session) {
                return;
            }
            let set = match flag {
                Flag::Busy => &mut t.busy_sessions,
                Flag::Waiting => &mut t.waiting_sessions,
            };
            if on {
                set.insert(session.to_string());
            } else {
                set.remove(session);
            }
        });
        if let Err(e) = result {
            debug!(
                component = "reconcile",
                event = "reconcile.flag_skipped",
                thread_id = %thread_id,
                error = %e,
            );
        }
    }

    // 1. Worktrees removed behind our back archive their thread.
    async fn sweep_missing_worktrees(&mut self) {
        let mut repos: HashMap<String, PathBuf> = HashMap::new();
        for thread in self.active().into_iter().filter(|t| !t.is_main) {
            if tokio::fs::try_exists(&thread.worktree_path).await.unwrap_or(true) {
                continue;
            }
            warn!(
                component = "reconcile",
                event = "reconcile.worktree_missing",
                thread_id = %thread.id,
                path = %thread.worktree_path.display(),
                "Worktree vanished, archiving thread"
            );
            if let Err(e) = self.orchestrator.archive_missing(&thread.id).await {
                warn!(
                    component = "reconcile",
                    event = "reconcile.archive_failed",
                    thread_id = %thread.id,
                    error = %e,
                    "Could not archive thread with missing worktree"
                );
            }
            if let Some(project) = self.orchestrator.project_for(&thread) {
                repos.insert(project.id.clone(), project.repo_path);
            }
        }
        for repo in repos.values() {
            if let Err(e) = self.orchestrator.git.prune_worktrees(repo).await {
                warn!(
                    component = "reconcile",
                    event = "reconcile.prune_failed",
                    repo = %repo.display(),
                    error = %e,
                    "git worktree prune failed"
                );
            }
        }
    }

    // 2. Recorded sessions that died get recreated.
    async fn recreate_dead_sessions(&mut self) {
        let live: HashSet<String> = match self.orchestrator.mux.list_sessions().await {
            Ok(live) => live.into_iter().collect(),
            Err(e) => {
                warn!(
                    component = "reconcile",
                    event = "reconcile.list_failed",
                    error = %e,
                    "Could not list tmux sessions"
                );
                return;
            }
        };

        for thread in self.active() {
            let dead: Vec<String> = thread
                .tmux_session_names
                .iter()
                .filter(|s| !live.contains(*s))
                .cloned()
                .collect();
            if dead.is_empty() {
                continue;
            }
            // A rename or tab change in progress moves sessions on purpose.
            let Some(_guard) = self.orchestrator.try_lock_thread(&thread.id) else {
                continue;
            };
            info!(
                component = "reconcile",
                event = "reconcile.dead_sessions",
                thread_id = %thread.id,
                sessions = ?dead,
                "Recreating dead sessions"
            );
            self.orchestrator.notify(FleetEvent::DeadSessionsDetected {
                thread_id: thread.id.clone(),
                sessions: dead.clone(),
            });
            for session in dead {
                if let Err(e) = self.orchestrator.recreate_session(&thread.id, &session).await {
                    warn!(
                        component = "reconcile",
                        event = "reconcile.recreate_failed",
                        session = %session,
                        error = %e,
                        "Session recreation failed"
                    );
                }
            }
        }
    }

    // 3. Agent turn completions from the hook log.
    async fn detect_completions(&mut self) {
        let events = match self.orchestrator.mux.drain_completion_events().await {
            Ok(events) => events,
            Err(e) => {
                debug!(
                    component = "reconcile",
                    event = "reconcile.drain_failed",
                    error = %e,
                );
                return;
            }
        };

        let mut changed = false;
        let now = Instant::now();
        for event in events {
            if !self.deduper.accept(&event.session, now) {
                continue;
            }
            let Some(thread) = self.orchestrator.thread_for_session(&event.session) else {
                debug!(
                    component = "reconcile",
                    event = "reconcile.completion_unmatched",
                    session = %event.session,
                );
                continue;
            };
            let unread = self.orchestrator.focused_session().as_deref() != Some(event.session.as_str());
            let updated = self.orchestrator.update_thread(&thread.id, |t| {
                t.busy_sessions.remove(&event.session);
                t.waiting_sessions.remove(&event.session);
                if unread {
                    t.unread_sessions.insert(event.session.clone());
                }
                t.last_agent_completion_at = Some(event.at);
            });
            if updated.is_err() {
                continue;
            }
            self.waiting_notified.remove(&event.session);
            changed = true;

            info!(
                component = "reconcile",
                event = "reconcile.agent_completed",
                thread_id = %thread.id,
                session = %event.session,
                unread,
                "Agent turn completed"
            );
            self.orchestrator.notify(FleetEvent::AgentCompleted {
                thread_id: thread.id.clone(),
                session: event.session,
                unread,
            });
        }
        if changed {
            self.orchestrator.persist_quietly("completion").await;
        }
    }

    // 4. Busy or waiting agent tabs whose pane shows an input prompt.
    async fn detect_waiting(&mut self) {
        for thread in self.active() {
            let candidates: Vec<String> = thread
                .tmux_session_names
                .iter()
                .filter(|s| thread.is_agent_session(s))
                .filter(|s| thread.busy_sessions.contains(*s) || thread.waiting_sessions.contains(*s))
                .cloned()
                .collect();
            for session in candidates {
                let capture = match self
                    .orchestrator
                    .mux
                    .capture_pane(&session, CAPTURE_LINES)
                    .await
                {
                    Ok(capture) => capture,
                    Err(_) => continue,
                };
                let reason = waiting_reason(&capture);
                let was_waiting = thread.waiting_sessions.contains(&session);

                match (reason, was_waiting) {
                    (Some(reason), false) => {
                        self.set_flag(&thread.id, &session, Flag::Waiting, true);
                        self.set_flag(&thread.id, &session, Flag::Busy, false);
                        if self.waiting_notified.insert(session.clone()) {
                            info!(
                                component = "reconcile",
                                event = "reconcile.agent_waiting",
                                thread_id = %thread.id,
                                session = %session,
                                reason = ?reason,
                                "Agent is waiting for input"
                            );
                            self.orchestrator.notify(FleetEvent::AgentWaiting {
                                thread_id: thread.id.clone(),
                                session: session.clone(),
                            });
                        }
                    }
                    (None, true) => {
                        self.set_flag(&thread.id, &session, Flag::Waiting, false);
                        self.waiting_notified.remove(&session);
                    }
                    _ => {}
                }
            }
        }
    }

    // 5. Busy flags from the foreground process and the pane title.
    async fn sync_busy(&mut self, config: &ReconcileConfig) {
        let grace = config.bell_grace();
        let now = Instant::now();
        for thread in self.active() {
            for session in thread.tmux_session_names.iter().filter(|s| thread.is_agent_session(s)) {
                if thread.waiting_sessions.contains(session) {
                    continue;
                }
                let Ok(activity) = self.orchestrator.mux.session_activity(session).await else {
                    continue;
                };
                let recent_bell = self
                    .deduper
                    .last_signal(session)
                    .is_some_and(|at| now.saturating_duration_since(at) < grace);
                let busy = (activity.any_non_idle || title_indicates_busy(&activity.active_title))
                    && !recent_bell;
                if busy != thread.busy_sessions.contains(session) {
                    self.set_flag(&thread.id, session, Flag::Busy, busy);
                }
            }
        }
    }

    // 6. Completion hooks on every live agent tab.
    async fn maintain_hooks(&mut self) {
        let Ok(live) = self.orchestrator.mux.list_sessions().await else {
            return;
        };
        let live: HashSet<String> = live.into_iter().collect();
        for thread in self.active() {
            for session in thread.agent_sessions.iter().filter(|s| live.contains(*s)) {
                if let Err(e) = self.orchestrator.mux.attach_completion_hook(session).await {
                    debug!(
                        component = "reconcile",
                        event = "reconcile.hook_failed",
                        session = %session,
                        error = %e,
                    );
                }
            }
        }
    }

    // 7. Panes of renamed sessions are moved into their worktree.
    async fn enforce_pending_cwd(&mut self) {
        let now = Instant::now();
        let pending: Vec<_> = {
            let mut map = self.orchestrator.pending_cwd.lock();
            map.retain(|_, p| p.deadline > now);
            map.iter().map(|(s, p)| (s.clone(), p.path.clone())).collect()
        };
        for (session, path) in pending {
            match self.orchestrator.mux.enforce_pane_cwd(&session, &path).await {
                Ok(result) if result.remaining == 0 => {
                    self.orchestrator.pending_cwd.lock().remove(&session);
                    if result.corrected > 0 {
                        debug!(
                            component = "reconcile",
                            event = "reconcile.cwd_corrected",
                            session = %session,
                            corrected = result.corrected,
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(
                    component = "reconcile",
                    event = "reconcile.cwd_failed",
                    session = %session,
                    error = %e,
                ),
            }
        }
    }

    // 9. Dirty and fully-delivered flags.
    async fn refresh_git_state(&mut self) {
        let git = &self.orchestrator.git;
        let threads = self.active().into_iter().filter(|t| !t.is_main);
        let results: Vec<_> = stream::iter(threads)
            .map(|thread| async move {
                let dirty = git.is_dirty(&thread.worktree_path).await.unwrap_or(thread.is_dirty);
                let delivered = match &thread.base_branch {
                    Some(base) => git
                        .is_fully_delivered(&thread.worktree_path, base)
                        .await
                        .unwrap_or(thread.is_fully_delivered),
                    None => false,
                };
                (thread, dirty, delivered)
            })
            .buffer_unordered(GIT_REFRESH_CONCURRENCY)
            .collect()
            .await;

        self.apply_git_state(results);
    }

    /// Store refreshed flags; returns how many threads changed. Threads
    /// deleted while git ran are logged and skipped.
    fn apply_git_state(&self, results: Vec<(Thread, bool, bool)>) -> usize {
        let mut applied = 0;
        for (thread, dirty, delivered) in results {
            if dirty == thread.is_dirty && delivered == thread.is_fully_delivered {
                continue;
            }
            let updated = self.orchestrator.update_thread(&thread.id, |t| {
                t.is_dirty = dirty;
                t.is_fully_delivered = delivered;
            });
            match updated {
                Ok(_) => applied += 1,
                Err(e) => warn!(
                    component = "reconcile",
                    event = "reconcile.git_state_dropped",
                    thread_id = %thread.id,
                    error = %e,
                    "Git state refresh lost its thread"
                ),
            }
        }
        applied
    }
}
