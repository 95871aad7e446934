//! Thread orchestrator
//!
//! Owns the thread model. State lives behind a short-lived `parking_lot`
//! lock that is never held across IO; operations on the same thread id are
//! serialized through a per-thread async mutex, while different threads
//! proceed concurrently. Readers get a lock-free `ArcSwap` snapshot.
//!
//! Tab, rename, lifecycle and recreation operations live in their own
//! modules as further `impl Orchestrator` blocks.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetdock_protocol::{ProjectSummary, ThreadDetail, ThreadSummary};

use crate::agent_trust;
use crate::ai_naming::{InFlight, SlugGenerator};
use crate::config::{AgentConfig, Project, Settings};
use crate::error::{OrchestratorError, Result};
use crate::git::GitCollaborator;
use crate::mux::MuxCollaborator;
use crate::naming::{
    allocate_unique_name, random_base_name, AllocatedName, NameAvailability, MAX_BASE_ATTEMPTS,
};
use crate::persistence::PersistenceCollaborator;
use crate::session_names::{next_tab_session_name, sanitize_session_name, tab_session_name};
use crate::state::FleetState;
use crate::thread::Thread;

pub const THREAD_ID_ENV: &str = "FLEETDOCK_THREAD_ID";
pub const PROJECT_ID_ENV: &str = "FLEETDOCK_PROJECT_ID";
pub const WORKTREE_ENV: &str = "FLEETDOCK_WORKTREE";
pub const SESSION_ENV: &str = "FLEETDOCK_SESSION";

const EVENT_CAPACITY: usize = 256;

/// Observer notifications. Delivery (banners, sounds, badges) is up to the
/// subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    ThreadsChanged,
    ThreadCreated {
        thread_id: String,
        name: String,
    },
    ThreadRenamed {
        thread_id: String,
        old_name: String,
        new_name: String,
    },
    ThreadArchived {
        thread_id: String,
        automatic: bool,
    },
    ThreadDeleted {
        thread_id: String,
    },
    DeadSessionsDetected {
        thread_id: String,
        sessions: Vec<String>,
    },
    AgentCompleted {
        thread_id: String,
        session: String,
        unread: bool,
    },
    AgentWaiting {
        thread_id: String,
        session: String,
    },
    ZombieWarning {
        server_pid: u32,
        zombies: usize,
    },
    MuxRestarted {
        recreated: usize,
    },
}

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub git: Arc<dyn GitCollaborator>,
    pub mux: Arc<dyn MuxCollaborator>,
    pub store: Arc<dyn PersistenceCollaborator>,
    pub slugger: Arc<dyn SlugGenerator>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateThreadRequest {
    /// Project id or name.
    pub project: String,
    pub agent: Option<String>,
    pub name: Option<String>,
    pub prompt: Option<String>,
}

/// Session whose panes should be moved into `path` until `deadline`.
#[derive(Debug, Clone)]
pub(crate) struct PendingCwd {
    pub path: PathBuf,
    pub deadline: Instant,
}

pub struct Orchestrator {
    pub(crate) git: Arc<dyn GitCollaborator>,
    pub(crate) mux: Arc<dyn MuxCollaborator>,
    pub(crate) store: Arc<dyn PersistenceCollaborator>,
    pub(crate) slugger: Arc<dyn SlugGenerator>,
    state: Mutex<FleetState>,
    snapshot: ArcSwap<Vec<Thread>>,
    thread_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    save_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<FleetEvent>,
    pub(crate) auto_rename: InFlight,
    pub(crate) recreating: InFlight,
    pub(crate) pending_cwd: Mutex<HashMap<String, PendingCwd>>,
}

/// Releases a reserved name when dropped.
pub(crate) struct NameReservation<'a> {
    state: &'a Mutex<FleetState>,
    name: String,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.state.lock().release(&self.name);
    }
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, settings: Settings, threads: Vec<Thread>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            git: collaborators.git,
            mux: collaborators.mux,
            store: collaborators.store,
            slugger: collaborators.slugger,
            snapshot: ArcSwap::from_pointee(threads.clone()),
            state: Mutex::new(FleetState::new(settings, threads)),
            thread_locks: DashMap::new(),
            save_lock: tokio::sync::Mutex::new(()),
            events,
            auto_rename: InFlight::default(),
            recreating: InFlight::default(),
            pending_cwd: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub(crate) fn notify(&self, event: FleetEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Lock-free view of every thread record as of the last mutation.
    pub fn threads(&self) -> Arc<Vec<Thread>> {
        self.snapshot.load_full()
    }

    pub fn settings(&self) -> Settings {
        self.state.lock().settings.clone()
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&FleetState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Mutate state, then publish a fresh snapshot and `ThreadsChanged`.
    pub(crate) fn mutate<R>(&self, f: impl FnOnce(&mut FleetState) -> R) -> R {
        let (result, threads) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, state.threads.clone())
        };
        self.snapshot.store(Arc::new(threads));
        self.notify(FleetEvent::ThreadsChanged);
        result
    }

    /// Apply `f` to one thread record and return the updated copy.
    pub(crate) fn update_thread(&self, id: &str, f: impl FnOnce(&mut Thread)) -> Result<Thread> {
        self.mutate(|state| {
            let thread = state
                .thread_mut(id)
                .ok_or_else(|| OrchestratorError::ThreadNotFound(id.to_string()))?;
            f(thread);
            Ok(thread.clone())
        })
    }

    pub(crate) async fn lock_thread(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&*self.thread_locks.entry(id.to_string()).or_default());
        lock.lock_owned().await
    }

    /// The thread's lock if no operation currently holds it.
    pub(crate) fn try_lock_thread(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = Arc::clone(&*self.thread_locks.entry(id.to_string()).or_default());
        lock.try_lock_owned().ok()
    }

    pub(crate) fn forget_thread_lock(&self, id: &str) {
        self.thread_locks.remove(id);
    }

    pub(crate) fn reserve_name(&self, name: &str) -> Option<NameReservation<'_>> {
        self.state.lock().reserve(name).then(|| NameReservation {
            state: &self.state,
            name: name.to_string(),
        })
    }

    /// Save the thread list. Saves are serialized so they land in mutation
    /// order; the list is read after the save lock is taken.
    pub(crate) async fn persist(&self) -> Result<()> {
        let _order = self.save_lock.lock().await;
        let threads = self.state.lock().threads.clone();
        self.store.save_threads(&threads).await?;
        Ok(())
    }

    pub(crate) async fn persist_settings(&self) -> Result<()> {
        let _order = self.save_lock.lock().await;
        let settings = self.settings();
        self.store.save_settings(&settings).await?;
        Ok(())
    }

    /// Persist from a context that cannot surface errors.
    pub(crate) async fn persist_quietly(&self, context: &'static str) {
        if let Err(e) = self.persist().await {
            warn!(
                component = "orchestrator",
                event = "orchestrator.persist_failed",
                context,
                error = %e,
                "Failed to persist thread list"
            );
        }
    }

    // Lookups

    pub fn project(&self, key: &str) -> Result<Project> {
        self.read(|s| s.settings.project(key).cloned())
            .ok_or_else(|| OrchestratorError::ProjectNotFound(key.to_string()))
    }

    pub(crate) fn project_for(&self, thread: &Thread) -> Option<Project> {
        self.read(|s| {
            s.settings
                .projects
                .iter()
                .find(|p| p.id == thread.project_id)
                .cloned()
        })
    }

    pub fn thread(&self, id: &str) -> Option<Thread> {
        self.read(|s| s.thread(id).cloned())
    }

    /// Active thread by id (preferred) or name.
    pub fn resolve_thread(&self, id: Option<&str>, name: Option<&str>) -> Result<Thread> {
        self.read(|s| {
            let found = match (id, name) {
                (Some(id), _) => s.active().find(|t| t.id == id),
                (None, Some(name)) => s.active().find(|t| t.name == name),
                (None, None) => None,
            };
            found.cloned()
        })
        .ok_or_else(|| not_found(id, name))
    }

    /// Like `resolve_thread`, but archived records are found too.
    pub fn resolve_record(&self, id: Option<&str>, name: Option<&str>) -> Result<Thread> {
        if let Ok(thread) = self.resolve_thread(id, name) {
            return Ok(thread);
        }
        self.read(|s| {
            let found = match (id, name) {
                (Some(id), _) => s.thread(id),
                (None, Some(name)) => s.threads.iter().rev().find(|t| t.name == name),
                (None, None) => None,
            };
            found.cloned()
        })
        .ok_or_else(|| not_found(id, name))
    }

    /// Resolve a live session name back to the thread that owns it.
    pub fn thread_for_session(&self, session: &str) -> Option<Thread> {
        self.read(|s| s.thread_for_session(session).cloned())
    }

    pub fn list_projects(&self) -> Vec<ProjectSummary> {
        self.read(|s| {
            s.settings
                .projects
                .iter()
                .map(|p| ProjectSummary {
                    id: p.id.clone(),
                    name: p.name.clone(),
                    repo_path: p.repo_path.display().to_string(),
                    default_branch: p.default_branch.clone(),
                    worktree_base: p.worktree_base().display().to_string(),
                    agent_default: p.agent_default.clone(),
                    thread_count: s.active().filter(|t| t.project_id == p.id).count(),
                })
                .collect()
        })
    }

    pub fn list_threads(
        &self,
        project: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<ThreadSummary>> {
        let project_id = match project {
            Some(key) => Some(self.project(key)?.id),
            None => None,
        };
        Ok(self.read(|s| {
            s.ordered(include_archived)
                .into_iter()
                .filter(|t| project_id.as_deref().map_or(true, |id| t.project_id == id))
                .map(Thread::summary)
                .collect()
        }))
    }

    pub async fn thread_info(&self, id: Option<&str>, name: Option<&str>) -> Result<ThreadDetail> {
        let thread = self.resolve_record(id, name)?;
        let project_name = self
            .project_for(&thread)
            .map(|p| p.name)
            .unwrap_or_default();
        let diff_stats = match (&thread.base_branch, thread.is_main || thread.is_archived) {
            (Some(base), false) => match self.git.diff_stats(&thread.worktree_path, base).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    debug!(
                        component = "orchestrator",
                        event = "orchestrator.diff_stats_failed",
                        thread_id = %thread.id,
                        error = %e,
                    );
                    None
                }
            },
            _ => None,
        };
        Ok(ThreadDetail {
            summary: thread.summary(),
            diff_stats,
            project_name,
        })
    }

    /// Unified diff of a worktree thread against its base branch. Empty for
    /// the main thread.
    pub async fn thread_diff(&self, id: Option<&str>, name: Option<&str>) -> Result<String> {
        let thread = self.resolve_thread(id, name)?;
        match &thread.base_branch {
            Some(base) if !thread.is_main => Ok(self.git.diff(&thread.worktree_path, base).await?),
            _ => Ok(String::new()),
        }
    }

    // Creation

    fn resolve_agent(&self, requested: Option<&str>, project: &Project) -> Result<Option<AgentConfig>> {
        self.read(|s| match requested {
            Some(id) if !id.is_empty() && id != "shell" && s.settings.agent(id).is_none() => {
                Err(OrchestratorError::UnknownAgent(id.to_string()))
            }
            _ => Ok(s.settings.resolve_agent(requested, project).cloned()),
        })
    }

    pub(crate) async fn base_branch(&self, project: &Project) -> String {
        if let Some(branch) = &project.default_branch {
            return branch.clone();
        }
        match self.git.default_branch(&project.repo_path).await {
            Ok(Some(branch)) => branch,
            Ok(None) => "main".to_string(),
            Err(e) => {
                warn!(
                    component = "orchestrator",
                    event = "orchestrator.default_branch_failed",
                    project = %project.name,
                    error = %e,
                    "Could not detect default branch, using main"
                );
                "main".to_string()
            }
        }
    }

    async fn allocate_and_reserve(
        &self,
        requested: Option<&str>,
        project: &Project,
        live: &HashSet<String>,
    ) -> Result<(AllocatedName, NameReservation<'_>)> {
        let worktree_base = project.worktree_base();
        let names = CreateNames {
            orchestrator: self,
            repo: &project.repo_path,
            worktree_base: &worktree_base,
            live_sessions: live,
        };
        // A concurrent create can take the name between the check and the reservation.
        for _ in 0..MAX_BASE_ATTEMPTS {
            let allocated =
                allocate_unique_name(requested, &names, || random_base_name(&mut rand::thread_rng()))
                    .await?;
            if let Some(reservation) = self.reserve_name(&allocated.name) {
                return Ok((allocated, reservation));
            }
        }
        Err(OrchestratorError::NameGenerationFailed {
            attempts: MAX_BASE_ATTEMPTS,
        })
    }

    pub(crate) async fn pretrust(&self, agent: &AgentConfig, dir: &Path) {
        let Some(trust_file) = agent.trust_file.as_deref() else {
            return;
        };
        if let Err(e) = agent_trust::trust_directory(trust_file, dir).await {
            warn!(
                component = "orchestrator",
                event = "orchestrator.pretrust_failed",
                agent = %agent.id,
                dir = %dir.display(),
                error = %e,
                "Failed to pre-trust worktree"
            );
        }
    }

    /// Create a worktree thread with one tab. Nothing is registered unless
    /// the worktree and the first session both exist.
    pub async fn create_thread(self: &Arc<Self>, request: CreateThreadRequest) -> Result<Thread> {
        let project = self.project(&request.project)?;
        let agent = self.resolve_agent(request.agent.as_deref(), &project)?;
        let base_branch = self.base_branch(&project).await;
        let worktree_base = project.worktree_base();
        let live: HashSet<String> = self.mux.list_sessions().await?.into_iter().collect();

        let (allocated, reservation) = self
            .allocate_and_reserve(request.name.as_deref(), &project, &live)
            .await?;
        let name = allocated.name.clone();
        let worktree_path = worktree_base.join(&name);

        tokio::fs::create_dir_all(&worktree_base)
            .await
            .map_err(|e| OrchestratorError::io("create worktree base", e))?;
        self.git
            .create_worktree(&project.repo_path, &worktree_path, &name, &base_branch)
            .await?;

        let mut thread = Thread::new_worktree(&project.id, &name, worktree_path.clone(), &base_branch);
        thread.name_is_generated = allocated.generated;
        thread.selected_agent_type = agent.as_ref().map(|a| a.id.clone());

        let recorded = self.read(|s| s.recorded_sessions());
        let session = next_tab_session_name(&name, 1, |c| live.contains(c) || recorded.contains(c));

        if let Some(agent) = &agent {
            self.pretrust(agent, &worktree_path).await;
        }

        if let Err(e) = self.start_session(&thread, &session, agent.as_ref()).await {
            self.undo_create(&project, &name, &session, &e).await;
            return Err(e.into());
        }
        thread.push_session(&session, agent.is_some());

        self.mutate(|s| s.push_bottom(thread.clone()));
        drop(reservation);
        if let Err(e) = self.persist().await {
            self.mutate(|s| s.threads.retain(|t| t.id != thread.id));
            self.undo_create(&project, &name, &session, &e).await;
            return Err(e);
        }
        let thread = self.thread(&thread.id).unwrap_or(thread);

        info!(
            component = "orchestrator",
            event = "orchestrator.thread_created",
            thread_id = %thread.id,
            name = %thread.name,
            project = %project.name,
            agent = ?thread.selected_agent_type,
            "Thread created"
        );
        self.notify(FleetEvent::ThreadCreated {
            thread_id: thread.id.clone(),
            name: thread.name.clone(),
        });

        if let Some(prompt) = request.prompt.filter(|p| !p.trim().is_empty()) {
            if agent.is_some() {
                self.spawn_initial_prompt(thread.id.clone(), session, prompt);
            }
        }
        Ok(thread)
    }

    /// Tear down what a failed `create_thread` built, best effort.
    async fn undo_create(
        &self,
        project: &Project,
        name: &str,
        session: &str,
        error: &(dyn std::fmt::Display + Sync),
    ) {
        let worktree_path = project.worktree_base().join(name);
        let mut cleanup = crate::error::CleanupReport::default();
        cleanup.check("kill session", self.mux.kill_session(session).await);
        cleanup.check(
            "remove worktree",
            self.git.remove_worktree(&project.repo_path, &worktree_path).await,
        );
        cleanup.check(
            "delete branch",
            self.git.delete_branch(&project.repo_path, name).await,
        );
        warn!(
            component = "orchestrator",
            event = "orchestrator.create_rolled_back",
            name = %name,
            error = %error,
            cleanup_failures = cleanup.failures.len(),
            "Thread creation failed, rolled back"
        );
    }

    fn spawn_initial_prompt(self: &Arc<Self>, thread_id: String, session: String, prompt: String) {
        let this = Arc::clone(self);
        let delay = self.read(|s| s.settings.reconcile.injection_delay()) * 2;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = this.send_prompt(&thread_id, Some(&session), &prompt).await {
                warn!(
                    component = "orchestrator",
                    event = "orchestrator.initial_prompt_failed",
                    thread_id = %thread_id,
                    error = %e,
                    "Failed to send initial prompt"
                );
            }
        });
    }

    /// The project's thread bound to the repo root. Returns the existing one
    /// when present.
    pub async fn create_main_thread(&self, project_key: &str) -> Result<Thread> {
        let project = self.project(project_key)?;
        let _guard = self.lock_thread(&format!("main:{}", project.id)).await;
        if let Some(existing) = self.read(|s| s.main_thread(&project.id).cloned()) {
            return Ok(existing);
        }

        let agent = self.resolve_agent(None, &project)?;
        let allocated =
            allocate_unique_name(Some(&project.name), &MainThreadNames(self), || project.name.clone())
                .await?;
        let _reservation = self
            .reserve_name(&allocated.name)
            .ok_or_else(|| OrchestratorError::DuplicateName(allocated.name.clone()))?;

        let mut thread = Thread::new_main(&project.id, &allocated.name, project.repo_path.clone());
        thread.selected_agent_type = agent.as_ref().map(|a| a.id.clone());

        let session = tab_session_name(&thread.name, 1);
        let recorded = self.read(|s| s.recorded_sessions());
        if !recorded.contains(&session) && self.mux.has_session(&session).await? {
            info!(
                component = "orchestrator",
                event = "orchestrator.stale_main_session",
                session = %session,
                "Killing stale session before creating main thread"
            );
            self.mux.kill_session(&session).await?;
        }
        self.start_session(&thread, &session, agent.as_ref()).await?;
        thread.push_session(&session, agent.is_some());

        self.mutate(|s| s.push_front(thread.clone()));
        self.persist().await?;
        info!(
            component = "orchestrator",
            event = "orchestrator.main_thread_created",
            thread_id = %thread.id,
            project = %project.name,
            "Main thread created"
        );
        self.notify(FleetEvent::ThreadCreated {
            thread_id: thread.id.clone(),
            name: thread.name.clone(),
        });
        Ok(self.thread(&thread.id).unwrap_or(thread))
    }

    /// Startup: enforce one main thread per project and clean up leftovers
    /// from a previous run. Dead sessions are recreated by the loop.
    pub async fn restore(&self) -> Result<()> {
        let duplicates = self.mutate(|s| {
            let mut seen = HashSet::new();
            let mut archived = 0;
            for thread in s.threads.iter_mut().filter(|t| t.is_main && !t.is_archived) {
                if !seen.insert(thread.project_id.clone()) {
                    thread.is_archived = true;
                    thread.clear_sessions();
                    archived += 1;
                }
            }
            archived
        });
        if duplicates > 0 {
            warn!(
                component = "orchestrator",
                event = "orchestrator.duplicate_main_threads",
                archived = duplicates,
                "Archived duplicate main threads"
            );
            self.persist().await?;
        }

        let projects = self.read(|s| s.settings.projects.clone());
        for project in projects {
            if let Err(e) = self.create_main_thread(&project.id).await {
                warn!(
                    component = "orchestrator",
                    event = "orchestrator.main_thread_failed",
                    project = %project.name,
                    error = %e,
                    "Could not ensure main thread"
                );
            }
        }

        let cleanup = self.sweep_orphans().await;
        info!(
            component = "orchestrator",
            event = "orchestrator.restored",
            threads = self.read(|s| s.active().count()),
            cleanup_failures = cleanup.failures.len(),
            "Fleet restored"
        );
        Ok(())
    }

    // Thread metadata

    pub async fn pin_thread(&self, thread_id: &str, pinned: bool) -> Result<Thread> {
        let _guard = self.lock_thread(thread_id).await;
        self.resolve_thread(Some(thread_id), None)?;
        let thread = self.update_thread(thread_id, |t| t.is_pinned = pinned)?;
        self.persist().await?;
        Ok(thread)
    }

    /// Move a thread into a section (by name or id; `None` is the default
    /// section) at `position`, or at the bottom.
    pub async fn move_thread(
        &self,
        thread_id: &str,
        section: Option<&str>,
        position: Option<usize>,
    ) -> Result<Thread> {
        let _guard = self.lock_thread(thread_id).await;
        let thread = self.resolve_thread(Some(thread_id), None)?;
        let project = self.project_for(&thread);
        let section_id = match section.filter(|s| !s.is_empty()) {
            None => None,
            Some(key) => Some(
                self.read(|s| {
                    s.settings
                        .sections_for(project.as_ref())
                        .iter()
                        .find(|sec| sec.name == key || sec.id == key)
                        .map(|sec| sec.id.clone())
                })
                .ok_or_else(|| OrchestratorError::SectionNotFound(key.to_string()))?,
            ),
        };
        self.mutate(|s| s.place(thread_id, section_id, position));
        self.persist().await?;
        self.resolve_thread(Some(thread_id), None)
    }

    /// Type `prompt` into a tab (the first agent tab by default) and submit.
    /// Returns the session the prompt went to.
    pub async fn send_prompt(
        self: &Arc<Self>,
        thread_id: &str,
        session: Option<&str>,
        prompt: &str,
    ) -> Result<String> {
        let thread = self.resolve_thread(Some(thread_id), None)?;
        let session = match session {
            Some(session) if thread.has_session(session) => session.to_string(),
            Some(session) => return Err(OrchestratorError::SessionNotFound(session.to_string())),
            None => thread
                .primary_agent_session()
                .or_else(|| thread.session_at(0))
                .map(str::to_string)
                .ok_or_else(|| OrchestratorError::SessionNotFound(thread.name.clone()))?,
        };

        self.mux.send_text(&session, prompt).await?;
        self.mux.send_enter(&session).await?;
        debug!(
            component = "orchestrator",
            event = "orchestrator.prompt_sent",
            thread_id = %thread.id,
            session = %session,
            chars = prompt.chars().count(),
        );

        if thread.name_is_generated && !thread.auto_named && thread.is_agent_session(&session) {
            let this = Arc::clone(self);
            let (thread_id, session_name, prompt) =
                (thread.id.clone(), session.clone(), prompt.to_string());
            tokio::spawn(async move {
                this.auto_rename_after_first_prompt(&thread_id, &session_name, &prompt)
                    .await;
            });
        }
        Ok(session)
    }

    /// Record that the user is looking at `session`.
    pub async fn focus_session(&self, session: &str) -> Result<Thread> {
        let thread = self
            .thread_for_session(session)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session.to_string()))?;
        let thread = self.mutate(|s| {
            s.focused_session = Some(session.to_string());
            let t = s.thread_mut(&thread.id)?;
            t.unread_sessions.remove(session);
            t.last_selected_session = Some(session.to_string());
            Some(t.clone())
        });
        let thread = thread.ok_or_else(|| OrchestratorError::SessionNotFound(session.to_string()))?;
        self.persist().await?;
        Ok(thread)
    }

    pub(crate) fn focused_session(&self) -> Option<String> {
        self.read(|s| s.focused_session.clone())
    }

    pub(crate) fn session_env(&self, thread: &Thread, session: &str) -> Vec<(String, String)> {
        vec![
            (THREAD_ID_ENV.to_string(), thread.id.clone()),
            (PROJECT_ID_ENV.to_string(), thread.project_id.clone()),
            (
                WORKTREE_ENV.to_string(),
                thread.worktree_path.display().to_string(),
            ),
            (SESSION_ENV.to_string(), session.to_string()),
        ]
    }
}

fn not_found(id: Option<&str>, name: Option<&str>) -> OrchestratorError {
    OrchestratorError::ThreadNotFound(id.or(name).unwrap_or("<unspecified>").to_string())
}

/// Availability for new worktree threads: the name must be free as a thread
/// name, session name, worktree directory and git branch.
struct CreateNames<'a> {
    orchestrator: &'a Orchestrator,
    repo: &'a Path,
    worktree_base: &'a Path,
    live_sessions: &'a HashSet<String>,
}

#[async_trait]
impl NameAvailability for CreateNames<'_> {
    async fn is_available(&self, candidate: &str) -> bool {
        let session = sanitize_session_name(candidate);
        let taken = self.orchestrator.read(|s| {
            s.name_taken(candidate, None) || s.recorded_sessions().contains(&session)
        });
        if taken || self.live_sessions.contains(&session) {
            return false;
        }
        if tokio::fs::symlink_metadata(self.worktree_base.join(candidate))
            .await
            .is_ok()
        {
            return false;
        }
        // A failing lookup is not a collision; worktree creation reports the real error.
        !matches!(
            self.orchestrator.git.branch_exists(self.repo, candidate).await,
            Ok(true)
        )
    }
}

/// Availability against thread names and recorded session names (main
/// threads own no branch or worktree directory).
struct MainThreadNames<'a>(&'a Orchestrator);

#[async_trait]
impl NameAvailability for MainThreadNames<'_> {
    async fn is_available(&self, candidate: &str) -> bool {
        let session = tab_session_name(candidate, 1);
        !self
            .0
            .read(|s| s.name_taken(candidate, None) || s.recorded_sessions().contains(&session))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::TestFleet;

    #[tokio::test]
    async fn create_thread_builds_worktree_branch_and_agent_tab() {
        let fleet = TestFleet::new().await;
        let thread = fleet
            .orchestrator
            .create_thread(CreateThreadRequest {
                project: "webapp".to_string(),
                name: Some("x".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(thread.name, "x");
        assert_eq!(thread.worktree_path, fleet.repo.join("worktrees/x"));
        assert!(thread.worktree_path.is_dir());
        assert!(fleet.git.has_branch("x"));
        assert_eq!(thread.tmux_session_names, vec!["x"]);
        assert!(thread.is_agent_session("x"));
        assert!(fleet.mux.is_live("x"));
        assert_eq!(fleet.mux.env_of("x", THREAD_ID_ENV).as_deref(), Some(thread.id.as_str()));
        assert!(fleet.mux.has_hook("x"));
        assert_eq!(thread.section_id, None);

        let listed = fleet.orchestrator.list_threads(Some("webapp"), false).unwrap();
        assert_eq!(listed.last().map(|t| t.name.as_str()), Some("x"));
        assert_eq!(fleet.store.saved_threads().len(), 1);
    }

    #[tokio::test]
    async fn generated_names_are_unique_and_marked() {
        let fleet = TestFleet::new().await;
        let mut names = HashSet::new();
        let mut paths = HashSet::new();
        for _ in 0..6 {
            let t = fleet.create("webapp", None).await;
            assert!(t.name_is_generated);
            names.insert(t.name.clone());
            paths.insert(t.worktree_path.clone());
        }
        assert_eq!(names.len(), 6);
        assert_eq!(paths.len(), 6);
    }

    #[tokio::test]
    async fn requested_name_collision_gets_suffix() {
        let fleet = TestFleet::new().await;
        fleet.git.add_branch("foo");
        let t = fleet.create("webapp", Some("foo")).await;
        assert_eq!(t.name, "foo-2");
        assert!(!t.name_is_generated);
    }

    #[tokio::test]
    async fn failed_session_start_rolls_back_everything() {
        let fleet = TestFleet::new().await;
        fleet.mux.fail_create("broken");
        let err = fleet
            .orchestrator
            .create_thread(CreateThreadRequest {
                project: "webapp".to_string(),
                name: Some("broken".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Command(_)));
        assert!(!fleet.git.has_branch("broken"));
        assert!(!fleet.repo.join("worktrees/broken").exists());
        assert!(fleet.orchestrator.resolve_thread(None, Some("broken")).is_err());
        // The name is free again.
        assert!(fleet.orchestrator.read(|s| !s.name_taken("broken", None)));
    }

    #[tokio::test]
    async fn unknown_project_and_agent_are_rejected() {
        let fleet = TestFleet::new().await;
        let err = fleet
            .orchestrator
            .create_thread(CreateThreadRequest {
                project: "nope".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ProjectNotFound(_)));

        let err = fleet
            .orchestrator
            .create_thread(CreateThreadRequest {
                project: "webapp".to_string(),
                agent: Some("gemini".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn shell_agent_creates_plain_tab() {
        let fleet = TestFleet::new().await;
        let t = fleet
            .orchestrator
            .create_thread(CreateThreadRequest {
                project: "webapp".to_string(),
                agent: Some("shell".to_string()),
                name: Some("plain".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(t.agent_sessions.is_empty());
        assert!(t.selected_agent_type.is_none());
        assert_eq!(fleet.mux.command_of("plain"), None);
    }

    #[tokio::test]
    async fn main_thread_is_unique_and_first() {
        let fleet = TestFleet::new().await;
        fleet.create("webapp", Some("side")).await;
        fleet.mux.spawn_stray("webapp");

        let main = fleet.orchestrator.create_main_thread("webapp").await.unwrap();
        assert!(main.is_main);
        assert_eq!(main.worktree_path, fleet.repo);
        assert!(fleet.mux.calls().contains(&"kill:webapp".to_string()));

        let again = fleet.orchestrator.create_main_thread("p1").await.unwrap();
        assert_eq!(again.id, main.id);

        let listed = fleet.orchestrator.list_threads(None, false).unwrap();
        assert_eq!(listed[0].id, main.id);
    }

    #[tokio::test]
    async fn main_thread_skips_names_whose_session_is_recorded() {
        let mut other = Thread::new_worktree("p1", "webapp!", PathBuf::from("/w/webapp"), "main");
        other.push_session("webapp", false);
        let fleet = TestFleet::with_threads(vec![other.clone()]).await;

        let main = fleet.orchestrator.create_main_thread("webapp").await.unwrap();
        assert_eq!(main.name, "webapp-2");
        assert_eq!(main.tmux_session_names, vec!["webapp-2"]);
        assert!(!fleet.mux.calls().contains(&"kill:webapp".to_string()));
        let kept = fleet.orchestrator.thread(&other.id).unwrap();
        assert_eq!(kept.tmux_session_names, vec!["webapp"]);
    }

    #[tokio::test]
    async fn failed_save_rolls_back_created_thread() {
        let fleet = TestFleet::new().await;
        fleet.store.fail_saves(true);
        let result = fleet
            .orchestrator
            .create_thread(CreateThreadRequest {
                project: "webapp".to_string(),
                name: Some("x".to_string()),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Persistence(_))), "{result:?}");
        assert!(fleet.orchestrator.threads().iter().all(|t| t.name != "x"));
        assert!(!fleet.mux.is_live("x"));
        assert!(!fleet.git.has_branch("x"));
        assert!(!fleet.repo.join("worktrees/x").exists());

        fleet.store.fail_saves(false);
        let again = fleet.create("webapp", Some("x")).await;
        assert_eq!(again.name, "x");
    }

    #[tokio::test]
    async fn restore_archives_duplicate_main_threads() {
        let mut first = Thread::new_main("p1", "webapp", PathBuf::from("/src/webapp"));
        first.push_session("webapp", false);
        let second = Thread::new_main("p1", "webapp-2", PathBuf::from("/src/webapp"));
        let fleet = TestFleet::with_threads(vec![first.clone(), second.clone()]).await;

        fleet.orchestrator.restore().await.unwrap();
        let mains: Vec<Thread> = fleet
            .orchestrator
            .threads()
            .iter()
            .filter(|t| t.is_main && !t.is_archived)
            .cloned()
            .collect();
        assert_eq!(mains.len(), 1);
        assert_eq!(mains[0].id, first.id);
    }

    #[tokio::test]
    async fn move_and_pin_reorder_listing() {
        let fleet = TestFleet::new().await;
        let a = fleet.create("webapp", Some("a")).await;
        let b = fleet.create("webapp", Some("b")).await;

        fleet.orchestrator.move_thread(&b.id, None, Some(0)).await.unwrap();
        let names: Vec<String> = fleet
            .orchestrator
            .list_threads(None, false)
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["b", "a"]);

        let moved = fleet
            .orchestrator
            .move_thread(&a.id, Some("Review"), None)
            .await
            .unwrap();
        assert_eq!(moved.section_id.as_deref(), Some("review"));
        assert!(matches!(
            fleet.orchestrator.move_thread(&a.id, Some("Nope"), None).await,
            Err(OrchestratorError::SectionNotFound(_))
        ));

        let pinned = fleet.orchestrator.pin_thread(&a.id, true).await.unwrap();
        assert!(pinned.is_pinned);
    }

    #[tokio::test]
    async fn focus_clears_unread() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        fleet
            .orchestrator
            .update_thread(&t.id, |t| {
                t.unread_sessions.insert("x".to_string());
            })
            .unwrap();
        let focused = fleet.orchestrator.focus_session("x").await.unwrap();
        assert!(focused.unread_sessions.is_empty());
        assert_eq!(focused.last_selected_session.as_deref(), Some("x"));
        assert_eq!(fleet.orchestrator.focused_session().as_deref(), Some("x"));
        assert!(fleet.orchestrator.focus_session("ghost").await.is_err());
    }

    #[tokio::test]
    async fn send_prompt_targets_agent_tab() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        let session = fleet
            .orchestrator
            .send_prompt(&t.id, None, "run the tests")
            .await
            .unwrap();
        assert_eq!(session, "x");
        assert!(fleet.mux.typed("x").iter().any(|s| s == "run the tests"));
        assert!(fleet
            .orchestrator
            .send_prompt(&t.id, Some("other"), "hi")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn initial_prompt_auto_renames_generated_thread() {
        let fleet = TestFleet::new().await;
        fleet.slugger.set_reply("SLUG: fix-login-redirect");
        let t = fleet
            .orchestrator
            .create_thread(CreateThreadRequest {
                project: "webapp".to_string(),
                prompt: Some("Fix the login redirect loop".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(t.name_is_generated);

        let mut renamed = t.clone();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            renamed = fleet.orchestrator.resolve_thread(Some(&t.id), None).unwrap();
            if renamed.name != t.name {
                break;
            }
        }
        assert_eq!(renamed.name, "fix-login-redirect");
        assert!(renamed.auto_named);
        assert!(!renamed.name_is_generated);
        assert!(fleet
            .mux
            .typed("fix-login-redirect")
            .iter()
            .any(|s| s == "Fix the login redirect loop"));
    }

    #[tokio::test]
    async fn thread_info_includes_diff_stats() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("x")).await;
        let info = fleet.orchestrator.thread_info(None, Some("x")).await.unwrap();
        assert_eq!(info.summary.id, t.id);
        assert_eq!(info.project_name, "webapp");
        assert!(info.diff_stats.is_some());
    }
}
