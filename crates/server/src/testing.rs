//! In-memory collaborators for orchestrator tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use fleetdock_protocol::DiffStats;

use crate::ai_naming::SlugGenerator;
use crate::completion::CompletionEvent;
use crate::config::{AgentConfig, Project, Section, Settings};
use crate::git::GitCollaborator;
use crate::mux::{CwdEnforcement, MuxCollaborator, PaneInfo, SessionActivity, SessionSpec, ZombieSample};
use crate::orchestrator::{Collaborators, CreateThreadRequest, Orchestrator};
use crate::persistence::{PersistenceCollaborator, StoreError};
use crate::process::CommandError;
use crate::thread::Thread;

fn failed(command: String, stderr: &str) -> CommandError {
    CommandError::Failed {
        command,
        stderr: stderr.to_string(),
        exit_code: Some(1),
    }
}

// Git

#[derive(Default)]
pub struct FakeGit {
    branches: Mutex<HashSet<String>>,
    dirty: Mutex<HashSet<PathBuf>>,
    delivered: Mutex<HashSet<PathBuf>>,
    heads: Mutex<HashMap<PathBuf, String>>,
    prunes: Mutex<usize>,
}

impl FakeGit {
    pub fn has_branch(&self, name: &str) -> bool {
        self.branches.lock().contains(name)
    }

    pub fn add_branch(&self, name: &str) {
        self.branches.lock().insert(name.to_string());
    }

    pub fn set_dirty(&self, path: &Path, dirty: bool) {
        toggle(&self.dirty, path, dirty);
    }

    pub fn set_delivered(&self, path: &Path, delivered: bool) {
        toggle(&self.delivered, path, delivered);
    }

    pub fn head_of(&self, path: &Path) -> Option<String> {
        self.heads.lock().get(path).cloned()
    }

    pub fn prunes(&self) -> usize {
        *self.prunes.lock()
    }
}

fn toggle(set: &Mutex<HashSet<PathBuf>>, path: &Path, on: bool) {
    if on {
        set.lock().insert(path.to_path_buf());
    } else {
        set.lock().remove(path);
    }
}

#[async_trait]
impl GitCollaborator for FakeGit {
    async fn create_worktree(
        &self,
        _repo: &Path,
        path: &Path,
        branch: &str,
        _base: &str,
    ) -> Result<(), CommandError> {
        if !self.branches.lock().insert(branch.to_string()) {
            return Err(failed(
                format!("git worktree add -b {branch}"),
                "fatal: a branch with that name already exists",
            ));
        }
        self.heads.lock().insert(path.to_path_buf(), branch.to_string());
        std::fs::create_dir_all(path).map_err(|e| failed("mkdir".to_string(), &e.to_string()))
    }

    async fn attach_worktree(&self, _repo: &Path, path: &Path, branch: &str) -> Result<(), CommandError> {
        if !self.has_branch(branch) {
            return Err(failed(
                format!("git worktree add {}", path.display()),
                "fatal: invalid reference",
            ));
        }
        self.heads.lock().insert(path.to_path_buf(), branch.to_string());
        std::fs::create_dir_all(path).map_err(|e| failed("mkdir".to_string(), &e.to_string()))
    }

    async fn remove_worktree(&self, _repo: &Path, path: &Path) -> Result<(), CommandError> {
        self.heads.lock().remove(path);
        std::fs::remove_dir_all(path)
            .map_err(|e| failed("git worktree remove".to_string(), &e.to_string()))
    }

    async fn prune_worktrees(&self, _repo: &Path) -> Result<(), CommandError> {
        *self.prunes.lock() += 1;
        Ok(())
    }

    async fn rename_branch(&self, _repo: &Path, old: &str, new: &str) -> Result<(), CommandError> {
        let mut branches = self.branches.lock();
        if branches.contains(new) || !branches.remove(old) {
            return Err(failed(format!("git branch -m {old} {new}"), "fatal: cannot rename"));
        }
        branches.insert(new.to_string());
        for head in self.heads.lock().values_mut().filter(|h| h.as_str() == old) {
            *head = new.to_string();
        }
        Ok(())
    }

    async fn delete_branch(&self, _repo: &Path, branch: &str) -> Result<(), CommandError> {
        if self.branches.lock().remove(branch) {
            Ok(())
        } else {
            Err(failed(format!("git branch -D {branch}"), "error: branch not found"))
        }
    }

    async fn branch_exists(&self, _repo: &Path, branch: &str) -> Result<bool, CommandError> {
        Ok(self.has_branch(branch))
    }

    async fn is_dirty(&self, path: &Path) -> Result<bool, CommandError> {
        Ok(self.dirty.lock().contains(path))
    }

    async fn diff_stats(&self, _path: &Path, _base: &str) -> Result<DiffStats, CommandError> {
        Ok(DiffStats::default())
    }

    async fn is_fully_delivered(&self, path: &Path, _base: &str) -> Result<bool, CommandError> {
        Ok(self.delivered.lock().contains(path))
    }

    async fn default_branch(&self, _repo: &Path) -> Result<Option<String>, CommandError> {
        Ok(Some("main".to_string()))
    }

    async fn current_branch(&self, path: &Path) -> Result<Option<String>, CommandError> {
        Ok(self.head_of(path))
    }

    async fn diff(&self, path: &Path, base: &str) -> Result<String, CommandError> {
        if !path.is_dir() {
            return Err(failed("git diff".to_string(), "fatal: not a git repository"));
        }
        Ok(format!("diff {} against {base}\n", path.display()))
    }
}

// Mux

#[derive(Debug, Clone, Default)]
struct FakeSession {
    start_dir: PathBuf,
    pane_path: PathBuf,
    command: Option<String>,
    env: HashMap<String, String>,
    hook: bool,
    typed: Vec<String>,
    capture: String,
    activity: SessionActivity,
}

#[derive(Default)]
struct MuxState {
    sessions: BTreeMap<String, FakeSession>,
    calls: Vec<String>,
    fail_create: HashSet<String>,
    fail_kill: HashSet<String>,
    fail_rename_from: HashSet<String>,
    completions: Vec<CompletionEvent>,
    zombies: Vec<ZombieSample>,
    restarts: usize,
}

#[derive(Default)]
pub struct FakeMux {
    state: Mutex<MuxState>,
}

impl FakeMux {
    pub fn is_live(&self, session: &str) -> bool {
        self.state.lock().sessions.contains_key(session)
    }

    pub fn env_of(&self, session: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .sessions
            .get(session)
            .and_then(|s| s.env.get(key).cloned())
    }

    pub fn has_hook(&self, session: &str) -> bool {
        self.state.lock().sessions.get(session).is_some_and(|s| s.hook)
    }

    pub fn command_of(&self, session: &str) -> Option<String> {
        self.state
            .lock()
            .sessions
            .get(session)
            .and_then(|s| s.command.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn typed(&self, session: &str) -> Vec<String> {
        self.state
            .lock()
            .sessions
            .get(session)
            .map(|s| s.typed.clone())
            .unwrap_or_default()
    }

    pub fn restarts(&self) -> usize {
        self.state.lock().restarts
    }

    /// A session nobody asked the orchestrator for.
    pub fn spawn_stray(&self, name: &str) {
        self.state.lock().sessions.insert(
            name.to_string(),
            FakeSession {
                start_dir: PathBuf::from("/tmp"),
                pane_path: PathBuf::from("/tmp"),
                ..Default::default()
            },
        );
    }

    pub fn fail_create(&self, name: &str) {
        self.state.lock().fail_create.insert(name.to_string());
    }

    pub fn fail_kill(&self, name: &str) {
        self.state.lock().fail_kill.insert(name.to_string());
    }

    pub fn fail_rename_from(&self, name: &str) {
        self.state.lock().fail_rename_from.insert(name.to_string());
    }

    /// The session dies without the orchestrator's involvement.
    pub fn kill_externally(&self, name: &str) {
        self.state.lock().sessions.remove(name);
    }

    pub fn set_pane_path(&self, session: &str, path: impl Into<PathBuf>) {
        if let Some(s) = self.state.lock().sessions.get_mut(session) {
            s.pane_path = path.into();
        }
    }

    pub fn set_env(&self, session: &str, key: &str, value: &str) {
        if let Some(s) = self.state.lock().sessions.get_mut(session) {
            s.env.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_capture(&self, session: &str, text: &str) {
        if let Some(s) = self.state.lock().sessions.get_mut(session) {
            s.capture = text.to_string();
        }
    }

    pub fn set_activity(&self, session: &str, non_idle: bool, title: &str) {
        if let Some(s) = self.state.lock().sessions.get_mut(session) {
            s.activity = SessionActivity {
                any_non_idle: non_idle,
                active_title: title.to_string(),
            };
        }
    }

    pub fn push_completion(&self, session: &str) {
        self.state.lock().completions.push(CompletionEvent {
            session: session.to_string(),
            at: Utc::now(),
        });
    }

    pub fn set_zombies(&self, samples: Vec<ZombieSample>) {
        self.state.lock().zombies = samples;
    }

    fn with_session<R>(
        &self,
        call: String,
        session: &str,
        f: impl FnOnce(&mut FakeSession) -> R,
    ) -> Result<R, CommandError> {
        let mut state = self.state.lock();
        state.calls.push(call.clone());
        match state.sessions.get_mut(session) {
            Some(s) => Ok(f(s)),
            None => Err(failed(call, &format!("can't find session: {session}"))),
        }
    }
}

#[async_trait]
impl MuxCollaborator for FakeMux {
    async fn create_session(&self, spec: &SessionSpec) -> Result<(), CommandError> {
        let call = format!("create:{}", spec.name);
        let mut state = self.state.lock();
        state.calls.push(call.clone());
        if state.fail_create.contains(&spec.name) || state.sessions.contains_key(&spec.name) {
            return Err(failed(call, "duplicate session"));
        }
        state.sessions.insert(
            spec.name.clone(),
            FakeSession {
                start_dir: spec.cwd.clone(),
                pane_path: spec.cwd.clone(),
                command: spec.command.clone(),
                env: spec.env.iter().cloned().collect(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), CommandError> {
        let call = format!("kill:{name}");
        let mut state = self.state.lock();
        state.calls.push(call.clone());
        if state.fail_kill.contains(name) {
            return Err(failed(call, "server exited unexpectedly"));
        }
        state
            .sessions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| failed(call, &format!("can't find session: {name}")))
    }

    async fn rename_session(&self, from: &str, to: &str) -> Result<(), CommandError> {
        let call = format!("rename:{from}->{to}");
        let mut state = self.state.lock();
        state.calls.push(call.clone());
        if state.fail_rename_from.contains(from) || state.sessions.contains_key(to) {
            return Err(failed(call, "rename refused"));
        }
        let session = state
            .sessions
            .remove(from)
            .ok_or_else(|| failed(call, &format!("can't find session: {from}")))?;
        state.sessions.insert(to.to_string(), session);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, CommandError> {
        Ok(self.state.lock().sessions.keys().cloned().collect())
    }

    async fn has_session(&self, name: &str) -> Result<bool, CommandError> {
        Ok(self.is_live(name))
    }

    async fn send_text(&self, session: &str, text: &str) -> Result<(), CommandError> {
        self.with_session(format!("send:{session}"), session, |s| {
            s.typed.push(text.to_string())
        })
    }

    async fn send_enter(&self, session: &str) -> Result<(), CommandError> {
        self.with_session(format!("enter:{session}"), session, |_| ())
    }

    async fn set_env(&self, session: &str, key: &str, value: &str) -> Result<(), CommandError> {
        self.with_session(format!("setenv:{session}"), session, |s| {
            s.env.insert(key.to_string(), value.to_string());
        })
    }

    async fn get_env(&self, session: &str, key: &str) -> Result<Option<String>, CommandError> {
        Ok(self.env_of(session, key))
    }

    async fn active_pane(&self, session: &str) -> Result<Option<PaneInfo>, CommandError> {
        Ok(self.state.lock().sessions.get(session).map(|s| PaneInfo {
            pane_id: "%0".to_string(),
            path: s.pane_path.clone(),
            command: if s.activity.any_non_idle { "node" } else { "zsh" }.to_string(),
            title: s.activity.active_title.clone(),
            active: true,
        }))
    }

    async fn session_path(&self, session: &str) -> Result<Option<PathBuf>, CommandError> {
        Ok(self
            .state
            .lock()
            .sessions
            .get(session)
            .map(|s| s.start_dir.clone()))
    }

    async fn capture_pane(&self, session: &str, _lines: usize) -> Result<String, CommandError> {
        self.with_session(format!("capture:{session}"), session, |s| s.capture.clone())
    }

    async fn attach_completion_hook(&self, session: &str) -> Result<(), CommandError> {
        self.with_session(format!("hook:{session}"), session, |s| s.hook = true)
    }

    async fn drain_completion_events(&self) -> Result<Vec<CompletionEvent>, CommandError> {
        Ok(std::mem::take(&mut self.state.lock().completions))
    }

    async fn enforce_pane_cwd(&self, session: &str, path: &Path) -> Result<CwdEnforcement, CommandError> {
        self.with_session(format!("cwd:{session}"), session, |s| {
            if s.pane_path.starts_with(path) {
                CwdEnforcement::default()
            } else if s.activity.any_non_idle {
                CwdEnforcement {
                    corrected: 0,
                    remaining: 1,
                }
            } else {
                s.pane_path = path.to_path_buf();
                CwdEnforcement {
                    corrected: 1,
                    remaining: 0,
                }
            }
        })
    }

    async fn session_activity(&self, session: &str) -> Result<SessionActivity, CommandError> {
        self.with_session(format!("activity:{session}"), session, |s| s.activity.clone())
    }

    async fn restart_server(&self) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        state.calls.push("restart".to_string());
        state.sessions.clear();
        state.zombies.clear();
        state.restarts += 1;
        Ok(())
    }

    async fn zombie_samples(&self) -> Result<Vec<ZombieSample>, CommandError> {
        Ok(self.state.lock().zombies.clone())
    }
}

// Persistence

#[derive(Default)]
pub struct MemoryStore {
    threads: Mutex<Vec<Thread>>,
    settings: Mutex<Option<Settings>>,
    fail_saves: Mutex<bool>,
}

impl MemoryStore {
    pub fn fail_saves(&self, fail: bool) {
        *self.fail_saves.lock() = fail;
    }

    pub fn saved_threads(&self) -> Vec<Thread> {
        self.threads.lock().clone()
    }

    pub fn saved_settings(&self) -> Option<Settings> {
        self.settings.lock().clone()
    }
}

#[async_trait]
impl PersistenceCollaborator for MemoryStore {
    async fn load_threads(&self) -> Result<Vec<Thread>, StoreError> {
        Ok(self.saved_threads())
    }

    async fn save_threads(&self, threads: &[Thread]) -> Result<(), StoreError> {
        if *self.fail_saves.lock() {
            return Err(StoreError::Join("disk full".to_string()));
        }
        *self.threads.lock() = threads.to_vec();
        Ok(())
    }

    async fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        Ok(self.saved_settings())
    }

    async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        *self.settings.lock() = Some(settings.clone());
        Ok(())
    }
}

// Slugs

/// Replies with a canned response, or never replies at all.
#[derive(Default)]
pub struct FakeSlugGenerator {
    reply: Mutex<Option<String>>,
    hang: bool,
    prompts: Mutex<Vec<String>>,
}

impl FakeSlugGenerator {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Mutex::new(Some(reply.to_string())),
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn set_reply(&self, reply: &str) {
        *self.reply.lock() = Some(reply.to_string());
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl SlugGenerator for FakeSlugGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, CommandError> {
        self.prompts.lock().push(prompt.to_string());
        if self.hang {
            std::future::pending::<()>().await;
        }
        let reply = self.reply.lock().clone();
        reply.ok_or_else(|| CommandError::Spawn {
            command: "slug".to_string(),
            message: "no reply configured".to_string(),
        })
    }
}

// Fleet

/// An orchestrator over fakes with one project, `webapp` (id `p1`), whose
/// repository is a scratch directory.
pub struct TestFleet {
    pub orchestrator: Arc<Orchestrator>,
    pub git: Arc<FakeGit>,
    pub mux: Arc<FakeMux>,
    pub store: Arc<MemoryStore>,
    pub slugger: Arc<FakeSlugGenerator>,
    pub repo: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestFleet {
    pub async fn new() -> Self {
        Self::with_threads(Vec::new()).await
    }

    pub async fn with_threads(threads: Vec<Thread>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = dir.path().join("webapp");
        std::fs::create_dir_all(&repo).expect("repo dir");
        let settings = test_settings(&repo, dir.path().join("agent.json"));

        let git = Arc::new(FakeGit::default());
        let mux = Arc::new(FakeMux::default());
        let store = Arc::new(MemoryStore::default());
        let slugger = Arc::new(FakeSlugGenerator::default());
        let orchestrator = Orchestrator::new(
            Collaborators {
                git: git.clone(),
                mux: mux.clone(),
                store: store.clone(),
                slugger: slugger.clone(),
            },
            settings,
            threads,
        );
        Self {
            orchestrator,
            git,
            mux,
            store,
            slugger,
            repo,
            _dir: dir,
        }
    }

    pub async fn create(&self, project: &str, name: Option<&str>) -> Thread {
        self.orchestrator
            .create_thread(CreateThreadRequest {
                project: project.to_string(),
                name: name.map(str::to_string),
                ..Default::default()
            })
            .await
            .expect("create thread")
    }
}

pub fn test_settings(repo: &Path, trust_file: PathBuf) -> Settings {
    let mut settings = Settings {
        projects: vec![Project {
            id: "p1".to_string(),
            name: "webapp".to_string(),
            repo_path: repo.to_path_buf(),
            default_branch: Some("main".to_string()),
            worktree_base: None,
            agent_default: None,
            section_overrides: None,
        }],
        agents: vec![AgentConfig {
            id: "claude".to_string(),
            name: "Claude Code".to_string(),
            start_command: "claude".to_string(),
            trust_file: Some(trust_file),
        }],
        default_agent: Some("claude".to_string()),
        sections: vec![Section {
            id: "review".to_string(),
            name: "Review".to_string(),
            color: None,
            hidden: false,
        }],
        ..Settings::default()
    };
    settings.reconcile.injection_delay_ms = 10;
    settings.reconcile.slug_timeout_secs = 2;
    settings
}
