//! Settings document: projects, agents, sections, injection strings and
//! reconcile tuning. Stored as one JSON document in the key-value store.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A registered repository root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo_path: PathBuf,
    /// Branch new worktrees fork from. Detected from git when unset.
    #[serde(default)]
    pub default_branch: Option<String>,
    /// Where worktrees live. Defaults to `<repo>/worktrees`.
    #[serde(default)]
    pub worktree_base: Option<PathBuf>,
    #[serde(default)]
    pub agent_default: Option<String>,
    /// Per-project section list; the global list applies when unset.
    #[serde(default)]
    pub section_overrides: Option<Vec<Section>>,
}

impl Project {
    pub fn worktree_base(&self) -> PathBuf {
        self.worktree_base
            .clone()
            .unwrap_or_else(|| self.repo_path.join("worktrees"))
    }

    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.name == key
    }
}

/// An AI coding CLI that can run inside a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    /// Shell command that starts the agent inside the worktree.
    pub start_command: String,
    /// JSON config file where the agent records trusted directories.
    /// When set, new worktrees are pre-trusted before the agent starts.
    #[serde(default)]
    pub trust_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

/// Reconciliation loop tuning. All values have serde defaults so older
/// settings documents keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub tick_interval_ms: u64,
    pub dirty_every_ticks: u64,
    pub health_every_ticks: u64,
    pub completion_dedup_ms: u64,
    pub bell_grace_ms: u64,
    pub zombie_threshold: usize,
    pub pending_cwd_secs: u64,
    pub slug_timeout_secs: u64,
    pub injection_delay_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 3_000,
            dirty_every_ticks: 10,
            health_every_ticks: 20,
            completion_dedup_ms: 2_000,
            bell_grace_ms: 4_000,
            zombie_threshold: 50,
            pending_cwd_secs: 30,
            slug_timeout_secs: 15,
            injection_delay_ms: 1_500,
        }
    }
}

impl ReconcileConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn completion_dedup(&self) -> Duration {
        Duration::from_millis(self.completion_dedup_ms)
    }

    pub fn bell_grace(&self) -> Duration {
        Duration::from_millis(self.bell_grace_ms)
    }

    pub fn pending_cwd(&self) -> Duration {
        Duration::from_secs(self.pending_cwd_secs)
    }

    pub fn slug_timeout(&self) -> Duration {
        Duration::from_secs(self.slug_timeout_secs)
    }

    pub fn injection_delay(&self) -> Duration {
        Duration::from_millis(self.injection_delay_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_slug_command() -> Vec<String> {
    vec!["claude".to_string(), "-p".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub default_agent: Option<String>,
    /// Command typed into every new or recreated tab's shell.
    #[serde(default)]
    pub terminal_injection: Option<String>,
    /// Context string sent to a freshly started agent.
    #[serde(default)]
    pub agent_context_injection: Option<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default)]
    pub sound_enabled: bool,
    /// Text-generation command used for slugs; the prompt is fed on stdin.
    #[serde(default = "default_slug_command")]
    pub slug_command: Vec<String>,
    /// tmux `-L` socket name; the default server when unset.
    #[serde(default)]
    pub tmux_socket: Option<String>,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl Default for Settings {
    fn default() -> Self {
        let claude_trust = dirs::home_dir().map(|home| home.join(".claude.json"));
        Self {
            projects: Vec::new(),
            agents: vec![
                AgentConfig {
                    id: "claude".to_string(),
                    name: "Claude Code".to_string(),
                    start_command: "claude".to_string(),
                    trust_file: claude_trust,
                },
                AgentConfig {
                    id: "codex".to_string(),
                    name: "Codex".to_string(),
                    start_command: "codex".to_string(),
                    trust_file: None,
                },
            ],
            default_agent: Some("claude".to_string()),
            terminal_injection: None,
            agent_context_injection: None,
            sections: Vec::new(),
            notifications_enabled: true,
            sound_enabled: false,
            slug_command: default_slug_command(),
            tmux_socket: None,
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl Settings {
    pub fn project(&self, key: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.matches(key))
    }

    pub fn project_mut(&mut self, key: &str) -> Option<&mut Project> {
        self.projects.iter_mut().find(|p| p.matches(key))
    }

    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Agent for a new thread: explicit request > project default > global default.
    /// `Some("")` or `Some("shell")` requests a plain shell.
    pub fn resolve_agent(&self, requested: Option<&str>, project: &Project) -> Option<&AgentConfig> {
        let id = match requested {
            Some("") | Some("shell") => return None,
            Some(id) => Some(id),
            None => project
                .agent_default
                .as_deref()
                .or(self.default_agent.as_deref()),
        }?;
        self.agent(id)
    }

    /// Effective section list for a project (its overrides, else the global list).
    pub fn sections_for<'a>(&'a self, project: Option<&'a Project>) -> &'a [Section] {
        project
            .and_then(|p| p.section_overrides.as_deref())
            .unwrap_or(&self.sections)
    }
}
