//! Thread model

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleetdock_protocol::{TabInfo, TabState, ThreadSummary};

/// The unit of orchestration: a name, a branch, a worktree (or the repo
/// root for the main thread) and an ordered list of tmux sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub worktree_path: PathBuf,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub section_id: Option<String>,
    #[serde(default)]
    pub display_order: i64,
    #[serde(default)]
    pub selected_agent_type: Option<String>,
    #[serde(default)]
    pub tmux_session_names: Vec<String>,
    #[serde(default)]
    pub agent_sessions: BTreeSet<String>,
    #[serde(default)]
    pub pinned_sessions: BTreeSet<String>,
    #[serde(default)]
    pub custom_tab_names: BTreeMap<String, String>,
    #[serde(default)]
    pub unread_sessions: BTreeSet<String>,
    #[serde(default)]
    pub last_selected_session: Option<String>,
    #[serde(default)]
    pub last_agent_completion_at: Option<DateTime<Utc>>,
    /// Name came from the random generator and may be replaced from the first prompt.
    #[serde(default)]
    pub name_is_generated: bool,
    /// Name has already been derived from a first prompt.
    #[serde(default)]
    pub auto_named: bool,
    pub created_at: DateTime<Utc>,

    // Runtime-only state, re-derived by the reconciliation loop.
    #[serde(skip)]
    pub busy_sessions: BTreeSet<String>,
    #[serde(skip)]
    pub waiting_sessions: BTreeSet<String>,
    #[serde(skip)]
    pub is_dirty: bool,
    #[serde(skip)]
    pub is_fully_delivered: bool,
}

impl Thread {
    /// A thread bound to its own worktree and branch.
    pub fn new_worktree(
        project_id: &str,
        name: &str,
        worktree_path: PathBuf,
        base_branch: &str,
    ) -> Self {
        Self {
            id: fleetdock_protocol::new_id(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            worktree_path,
            branch_name: Some(name.to_string()),
            base_branch: Some(base_branch.to_string()),
            is_main: false,
            is_archived: false,
            is_pinned: false,
            section_id: None,
            display_order: 0,
            selected_agent_type: None,
            tmux_session_names: Vec::new(),
            agent_sessions: BTreeSet::new(),
            pinned_sessions: BTreeSet::new(),
            custom_tab_names: BTreeMap::new(),
            unread_sessions: BTreeSet::new(),
            last_selected_session: None,
            last_agent_completion_at: None,
            name_is_generated: false,
            auto_named: false,
            created_at: Utc::now(),
            busy_sessions: BTreeSet::new(),
            waiting_sessions: BTreeSet::new(),
            is_dirty: false,
            is_fully_delivered: false,
        }
    }

    /// The non-deletable thread bound to the project root.
    pub fn new_main(project_id: &str, name: &str, repo_path: PathBuf) -> Self {
        let mut thread = Self::new_worktree(project_id, name, repo_path, "");
        thread.is_main = true;
        thread.branch_name = None;
        thread.base_branch = None;
        thread
    }

    pub fn has_session(&self, session: &str) -> bool {
        self.tmux_session_names.iter().any(|s| s == session)
    }

    pub fn is_agent_session(&self, session: &str) -> bool {
        self.agent_sessions.contains(session)
    }

    pub fn session_at(&self, index: usize) -> Option<&str> {
        self.tmux_session_names.get(index).map(String::as_str)
    }

    /// First agent tab, if any.
    pub fn primary_agent_session(&self) -> Option<&str> {
        self.tmux_session_names
            .iter()
            .find(|s| self.agent_sessions.contains(s.as_str()))
            .map(String::as_str)
    }

    /// Append a session; duplicates are ignored.
    pub fn push_session(&mut self, session: &str, is_agent: bool) {
        if self.has_session(session) {
            return;
        }
        self.tmux_session_names.push(session.to_string());
        if is_agent {
            self.agent_sessions.insert(session.to_string());
        }
    }

    /// Remove a session and scrub it from every session-keyed structure.
    pub fn remove_session(&mut self, session: &str) -> bool {
        let before = self.tmux_session_names.len();
        self.tmux_session_names.retain(|s| s != session);
        self.agent_sessions.remove(session);
        self.pinned_sessions.remove(session);
        self.custom_tab_names.remove(session);
        self.unread_sessions.remove(session);
        self.busy_sessions.remove(session);
        self.waiting_sessions.remove(session);
        if self.last_selected_session.as_deref() == Some(session) {
            self.last_selected_session = None;
        }
        self.tmux_session_names.len() != before
    }

    /// Drop every tab (archival).
    pub fn clear_sessions(&mut self) {
        self.tmux_session_names.clear();
        self.agent_sessions.clear();
        self.pinned_sessions.clear();
        self.custom_tab_names.clear();
        self.unread_sessions.clear();
        self.busy_sessions.clear();
        self.waiting_sessions.clear();
        self.last_selected_session = None;
    }

    /// Re-key every session-name-indexed structure through `map` (old → new).
    /// Names missing from the map are kept as they are.
    pub fn rekey_sessions(&mut self, map: &HashMap<String, String>) {
        let rename = |s: &String| map.get(s).cloned().unwrap_or_else(|| s.clone());
        self.tmux_session_names = self.tmux_session_names.iter().map(rename).collect();
        self.agent_sessions = self.agent_sessions.iter().map(rename).collect();
        self.pinned_sessions = self.pinned_sessions.iter().map(rename).collect();
        self.unread_sessions = self.unread_sessions.iter().map(rename).collect();
        self.busy_sessions = self.busy_sessions.iter().map(rename).collect();
        self.waiting_sessions = self.waiting_sessions.iter().map(rename).collect();
        self.custom_tab_names = self
            .custom_tab_names
            .iter()
            .map(|(k, v)| (rename(k), v.clone()))
            .collect();
        self.last_selected_session = self.last_selected_session.as_ref().map(rename);
    }

    pub fn tab_state(&self, session: &str) -> TabState {
        if self.waiting_sessions.contains(session) {
            TabState::Waiting
        } else if self.busy_sessions.contains(session) {
            TabState::Busy
        } else {
            TabState::Idle
        }
    }

    pub fn tabs(&self) -> Vec<TabInfo> {
        self.tmux_session_names
            .iter()
            .enumerate()
            .map(|(index, session)| TabInfo {
                index,
                session_name: session.clone(),
                display_name: self
                    .custom_tab_names
                    .get(session)
                    .cloned()
                    .unwrap_or_else(|| session.clone()),
                is_agent: self.agent_sessions.contains(session),
                is_pinned: self.pinned_sessions.contains(session),
                state: self.tab_state(session),
                has_unread: self.unread_sessions.contains(session),
            })
            .collect()
    }

    pub fn summary(&self) -> ThreadSummary {
        ThreadSummary {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            name: self.name.clone(),
            branch_name: self.branch_name.clone(),
            base_branch: self.base_branch.clone(),
            worktree_path: self.worktree_path.display().to_string(),
            is_main: self.is_main,
            is_archived: self.is_archived,
            is_pinned: self.is_pinned,
            section_id: self.section_id.clone(),
            display_order: self.display_order,
            agent_type: self.selected_agent_type.clone(),
            is_dirty: self.is_dirty,
            is_fully_delivered: self.is_fully_delivered,
            last_agent_completion_at: self.last_agent_completion_at.map(|t| t.to_rfc3339()),
            tabs: self.tabs(),
        }
    }
}
