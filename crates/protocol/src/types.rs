//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Runtime state of a single tab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabState {
    Idle,
    Busy,
    Waiting,
}

/// One tab of a thread, derived from its ordered session list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub index: usize,
    pub session_name: String,
    pub display_name: String,
    pub is_agent: bool,
    pub is_pinned: bool,
    pub state: TabState,
    pub has_unread: bool,
}

/// Summary of a thread as exposed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub worktree_path: String,
    pub is_main: bool,
    pub is_archived: bool,
    pub is_pinned: bool,
    pub section_id: Option<String>,
    pub display_order: i64,
    pub agent_type: Option<String>,
    pub is_dirty: bool,
    pub is_fully_delivered: bool,
    pub last_agent_completion_at: Option<String>,
    pub tabs: Vec<TabInfo>,
}

/// Line-level diff statistics relative to the merge base
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStats {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

/// Detailed thread view returned by `thread-info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDetail {
    #[serde(flatten)]
    pub summary: ThreadSummary,
    pub diff_stats: Option<DiffStats>,
    pub project_name: String,
}

/// A registered repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub repo_path: String,
    pub default_branch: Option<String>,
    pub worktree_base: String,
    pub agent_default: Option<String>,
    pub thread_count: usize,
}

/// A sidebar section grouping threads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionSummary {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
    pub hidden: bool,
    pub position: usize,
}
