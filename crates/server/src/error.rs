//! Errors surfaced by orchestrator operations.

use crate::process::CommandError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("invalid name {0:?}: names must be non-empty and contain no path separators")]
    InvalidName(String),

    #[error("name already in use: {0}")]
    DuplicateName(String),

    #[error("worktree {path} is unavailable: {reason}")]
    WorktreeConflict { path: String, reason: String },

    #[error("invalid tab index {index} (thread has {count} tabs)")]
    InvalidTabIndex { index: usize, count: usize },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("the main thread cannot be archived or deleted")]
    CannotDeleteMainThread,

    #[error("cannot close the last tab; archive or delete the thread instead")]
    LastTab,

    #[error("could not find a unique name after {attempts} attempts")]
    NameGenerationFailed { attempts: usize },

    #[error("no thread name can be derived from {0:?}")]
    NoNameDerivable(String),

    #[error("section not found: {0}")]
    SectionNotFound(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] crate::persistence::StoreError),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

impl OrchestratorError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        OrchestratorError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Outcome of the best-effort steps that run after a primary operation has
/// already succeeded. Failures here never fail the operation itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn record(&mut self, step: &str, error: impl std::fmt::Display) {
        tracing::warn!(
            component = "cleanup",
            event = "cleanup.step_failed",
            step,
            error = %error,
            "Best-effort cleanup step failed"
        );
        self.failures.push(format!("{step}: {error}"));
    }

    /// Record the error of a fallible cleanup step, if any.
    pub fn check<T, E: std::fmt::Display>(&mut self, step: &str, result: Result<T, E>) {
        if let Err(e) = result {
            self.record(step, e);
        }
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
