//! Git worktree/branch operations, run through the `git` CLI.

use std::path::Path;

use async_trait::async_trait;
use fleetdock_protocol::DiffStats;

use crate::process::{run_command, CommandError};

#[async_trait]
pub trait GitCollaborator: Send + Sync {
    /// `git worktree add -b <branch> <path> <base>`
    async fn create_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), CommandError>;

    /// Check out an existing branch into a new worktree.
    async fn attach_worktree(&self, repo: &Path, path: &Path, branch: &str)
        -> Result<(), CommandError>;

    async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), CommandError>;

    async fn prune_worktrees(&self, repo: &Path) -> Result<(), CommandError>;

    async fn rename_branch(&self, repo: &Path, old: &str, new: &str) -> Result<(), CommandError>;

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), CommandError>;

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool, CommandError>;

    /// Working tree has uncommitted changes (tracked or untracked).
    async fn is_dirty(&self, path: &Path) -> Result<bool, CommandError>;

    /// Diff stats of the working tree against the merge base with `base`.
    async fn diff_stats(&self, path: &Path, base: &str) -> Result<DiffStats, CommandError>;

    /// Commits beyond `base` exist and every one of them is already in `base`
    /// (cherry-picked or merged).
    async fn is_fully_delivered(&self, path: &Path, base: &str) -> Result<bool, CommandError>;

    async fn default_branch(&self, repo: &Path) -> Result<Option<String>, CommandError>;

    /// Branch checked out in `path`, `None` on a detached HEAD.
    async fn current_branch(&self, path: &Path) -> Result<Option<String>, CommandError>;

    /// Unified diff of the working tree against the merge base with `base`.
    async fn diff(&self, path: &Path, base: &str) -> Result<String, CommandError>;
}

/// `GitCollaborator` backed by the `git` binary on `PATH`.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitCli {
    async fn git(&self, args: &[&str], cwd: &Path) -> Result<String, CommandError> {
        run_command(&self.program, args, Some(cwd))
            .await
            .map(|out| out.stdout)
    }

    async fn merge_base(&self, path: &Path, base: &str) -> Result<String, CommandError> {
        let out = self.git(&["merge-base", base, "HEAD"], path).await?;
        Ok(out.trim().to_string())
    }
}

#[async_trait]
impl GitCollaborator for GitCli {
    async fn create_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), CommandError> {
        let path = path.to_string_lossy();
        self.git(&["worktree", "add", "-b", branch, &path, base], repo)
            .await
            .map(drop)
    }

    async fn attach_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), CommandError> {
        let path = path.to_string_lossy();
        self.git(&["worktree", "add", &path, branch], repo)
            .await
            .map(drop)
    }

    async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), CommandError> {
        let path = path.to_string_lossy();
        self.git(&["worktree", "remove", "--force", &path], repo)
            .await
            .map(drop)
    }

    async fn prune_worktrees(&self, repo: &Path) -> Result<(), CommandError> {
        self.git(&["worktree", "prune"], repo).await.map(drop)
    }

    async fn rename_branch(&self, repo: &Path, old: &str, new: &str) -> Result<(), CommandError> {
        self.git(&["branch", "-m", old, new], repo).await.map(drop)
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), CommandError> {
        self.git(&["branch", "-D", branch], repo).await.map(drop)
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool, CommandError> {
        let reference = format!("refs/heads/{branch}");
        match self
            .git(&["show-ref", "--verify", "--quiet", &reference], repo)
            .await
        {
            Ok(_) => Ok(true),
            Err(CommandError::Failed { exit_code: Some(1), .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_dirty(&self, path: &Path) -> Result<bool, CommandError> {
        let out = self.git(&["status", "--porcelain"], path).await?;
        Ok(!out.trim().is_empty())
    }

    async fn diff_stats(&self, path: &Path, base: &str) -> Result<DiffStats, CommandError> {
        let merge_base = self.merge_base(path, base).await?;
        let out = self.git(&["diff", "--shortstat", &merge_base], path).await?;
        Ok(parse_shortstat(&out))
    }

    async fn is_fully_delivered(&self, path: &Path, base: &str) -> Result<bool, CommandError> {
        let range = format!("{base}..HEAD");
        let ahead = self.git(&["rev-list", "--count", &range], path).await?;
        let ahead: u64 = ahead.trim().parse().unwrap_or(0);
        if ahead == 0 {
            return Ok(false);
        }
        let cherry = self.git(&["cherry", base, "HEAD"], path).await?;
        Ok(cherry_all_upstream(&cherry))
    }

    async fn default_branch(&self, repo: &Path) -> Result<Option<String>, CommandError> {
        if let Ok(out) = self
            .git(
                &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
                repo,
            )
            .await
        {
            let name = out.trim();
            if let Some(branch) = name.strip_prefix("origin/") {
                return Ok(Some(branch.to_string()));
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(repo, candidate).await? {
                return Ok(Some(candidate.to_string()));
            }
        }
        self.current_branch(repo).await
    }

    async fn current_branch(&self, path: &Path) -> Result<Option<String>, CommandError> {
        let out = self.git(&["rev-parse", "--abbrev-ref", "HEAD"], path).await?;
        let branch = out.trim();
        Ok((!branch.is_empty() && branch != "HEAD").then(|| branch.to_string()))
    }

    async fn diff(&self, path: &Path, base: &str) -> Result<String, CommandError> {
        let merge_base = self.merge_base(path, base).await?;
        self.git(&["diff", &merge_base], path).await
    }
}

/// Parse `git diff --shortstat` output, e.g.
/// ` 3 files changed, 10 insertions(+), 2 deletions(-)`.
fn parse_shortstat(output: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for part in output.trim().split(',') {
        let mut words = part.split_whitespace();
        let Some(count) = words.next().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        match words.next() {
            Some(w) if w.starts_with("file") => stats.files_changed = count,
            Some(w) if w.starts_with("insertion") => stats.insertions = count,
            Some(w) if w.starts_with("deletion") => stats.deletions = count,
            _ => {}
        }
    }
    stats
}

/// `git cherry` marks commits missing upstream with `+`.
fn cherry_all_upstream(output: &str) -> bool {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .all(|l| l.starts_with('-'))
}
