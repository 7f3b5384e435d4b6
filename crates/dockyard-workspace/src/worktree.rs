//! Worktree descriptors and the git subprocess seam.

use crate::error::WorkspaceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockyard_core::{TaskId, WorkspaceStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::debug;

/// One linked worktree granted to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
    /// Checkout directory of the worktree.
    pub path: PathBuf,

    /// Branch checked out in the worktree.
    pub branch: String,

    /// Commit the worktree was created from.
    pub head_commit: String,

    /// Pool state of the descriptor.
    pub status: WorkspaceStatus,

    /// Owning task.
    pub task_id: TaskId,

    /// True for the main checkout, which is never pool-managed.
    pub is_main: bool,

    /// When the worktree was created.
    pub created_at: DateTime<Utc>,

    /// Last time a task used the worktree; drives staleness pruning.
    pub last_used_at: DateTime<Utc>,
}

impl WorkspaceDescriptor {
    /// Refresh the last-used stamp.
    pub fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }
}

/// Seam over the git operations the pool needs, so tests run without a
/// repository.
#[async_trait]
pub trait WorktreeGit: Send + Sync {
    /// Create a worktree at `path` on a new `branch`.
    async fn add_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), WorkspaceError>;

    /// Remove the worktree checkout.
    async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), WorkspaceError>;

    /// Resolve HEAD of the checkout at `path`.
    async fn head_commit(&self, path: &Path) -> Result<String, WorkspaceError>;

    /// Delete the task branch.
    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), WorkspaceError>;
}

/// Real implementation shelling out to `git`.
#[derive(Debug, Default)]
pub struct GitCli;

impl GitCli {
    async fn run(
        &self,
        operation: &'static str,
        dir: &Path,
        args: &[&str],
    ) -> Result<String, WorkspaceError> {
        debug!(?args, dir = %dir.display(), "Running git");
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(WorkspaceError::Git {
                operation,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl WorktreeGit for GitCli {
    async fn add_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), WorkspaceError> {
        let path_str = path.to_string_lossy();
        self.run(
            "worktree add",
            repo,
            &["worktree", "add", "-b", branch, path_str.as_ref()],
        )
        .await
        .map(|_| ())
    }

    async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), WorkspaceError> {
        let path_str = path.to_string_lossy();
        self.run(
            "worktree remove",
            repo,
            &["worktree", "remove", "--force", path_str.as_ref()],
        )
        .await
        .map(|_| ())
    }

    async fn head_commit(&self, path: &Path) -> Result<String, WorkspaceError> {
        self.run("rev-parse", path, &["rev-parse", "HEAD"])
            .await
            .map(|out| out.trim().to_string())
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), WorkspaceError> {
        self.run("branch delete", repo, &["branch", "-D", branch])
            .await
            .map(|_| ())
    }
}
