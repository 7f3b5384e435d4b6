//! Workspace provisioning errors.

use dockyard_core::TaskId;
use thiserror::Error;

/// Errors raised while provisioning or reclaiming workspaces.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The pool is at `max_worktrees`; the caller must back off.
    #[error("Workspace pool exhausted (limit {max}); cannot acquire for task {task_id}")]
    PoolExhausted { task_id: TaskId, max: usize },

    /// The task already holds a workspace.
    #[error("Task {0} already holds an active workspace")]
    AlreadyAcquired(TaskId),

    /// No workspace is known for the task.
    #[error("No workspace found for task {0}")]
    NotFound(TaskId),

    /// A git subprocess failed.
    #[error("git {operation} failed: {message}")]
    Git {
        operation: &'static str,
        message: String,
    },

    /// A container engine subprocess failed.
    #[error("Container workspace operation failed: {0}")]
    Container(String),

    /// Configuration rejected before provisioning.
    #[error(transparent)]
    Config(#[from] dockyard_core::CoreError),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
