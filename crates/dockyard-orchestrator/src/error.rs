//! Orchestrator-level errors.

use dockyard_core::{TaskId, TaskStatus};
use thiserror::Error;

/// Errors raised by the task store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No task with this id exists.
    #[error("Task {0} not found")]
    NotFound(TaskId),

    /// Restore was requested for a task that is not in the trash.
    #[error("Task {0} is not in the trash")]
    NotTrashed(TaskId),

    /// Resume was requested for a task that is neither failed nor
    /// cancelled.
    #[error("Task {id} cannot be resumed from status {status:?}")]
    NotResumable { id: TaskId, status: TaskStatus },

    /// A task with this id already exists.
    #[error("Task {0} already exists")]
    AlreadyExists(TaskId),
}

/// Errors surfaced by the dispatcher.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Task store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Workspace provisioning failed.
    #[error(transparent)]
    Workspace(#[from] dockyard_workspace::WorkspaceError),

    /// Command routing or subprocess machinery failed.
    #[error(transparent)]
    Runtime(#[from] dockyard_runtime::RuntimeError),

    /// The usage provider could not report today's spend.
    #[error("Usage provider failed: {0}")]
    Usage(String),
}
