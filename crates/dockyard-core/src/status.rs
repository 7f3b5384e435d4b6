//! Status enums for Tasks and Workspaces.

use serde::{Deserialize, Serialize};

/// Business status of a Task.
///
/// Orthogonal to trash/archive stamps: a task may be `Completed` and later
/// archived without its status changing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created (or restored) and actionable, not yet dispatched.
    #[default]
    Pending,
    /// Task is actively being worked by an agent.
    InProgress,
    /// Task completed successfully.
    Completed,
    /// Task failed.
    Failed,
    /// Task was cancelled by user or system.
    Cancelled,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Status of a workspace descriptor in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    /// Workspace is assigned to a task and in use.
    Active,
    /// Workspace is idle but not yet old enough to reclaim.
    Stale,
    /// An external process holds the workspace; blocks pruning and reuse.
    Locked,
    /// Workspace idled past the staleness window and may be removed.
    Prunable,
}

impl WorkspaceStatus {
    /// Returns true if the workspace is held and must never be pruned.
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Active | Self::Locked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_held_workspaces() {
        assert!(WorkspaceStatus::Active.is_held());
        assert!(WorkspaceStatus::Locked.is_held());
        assert!(!WorkspaceStatus::Stale.is_held());
        assert!(!WorkspaceStatus::Prunable.is_held());
    }

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(TaskStatus::default(), TaskStatus::Pending);
    }
}
