//! Typed domain events emitted by the orchestration layers.

use crate::ids::{ContainerId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of container lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerEventKind {
    Created,
    Started,
    Stopped,
    Died,
    Removed,
    Health,
}

impl ContainerEventKind {
    /// Returns true if no further events may follow for the same container
    /// within one monitoring session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Died | Self::Removed)
    }
}

/// Data specific to each lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerEventData {
    Created {
        image: Option<String>,
    },
    Started {},
    Stopped {
        exit_code: Option<i64>,
    },
    Died {
        exit_code: Option<i64>,
        oom_killed: bool,
        /// Synthesized as "SIGKILL" for OOM kills.
        signal: Option<String>,
    },
    Removed {},
    Health {
        health_status: Option<String>,
    },
}

/// A container lifecycle event, correlated to a task where possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEvent {
    /// Which transition occurred.
    pub kind: ContainerEventKind,

    /// Task owning the container, if the container name carried the
    /// managed prefix.
    pub task_id: Option<TaskId>,

    /// Engine-assigned container id.
    pub container_id: ContainerId,

    /// Container name as reported by the engine.
    pub container_name: String,

    /// When the engine reported the event.
    pub timestamp: DateTime<Utc>,

    /// Transition-specific payload.
    pub data: ContainerEventData,
}

impl ContainerEvent {
    /// Create a new container event stamped with the current time.
    pub fn new(
        kind: ContainerEventKind,
        task_id: Option<TaskId>,
        container_id: ContainerId,
        container_name: impl Into<String>,
        data: ContainerEventData,
    ) -> Self {
        Self {
            kind,
            task_id,
            container_id,
            container_name: container_name.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Returns true if this event ends the container's lifecycle for the
    /// current monitoring session.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Events emitted around a single routed command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Emitted exactly once before a command is dispatched.
    Started { task_id: TaskId, command: String },
    /// Terminal: the command produced a result (success or not).
    Completed {
        task_id: TaskId,
        command: String,
        success: bool,
        exit_code: Option<i32>,
        duration_ms: u64,
    },
    /// Terminal: the execution machinery itself failed.
    Failed {
        task_id: TaskId,
        command: String,
        error: String,
    },
}

impl ExecutionEvent {
    /// Task the event belongs to.
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Started { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. } => task_id,
        }
    }
}

/// Union of domain events published on the orchestrator bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Container(ContainerEvent),
    Execution(ExecutionEvent),
    /// A trashed task was restored; carries the updated task.
    TaskRestored(crate::Task),
}
