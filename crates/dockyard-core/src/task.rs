//! Task lifecycle metadata.

use crate::{TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Task represents one unit of autonomous agent work.
///
/// `status` tracks the business state; `trashed_at`/`archived_at` are
/// independent timestamps so a completed task can be archived without
/// losing its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Human-readable title.
    pub title: String,

    /// Current business status.
    pub status: TaskStatus,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task was last modified.
    pub updated_at: DateTime<Utc>,

    /// Set when the task is moved to trash; cleared on restore.
    pub trashed_at: Option<DateTime<Utc>>,

    /// Set when the task is archived.
    pub archived_at: Option<DateTime<Utc>>,

    /// Number of times execution was resumed for this task.
    pub resume_count: u32,
}

impl Task {
    /// Create a new pending Task.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            title: title.into(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            trashed_at: None,
            archived_at: None,
            resume_count: 0,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Returns true if the task currently sits in the trash.
    pub fn is_trashed(&self) -> bool {
        self.trashed_at.is_some()
    }

    /// Returns true if the task has been archived.
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Stamp the task as trashed.
    pub fn mark_trashed(&mut self) {
        let now = Utc::now();
        self.trashed_at = Some(now);
        self.updated_at = now;
    }

    /// Undo a trash operation: clear the stamp and reset the task to the
    /// default actionable state.
    pub fn restore(&mut self) {
        let now = Utc::now();
        self.trashed_at = None;
        self.status = TaskStatus::Pending;
        self.updated_at = now;
    }

    /// Stamp the task as archived.
    pub fn mark_archived(&mut self) {
        let now = Utc::now();
        self.archived_at = Some(now);
        self.updated_at = now;
    }
}
