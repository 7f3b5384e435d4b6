//! Task persistence and the trash/restore/archive lifecycle.

use crate::bus::EventBus;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use dockyard_core::{OrchestratorEvent, Task, TaskId, TaskStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// Partial update applied to a task; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
    pub resume_count: Option<u32>,
}

impl TaskPatch {
    /// Patch that only changes the status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Persistence seam for tasks.
///
/// Implementations must keep `updated_at` current on every mutation and
/// must publish exactly one `TaskRestored` event per successful restore.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task; rejects duplicate ids.
    async fn create_task(&self, task: Task) -> Result<Task, StoreError>;

    /// Fetch a task by id.
    async fn get_task(&self, id: &TaskId) -> Result<Task, StoreError>;

    /// Apply a partial update.
    async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, StoreError>;

    /// Soft-delete: stamp `trashed_at`. Idempotent on already-trashed
    /// tasks.
    async fn move_to_trash(&self, id: &TaskId) -> Result<Task, StoreError>;

    /// Undo a trash: clear `trashed_at` and reset the task to pending.
    ///
    /// Fails with [`StoreError::NotTrashed`] when the task is not in the
    /// trash.
    async fn restore_from_trash(&self, id: &TaskId) -> Result<Task, StoreError>;

    /// Stamp the task as archived, keeping its status.
    async fn archive(&self, id: &TaskId) -> Result<Task, StoreError>;

    /// All non-trashed, non-archived tasks.
    async fn list_active(&self) -> Vec<Task>;
}

/// In-memory store backing tests and single-process deployments.
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    bus: EventBus,
}

impl MemoryTaskStore {
    /// Create a store publishing lifecycle events on `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            bus,
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, task: Task) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id.clone()));
        }
        info!(task_id = %task.id, title = %task.title, "Task created");
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(resume_count) = patch.resume_count {
            task.resume_count = resume_count;
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn move_to_trash(&self, id: &TaskId) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if !task.is_trashed() {
            task.mark_trashed();
            info!(task_id = %id, "Task moved to trash");
        }
        Ok(task.clone())
    }

    async fn restore_from_trash(&self, id: &TaskId) -> Result<Task, StoreError> {
        let restored = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if !task.is_trashed() {
                return Err(StoreError::NotTrashed(id.clone()));
            }
            task.restore();
            task.clone()
        };

        info!(task_id = %id, "Task restored from trash");
        self.bus
            .publish(OrchestratorEvent::TaskRestored(restored.clone()));
        Ok(restored)
    }

    async fn archive(&self, id: &TaskId) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        task.mark_archived();
        info!(task_id = %id, "Task archived");
        Ok(task.clone())
    }

    async fn list_active(&self) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| !t.is_trashed() && !t.is_archived())
            .cloned()
            .collect()
    }
}
