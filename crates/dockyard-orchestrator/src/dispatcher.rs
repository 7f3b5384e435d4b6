//! Dispatch glue: admission control, workspace provisioning, routed
//! execution, and task bookkeeping for one task at a time.

use crate::bus::EventBus;
use crate::capacity::{self, CapacityDecision, UsageProvider};
use crate::error::{OrchestratorError, StoreError};
use crate::store::{TaskPatch, TaskStore};
use chrono::Utc;
use dockyard_core::{
    CapacityConfig, ContainerEvent, ContainerEventData, ContainerEventKind, OrchestratorEvent,
    TaskId, TaskStatus, WorkspaceStrategy,
};
use dockyard_runtime::{
    ContainerLifecycleMonitor, ExecuteOptions, ExecutionContext, ExecutionResult, ExecutionRouter,
    RuntimeKind,
};
use dockyard_workspace::{ContainerProvisioner, ReleaseOutcome, WorktreePool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Dispatcher-wide settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Daily spend budget admission control compares usage against.
    pub daily_budget: f64,

    /// Time windows and thresholds for admission control.
    pub capacity: CapacityConfig,

    /// How task workspaces are provisioned.
    pub strategy: WorkspaceStrategy,

    /// Engine used for container workspaces.
    pub runtime_kind: RuntimeKind,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            daily_budget: 100.0,
            capacity: CapacityConfig::default(),
            strategy: WorkspaceStrategy::Worktree,
            runtime_kind: RuntimeKind::Docker,
        }
    }
}

/// Result of one dispatch attempt.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Admission control refused to start work.
    Paused(CapacityDecision),

    /// The task ran; `status` is the terminal status recorded in the
    /// store and `results` are the per-command outcomes.
    Finished {
        status: TaskStatus,
        results: Vec<ExecutionResult>,
    },
}

/// Decrements the active-task counter when a dispatch ends, on every
/// exit path.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drives tasks through admission, provisioning, execution, and
/// bookkeeping.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    usage: Arc<dyn UsageProvider>,
    pool: Arc<WorktreePool>,
    provisioner: Option<Arc<ContainerProvisioner>>,
    router: Arc<ExecutionRouter>,
    bus: EventBus,
    config: DispatcherConfig,
    active: AtomicUsize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        usage: Arc<dyn UsageProvider>,
        pool: Arc<WorktreePool>,
        router: Arc<ExecutionRouter>,
        bus: EventBus,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            usage,
            pool,
            provisioner: None,
            router,
            bus,
            config,
            active: AtomicUsize::new(0),
        }
    }

    /// Attach a container provisioner, enabling the container workspace
    /// strategy.
    pub fn with_provisioner(mut self, provisioner: Arc<ContainerProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Tasks currently executing.
    pub fn active_task_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Check admission without starting anything.
    pub async fn check_capacity(&self) -> Result<CapacityDecision, OrchestratorError> {
        let usage = self.usage.daily_usage().await?;
        Ok(capacity::decide(
            Utc::now(),
            &usage,
            self.active_task_count(),
            self.config.daily_budget,
            &self.config.capacity,
        ))
    }

    /// Run `commands` for the task, end to end.
    ///
    /// The task must already exist in the store. Commands run strictly
    /// in order and stop at the first failure; the terminal status is
    /// recorded before this returns.
    pub async fn dispatch(
        &self,
        task_id: &TaskId,
        commands: &[String],
    ) -> Result<DispatchOutcome, OrchestratorError> {
        let decision = self.check_capacity().await?;
        if decision.should_pause {
            info!(
                task_id = %task_id,
                mode = ?decision.time_window.mode,
                current = decision.capacity.current_percentage,
                threshold = decision.capacity.threshold_percentage,
                "Dispatch paused by admission control"
            );
            return Ok(DispatchOutcome::Paused(decision));
        }

        // The task must exist before any resources are provisioned.
        self.store.get_task(task_id).await?;

        self.active.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        self.store
            .update_task(task_id, TaskPatch::status(TaskStatus::InProgress))
            .await?;

        let (context, release_pool) = match self.provision(task_id).await {
            Ok(provisioned) => provisioned,
            Err(err) => {
                self.store
                    .update_task(task_id, TaskPatch::status(TaskStatus::Failed))
                    .await?;
                return Err(err);
            }
        };

        let outcome = self
            .router
            .execute_sequential(commands, &context, &ExecuteOptions::default())
            .await;

        match outcome {
            Ok(results) => {
                let all_succeeded = results.iter().all(|r| r.success);
                let status = if all_succeeded {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                self.store
                    .update_task(task_id, TaskPatch::status(status))
                    .await?;
                self.destroy_container(&context).await;
                if release_pool {
                    let release = if all_succeeded {
                        ReleaseOutcome::Success
                    } else {
                        ReleaseOutcome::Failure
                    };
                    self.pool.release(task_id, release).await?;
                }
                info!(task_id = %task_id, ?status, commands = results.len(), "Dispatch finished");
                Ok(DispatchOutcome::Finished { status, results })
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "Dispatch failed in execution machinery");
                self.store
                    .update_task(task_id, TaskPatch::status(TaskStatus::Failed))
                    .await?;
                self.destroy_container(&context).await;
                if release_pool {
                    self.pool.release(task_id, ReleaseOutcome::Failure).await?;
                }
                Err(err.into())
            }
        }
    }

    /// Best-effort removal of the task's container workspace.
    ///
    /// Containers are removed on every release outcome, including
    /// failure: the bind-mounted worktree keeps all on-disk state for
    /// post-mortem debugging, while an idling container only holds
    /// engine resources.
    async fn destroy_container(&self, context: &ExecutionContext) {
        if !context.is_container_workspace {
            return;
        }
        let Some(provisioner) = &self.provisioner else {
            return;
        };
        if let Err(err) = provisioner.destroy(&context.task_id).await {
            warn!(task_id = %context.task_id, error = %err, "Failed to remove task container");
        }
    }

    /// Mark a task cancelled and free its workspace.
    ///
    /// Cancellation is bookkeeping here; in-flight subprocesses finish
    /// under their own timeouts.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<(), OrchestratorError> {
        self.store
            .update_task(task_id, TaskPatch::status(TaskStatus::Cancelled))
            .await?;
        // Container removal is force + by name, so it is safe even when
        // the task never got as far as provisioning one.
        if let Some(provisioner) = &self.provisioner {
            if let Err(err) = provisioner.destroy(task_id).await {
                warn!(task_id = %task_id, error = %err, "Failed to remove task container");
            }
        }
        if self.pool.get(task_id).await.is_some() {
            self.pool.release(task_id, ReleaseOutcome::Failure).await?;
        }
        info!(task_id = %task_id, "Task cancelled");
        Ok(())
    }

    /// Put a failed or cancelled task back in line for another attempt,
    /// bumping its resume counter.
    pub async fn prepare_resume(&self, task_id: &TaskId) -> Result<(), OrchestratorError> {
        let task = self.store.get_task(task_id).await?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(StoreError::NotResumable {
                id: task_id.clone(),
                status: task.status,
            }
            .into());
        }
        self.store
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Pending),
                    resume_count: Some(task.resume_count + 1),
                    ..Default::default()
                },
            )
            .await?;
        info!(task_id = %task_id, resume_count = task.resume_count + 1, "Task queued for resume");
        Ok(())
    }

    /// Provision the task's workspace per the configured strategy.
    ///
    /// Returns the execution context and whether the worktree pool must
    /// be released afterwards.
    async fn provision(
        &self,
        task_id: &TaskId,
    ) -> Result<(ExecutionContext, bool), OrchestratorError> {
        match self.config.strategy {
            WorkspaceStrategy::None => {
                Ok((ExecutionContext::local(task_id.clone(), None), false))
            }
            WorkspaceStrategy::Directory => {
                // Scratch directories are cheap; they are not pooled and
                // never reclaimed automatically.
                Ok((ExecutionContext::local(task_id.clone(), None), false))
            }
            WorkspaceStrategy::Worktree => {
                let descriptor = self.pool.acquire(task_id).await?;
                Ok((
                    ExecutionContext::local(task_id.clone(), Some(descriptor.path)),
                    true,
                ))
            }
            WorkspaceStrategy::Container => {
                let Some(provisioner) = &self.provisioner else {
                    warn!(
                        task_id = %task_id,
                        "Container strategy with no provisioner; degrading to worktree"
                    );
                    let descriptor = self.pool.acquire(task_id).await?;
                    return Ok((
                        ExecutionContext::local(task_id.clone(), Some(descriptor.path)),
                        true,
                    ));
                };
                let descriptor = self.pool.acquire(task_id).await?;
                let container_id = match provisioner.create(task_id, Some(&descriptor.path)).await
                {
                    Ok(id) => id,
                    Err(err) => {
                        // Do not leave the worktree held by a task that
                        // never got its container.
                        self.pool.release(task_id, ReleaseOutcome::Failure).await?;
                        return Err(err.into());
                    }
                };
                Ok((
                    ExecutionContext::container(
                        task_id.clone(),
                        Some(container_id),
                        self.config.runtime_kind,
                        Some("/workspace".into()),
                    ),
                    true,
                ))
            }
        }
    }

    /// Fold one container lifecycle event into the bus and the store.
    ///
    /// A `died` event for a managed container settles its task: exit 0
    /// completes it, anything else fails it.
    pub async fn handle_container_event(&self, event: ContainerEvent) {
        self.bus
            .publish(OrchestratorEvent::Container(event.clone()));

        if event.kind != ContainerEventKind::Died {
            return;
        }
        let Some(task_id) = &event.task_id else {
            debug!(container = %event.container_name, "Died event for unmanaged container");
            return;
        };

        let (exit_code, oom_killed) = match &event.data {
            ContainerEventData::Died {
                exit_code,
                oom_killed,
                ..
            } => (*exit_code, *oom_killed),
            _ => (None, false),
        };
        if oom_killed {
            warn!(task_id = %task_id, "Task container was OOM-killed");
        }

        let status = if exit_code == Some(0) {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        if let Err(err) = self
            .store
            .update_task(task_id, TaskPatch::status(status))
            .await
        {
            debug!(task_id = %task_id, error = %err, "Container died for unknown task");
        }
    }

    /// Forward the monitor's container events into the dispatcher until
    /// the monitor's channel closes.
    pub fn spawn_container_bridge(
        self: Arc<Self>,
        monitor: &ContainerLifecycleMonitor,
    ) -> JoinHandle<()> {
        let mut events = monitor.subscribe();
        let dispatcher = self;
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => dispatcher.handle_container_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Container bridge lagged; events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Forward the router's execution events onto the bus until the
    /// router is dropped.
    pub fn spawn_execution_bridge(&self) -> JoinHandle<()> {
        let mut events = self.router.subscribe();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => bus.publish(OrchestratorEvent::Execution(event)),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Execution bridge lagged; events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
