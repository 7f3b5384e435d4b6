//! Container workspaces: one named, long-lived container per task.

use crate::error::WorkspaceError;
use dockyard_core::{ContainerId, ResourceLimits, TaskId};
use dockyard_runtime::{
    CommandRunner, CreateContainerCommand, Invocation, ProcessRunner, RuntimeKind,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long engine create/remove calls may take.
const ENGINE_TIMEOUT: Duration = Duration::from_secs(120);

/// Provisions dedicated containers for tasks.
///
/// Containers are named `<prefix>-<task id>` so the lifecycle monitor can
/// correlate engine events back to tasks. Resource limits are validated
/// once at construction; provisioning never re-checks them.
pub struct ContainerProvisioner {
    engine: RuntimeKind,
    runner: Arc<dyn CommandRunner>,
    name_prefix: String,
    image: String,
    limits: ResourceLimits,
}

impl ContainerProvisioner {
    /// Create a provisioner; rejects out-of-range resource limits.
    pub fn new(
        engine: RuntimeKind,
        name_prefix: impl Into<String>,
        image: impl Into<String>,
        limits: ResourceLimits,
    ) -> Result<Self, WorkspaceError> {
        limits.validate()?;
        Ok(Self {
            engine,
            runner: Arc::new(ProcessRunner),
            name_prefix: name_prefix.into(),
            image: image.into(),
            limits,
        })
    }

    /// Swap the subprocess runner (used by tests).
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Container name for a task.
    pub fn container_name(&self, task_id: &TaskId) -> String {
        format!("{}-{}", self.name_prefix, task_id)
    }

    /// Create the task's container and return its engine id.
    pub async fn create(
        &self,
        task_id: &TaskId,
        workspace_dir: Option<&std::path::Path>,
    ) -> Result<ContainerId, WorkspaceError> {
        let name = self.container_name(task_id);
        let mut command = CreateContainerCommand::new(&name, &self.image)
            .with_limits(self.limits.clone());
        if let Some(dir) = workspace_dir {
            command = command.with_workspace_mount(dir, "/workspace");
        }

        let output = self
            .runner
            .run(
                Invocation {
                    program: self.engine.binary().to_string(),
                    args: command.to_args(),
                    working_dir: None,
                    env: Vec::new(),
                },
                ENGINE_TIMEOUT,
            )
            .await
            .map_err(|err| WorkspaceError::Container(err.to_string()))?;

        if output.exit_code != Some(0) {
            return Err(WorkspaceError::Container(format!(
                "create for task {task_id} exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        // `run --detach` prints the container id on stdout.
        let container_id = ContainerId::new(output.stdout.trim());
        info!(task_id = %task_id, container_id = %container_id, name = %name, "Container workspace created");
        Ok(container_id)
    }

    /// Force-remove the task's container.
    pub async fn destroy(&self, task_id: &TaskId) -> Result<(), WorkspaceError> {
        let name = self.container_name(task_id);
        let output = self
            .runner
            .run(
                Invocation {
                    program: self.engine.binary().to_string(),
                    args: vec!["rm".to_string(), "--force".to_string(), name.clone()],
                    working_dir: None,
                    env: Vec::new(),
                },
                ENGINE_TIMEOUT,
            )
            .await
            .map_err(|err| WorkspaceError::Container(err.to_string()))?;

        if output.exit_code != Some(0) {
            warn!(
                task_id = %task_id,
                exit_code = ?output.exit_code,
                "Container removal reported failure"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dockyard_runtime::{RawOutput, RuntimeError};
    use tokio::sync::Mutex;

    struct RecordingRunner {
        invocations: Mutex<Vec<Invocation>>,
        stdout: String,
    }

    impl RecordingRunner {
        fn new(stdout: &str) -> Arc<Self> {
            Arc::new(Self {
                invocations: Mutex::new(Vec::new()),
                stdout: stdout.to_string(),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(
            &self,
            invocation: Invocation,
            _timeout: Duration,
        ) -> Result<RawOutput, RuntimeError> {
            self.invocations.lock().await.push(invocation);
            Ok(RawOutput {
                stdout: self.stdout.clone(),
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    fn limits() -> ResourceLimits {
        ResourceLimits {
            cpus: Some(2.0),
            memory: Some("4g".to_string()),
            cpu_shares: None,
            pids_limit: Some(256),
        }
    }

    #[tokio::test]
    async fn test_create_names_and_limits() {
        let runner = RecordingRunner::new("deadbeef\n");
        let provisioner =
            ContainerProvisioner::new(RuntimeKind::Docker, "dockyard", "ubuntu:24.04", limits())
                .unwrap()
                .with_runner(runner.clone());

        let id = provisioner.create(&TaskId::new("t7"), None).await.unwrap();
        assert_eq!(id.as_str(), "deadbeef");

        let invocations = runner.invocations.lock().await;
        assert_eq!(invocations[0].program, "docker");
        let args = &invocations[0].args;
        assert!(args.windows(2).any(|w| w[0] == "--name" && w[1] == "dockyard-t7"));
        assert!(args.windows(2).any(|w| w[0] == "--cpus" && w[1] == "2"));
        assert!(args.windows(2).any(|w| w[0] == "--pids-limit" && w[1] == "256"));
    }

    #[tokio::test]
    async fn test_invalid_limits_rejected_at_construction() {
        let bad = ResourceLimits {
            cpus: Some(999.0),
            ..Default::default()
        };
        let result =
            ContainerProvisioner::new(RuntimeKind::Docker, "dockyard", "ubuntu:24.04", bad);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_destroy_force_removes_by_name() {
        let runner = RecordingRunner::new("");
        let provisioner =
            ContainerProvisioner::new(RuntimeKind::Podman, "dockyard", "ubuntu:24.04", limits())
                .unwrap()
                .with_runner(runner.clone());

        provisioner.destroy(&TaskId::new("t7")).await.unwrap();

        let invocations = runner.invocations.lock().await;
        assert_eq!(invocations[0].program, "podman");
        assert_eq!(invocations[0].args, vec!["rm", "--force", "dockyard-t7"]);
    }
}
