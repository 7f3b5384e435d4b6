//! Uniform command execution: in-container or local subprocess.
//!
//! The routing rule is deliberate: container execution is used only when
//! the task's context is a container workspace *and* a container id is
//! present. A container workspace with no container falls back to local
//! execution as an explicit degraded mode, not an error.

use crate::command::ExecCommand;
use crate::detector::RuntimeKind;
use crate::error::RuntimeError;
use crate::process::terminate_with_grace;
use async_trait::async_trait;
use dockyard_core::{ContainerId, ExecutionEvent, TaskId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Router-wide default when the caller gives no timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Grace between SIGTERM and SIGKILL on timeout.
const TIMEOUT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Exit code reported for a timed-out execution.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Bound of the execution event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where a task's commands run. Created once at dispatch time and
/// immutable for the task's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Task the context belongs to.
    pub task_id: TaskId,

    /// Container assigned to the task, when one exists.
    pub container_id: Option<ContainerId>,

    /// True when the task was provisioned a container workspace.
    pub is_container_workspace: bool,

    /// Engine driving the container, when relevant.
    pub runtime_kind: Option<RuntimeKind>,

    /// Working directory for local execution, or inside the container.
    pub working_dir: Option<PathBuf>,
}

impl ExecutionContext {
    /// Local-only context for a task.
    pub fn local(task_id: TaskId, working_dir: Option<PathBuf>) -> Self {
        Self {
            task_id,
            container_id: None,
            is_container_workspace: false,
            runtime_kind: None,
            working_dir,
        }
    }

    /// Context for a task with a container workspace.
    pub fn container(
        task_id: TaskId,
        container_id: Option<ContainerId>,
        runtime_kind: RuntimeKind,
        working_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            task_id,
            container_id,
            is_container_workspace: true,
            runtime_kind: Some(runtime_kind),
            working_dir,
        }
    }
}

/// Which path an execution took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Container,
    Local,
}

/// Outcome of one routed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub mode: ExecutionMode,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub error: Option<String>,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Overrides the router-wide default timeout.
    pub timeout: Option<Duration>,

    /// Extra environment variables for the command.
    pub env: Vec<(String, String)>,
}

/// A fully resolved subprocess invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Raw output of one invocation.
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Seam over subprocess execution so tests can count and script runs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: Invocation, timeout: Duration)
        -> Result<RawOutput, RuntimeError>;
}

/// Runner backed by real subprocesses with two-stage timeout kill.
#[derive(Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: Invocation,
        timeout: Duration,
    ) -> Result<RawOutput, RuntimeError> {
        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &invocation.env {
            command.env(key, value);
        }

        let mut child = command.spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_to_string(stdout));
        let stderr_task = tokio::spawn(read_to_string(stderr));

        let (timed_out, status) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (false, Some(status?)),
            Err(_) => {
                warn!(
                    program = %invocation.program,
                    timeout_ms = timeout.as_millis() as u64,
                    "Execution timed out, terminating child"
                );
                let status = terminate_with_grace(&mut child, TIMEOUT_KILL_GRACE).await?;
                (true, status)
            }
        };

        let stdout = stdout_task
            .await
            .map_err(|err| RuntimeError::TaskJoin(err.to_string()))?;
        let stderr = stderr_task
            .await
            .map_err(|err| RuntimeError::TaskJoin(err.to_string()))?;

        let exit_code = if timed_out {
            Some(TIMEOUT_EXIT_CODE)
        } else {
            status.and_then(|s| s.code())
        };

        Ok(RawOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
        })
    }
}

async fn read_to_string<R: AsyncReadExt + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = String::new();
    let _ = reader.read_to_string(&mut buf).await;
    buf
}

/// Routes commands to a task's container or to a local subprocess.
///
/// Independent `execute` calls are safe concurrently and never serialize
/// against each other.
pub struct ExecutionRouter {
    runner: Arc<dyn CommandRunner>,
    events_tx: broadcast::Sender<ExecutionEvent>,
    default_timeout: Duration,
}

impl Default for ExecutionRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionRouter {
    /// Create a router backed by real subprocesses.
    pub fn new() -> Self {
        Self::with_runner(Arc::new(ProcessRunner))
    }

    /// Create a router with a custom runner (used by tests).
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            runner,
            events_tx,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the router-wide default timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Subscribe to `execution:*` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events_tx.subscribe()
    }

    /// Run one command in the task's environment.
    ///
    /// Emits `Started` before dispatch and exactly one of
    /// `Completed`/`Failed` after.
    pub async fn execute(
        &self,
        command: &str,
        context: &ExecutionContext,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, RuntimeError> {
        let mode = self.resolve_mode(context);
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let invocation = build_invocation(command, context, options, mode);

        debug!(
            task_id = %context.task_id,
            ?mode,
            program = %invocation.program,
            "Dispatching command"
        );
        let _ = self.events_tx.send(ExecutionEvent::Started {
            task_id: context.task_id.clone(),
            command: command.to_string(),
        });

        let started = Instant::now();
        match self.runner.run(invocation, timeout).await {
            Ok(raw) => {
                let duration = started.elapsed();
                let success = raw.exit_code == Some(0) && !raw.timed_out;
                let result = ExecutionResult {
                    success,
                    stdout: raw.stdout,
                    stderr: raw.stderr,
                    exit_code: raw.exit_code,
                    mode,
                    duration,
                    error: raw.timed_out.then(|| {
                        format!("execution timed out after {}ms", timeout.as_millis())
                    }),
                };
                info!(
                    task_id = %context.task_id,
                    success,
                    exit_code = ?result.exit_code,
                    duration_ms = duration.as_millis() as u64,
                    "Command finished"
                );
                let _ = self.events_tx.send(ExecutionEvent::Completed {
                    task_id: context.task_id.clone(),
                    command: command.to_string(),
                    success,
                    exit_code: result.exit_code,
                    duration_ms: duration.as_millis() as u64,
                });
                Ok(result)
            }
            Err(err) => {
                warn!(task_id = %context.task_id, error = %err, "Command dispatch failed");
                let _ = self.events_tx.send(ExecutionEvent::Failed {
                    task_id: context.task_id.clone(),
                    command: command.to_string(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Run commands strictly in order, stopping after the first failure.
    ///
    /// Only the results produced so far are returned; remaining commands
    /// are never started.
    pub async fn execute_sequential(
        &self,
        commands: &[String],
        context: &ExecutionContext,
        options: &ExecuteOptions,
    ) -> Result<Vec<ExecutionResult>, RuntimeError> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let result = self.execute(command, context, options).await?;
            let stop = !result.success;
            results.push(result);
            if stop {
                debug!(
                    task_id = %context.task_id,
                    completed = results.len(),
                    remaining = commands.len() - results.len(),
                    "Sequential chain stopped at first failure"
                );
                break;
            }
        }
        Ok(results)
    }

    fn resolve_mode(&self, context: &ExecutionContext) -> ExecutionMode {
        if context.is_container_workspace {
            if context.container_id.is_some() {
                return ExecutionMode::Container;
            }
            warn!(
                task_id = %context.task_id,
                "Container workspace has no container id; degrading to local execution"
            );
        }
        ExecutionMode::Local
    }
}

fn build_invocation(
    command: &str,
    context: &ExecutionContext,
    options: &ExecuteOptions,
    mode: ExecutionMode,
) -> Invocation {
    match mode {
        ExecutionMode::Container => {
            // resolve_mode guarantees the id is present here.
            let container_id = context
                .container_id
                .clone()
                .unwrap_or_else(|| ContainerId::new(""));
            let mut exec = ExecCommand::new(container_id, command);
            if let Some(dir) = &context.working_dir {
                exec = exec.with_working_dir(dir);
            }
            for (key, value) in &options.env {
                exec = exec.with_env(key, value);
            }
            Invocation {
                program: context
                    .runtime_kind
                    .unwrap_or(RuntimeKind::Docker)
                    .binary()
                    .to_string(),
                args: exec.to_args(),
                working_dir: None,
                env: Vec::new(),
            }
        }
        ExecutionMode::Local => Invocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            working_dir: context.working_dir.clone(),
            env: options.env.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Runner that replays scripted outputs and records invocations.
    struct FakeRunner {
        outputs: Mutex<Vec<RawOutput>>,
        invocations: Mutex<Vec<Invocation>>,
        calls: AtomicUsize,
    }

    impl FakeRunner {
        fn scripted(outputs: Vec<RawOutput>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs),
                invocations: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn ok() -> RawOutput {
            RawOutput {
                exit_code: Some(0),
                ..Default::default()
            }
        }

        fn failed(code: i32) -> RawOutput {
            RawOutput {
                exit_code: Some(code),
                stderr: "boom".to_string(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(
            &self,
            invocation: Invocation,
            _timeout: Duration,
        ) -> Result<RawOutput, RuntimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.invocations.lock().await.push(invocation);
            let mut outputs = self.outputs.lock().await;
            if outputs.is_empty() {
                Ok(FakeRunner::ok())
            } else {
                Ok(outputs.remove(0))
            }
        }
    }

    fn local_context() -> ExecutionContext {
        ExecutionContext::local(TaskId::new("t1"), None)
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_failure() {
        let runner = FakeRunner::scripted(vec![
            FakeRunner::ok(),
            FakeRunner::failed(1),
            FakeRunner::ok(),
        ]);
        let router = ExecutionRouter::with_runner(runner.clone());

        let commands = vec!["ok".to_string(), "fail".to_string(), "ok2".to_string()];
        let results = router
            .execute_sequential(&commands, &local_context(), &ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_container_routing_uses_engine_exec() {
        let runner = FakeRunner::scripted(vec![FakeRunner::ok()]);
        let router = ExecutionRouter::with_runner(runner.clone());

        let context = ExecutionContext::container(
            TaskId::new("t1"),
            Some(ContainerId::new("c9")),
            RuntimeKind::Podman,
            Some(PathBuf::from("/workspace")),
        );
        let result = router
            .execute("cargo check", &context, &ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(result.mode, ExecutionMode::Container);
        let invocations = runner.invocations.lock().await;
        assert_eq!(invocations[0].program, "podman");
        assert_eq!(invocations[0].args[0], "exec");
        assert!(invocations[0].args.contains(&"c9".to_string()));
    }

    #[tokio::test]
    async fn test_missing_container_id_degrades_to_local() {
        let runner = FakeRunner::scripted(vec![FakeRunner::ok()]);
        let router = ExecutionRouter::with_runner(runner.clone());

        let context = ExecutionContext::container(
            TaskId::new("t1"),
            None,
            RuntimeKind::Docker,
            None,
        );
        let result = router
            .execute("true", &context, &ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(result.mode, ExecutionMode::Local);
        assert!(result.success);
        let invocations = runner.invocations.lock().await;
        assert_eq!(invocations[0].program, "sh");
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_event_per_execute() {
        let runner = FakeRunner::scripted(vec![FakeRunner::ok()]);
        let router = ExecutionRouter::with_runner(runner);
        let mut events = router.subscribe();

        router
            .execute("true", &local_context(), &ExecuteOptions::default())
            .await
            .unwrap();

        let first = events.try_recv().unwrap();
        assert!(matches!(first, ExecutionEvent::Started { .. }));
        let second = events.try_recv().unwrap();
        assert!(matches!(second, ExecutionEvent::Completed { success: true, .. }));
        assert!(events.try_recv().is_err());
    }

    /// Runner that injects a fixed latency per call.
    struct SlowRunner {
        delay: Duration,
    }

    #[async_trait]
    impl CommandRunner for SlowRunner {
        async fn run(
            &self,
            _invocation: Invocation,
            _timeout: Duration,
        ) -> Result<RawOutput, RuntimeError> {
            tokio::time::sleep(self.delay).await;
            Ok(FakeRunner::ok())
        }
    }

    #[tokio::test]
    async fn test_independent_executes_overlap() {
        let delay = Duration::from_millis(200);
        let router = Arc::new(ExecutionRouter::with_runner(Arc::new(SlowRunner { delay })));

        let started = Instant::now();
        let mut handles = Vec::new();
        for i in 0..10 {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                let context = ExecutionContext::local(TaskId::new(format!("t{i}")), None);
                router
                    .execute("true", &context, &ExecuteOptions::default())
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().success);
        }

        // Ten serialized calls would take 2s; overlapping calls finish
        // in roughly one delay.
        assert!(
            started.elapsed() < Duration::from_millis(1000),
            "independent executes must not serialize (took {:?})",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_timeout_reports_timeout_exit_code() {
        let runner = FakeRunner::scripted(vec![RawOutput {
            exit_code: Some(TIMEOUT_EXIT_CODE),
            timed_out: true,
            ..Default::default()
        }]);
        let router = ExecutionRouter::with_runner(runner);

        let result = router
            .execute("sleep 999", &local_context(), &ExecuteOptions::default())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(TIMEOUT_EXIT_CODE));
        assert!(result.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_process_runner_runs_local_command() {
        let router = ExecutionRouter::new();
        let result = router
            .execute("echo hello", &local_context(), &ExecuteOptions::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_process_runner_timeout_kills_child() {
        let router =
            ExecutionRouter::new().with_default_timeout(Duration::from_millis(200));
        let result = router
            .execute("sleep 10", &local_context(), &ExecuteOptions::default())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(TIMEOUT_EXIT_CODE));
    }
}
