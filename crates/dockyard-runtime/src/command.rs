//! Typed builders for container engine CLI invocations.
//!
//! The wire contract with the engine is an ordered argument list; building
//! it from structured options keeps that contract explicit and testable
//! without spawning anything.

use dockyard_core::{ContainerId, ResourceLimits};
use std::path::PathBuf;

/// Arguments for the engine's event-stream subcommand.
///
/// The stream emits one JSON object per line (`--format '{{json .}}'`).
#[derive(Debug, Clone, Default)]
pub struct EventsCommand {
    kinds: Vec<String>,
    name_prefix: Option<String>,
    since: Option<String>,
}

impl EventsCommand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one engine event kind (e.g. "die").
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kinds.push(kind.into());
        self
    }

    /// Subscribe to several event kinds at once.
    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds.extend(kinds.into_iter().map(Into::into));
        self
    }

    /// Only report containers whose name starts with the prefix.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Only report events after the given engine timestamp.
    pub fn with_since(mut self, since: impl Into<String>) -> Self {
        self.since = Some(since.into());
        self
    }

    /// Build the ordered argument list.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "events".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            "--filter".to_string(),
            "type=container".to_string(),
        ];
        for kind in &self.kinds {
            args.push("--filter".to_string());
            args.push(format!("event={kind}"));
        }
        if let Some(prefix) = &self.name_prefix {
            args.push("--filter".to_string());
            args.push(format!("name={prefix}"));
        }
        if let Some(since) = &self.since {
            args.push("--since".to_string());
            args.push(since.clone());
        }
        args
    }
}

/// Arguments for running a shell command inside a container.
#[derive(Debug, Clone)]
pub struct ExecCommand {
    container_id: ContainerId,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    command: String,
}

impl ExecCommand {
    pub fn new(container_id: ContainerId, command: impl Into<String>) -> Self {
        Self {
            container_id,
            working_dir: None,
            env: Vec::new(),
            command: command.into(),
        }
    }

    /// Set the working directory inside the container.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Build the ordered argument list.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(dir) = &self.working_dir {
            args.push("--workdir".to_string());
            args.push(dir.to_string_lossy().to_string());
        }
        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.container_id.as_str().to_string());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(self.command.clone());
        args
    }
}

/// Arguments for creating a long-lived, named task container.
#[derive(Debug, Clone)]
pub struct CreateContainerCommand {
    name: String,
    image: String,
    limits: ResourceLimits,
    workspace_mount: Option<(PathBuf, PathBuf)>,
}

impl CreateContainerCommand {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            limits: ResourceLimits::default(),
            workspace_mount: None,
        }
    }

    /// Apply validated resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Bind-mount a host directory into the container.
    pub fn with_workspace_mount(
        mut self,
        host: impl Into<PathBuf>,
        container: impl Into<PathBuf>,
    ) -> Self {
        self.workspace_mount = Some((host.into(), container.into()));
        self
    }

    /// Build the ordered argument list.
    ///
    /// The container idles until commands are exec'd into it.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];
        if let Some(cpus) = self.limits.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory) = &self.limits.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        if let Some(shares) = self.limits.cpu_shares {
            args.push("--cpu-shares".to_string());
            args.push(shares.to_string());
        }
        if let Some(pids) = self.limits.pids_limit {
            args.push("--pids-limit".to_string());
            args.push(pids.to_string());
        }
        if let Some((host, container)) = &self.workspace_mount {
            args.push("--volume".to_string());
            args.push(format!(
                "{}:{}",
                host.to_string_lossy(),
                container.to_string_lossy()
            ));
        }
        args.push(self.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());
        args
    }
}
