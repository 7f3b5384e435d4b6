//! Container engine integration for Dockyard.
//!
//! This crate owns every subprocess boundary with the container engine:
//!
//! - [`detector`] probes for available engines and caches the results.
//! - [`command`] maps structured options to engine CLI argument lists.
//! - [`monitor`] streams the engine's event feed and re-emits typed
//!   lifecycle events.
//! - [`router`] runs agent-issued commands either inside a task's
//!   container or as a local subprocess, uniformly.
//! - [`process`] provides the shared graceful-then-forceful termination
//!   helper.

pub mod command;
pub mod detector;
pub mod error;
pub mod monitor;
pub mod process;
pub mod router;

pub use command::{CreateContainerCommand, EventsCommand, ExecCommand};
pub use detector::{
    CompatibilityReport, EngineProbe, RuntimeDetector, RuntimeInfo, RuntimeKind,
    VersionInfo, VersionRequirement,
};
pub use error::RuntimeError;
pub use monitor::ContainerLifecycleMonitor;
pub use router::{
    CommandRunner, ExecuteOptions, ExecutionContext, ExecutionMode, ExecutionResult,
    ExecutionRouter, Invocation, ProcessRunner, RawOutput,
};
