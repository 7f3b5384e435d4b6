//! Dockyard Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Container engines
//! - Subprocess handling
//! - Runtime specifics
//!
//! All types here represent the core business domain of Dockyard:
//! tasks, their lifecycle metadata, workspace descriptors, the validated
//! configuration surface, and the typed domain events the orchestration
//! layers emit.

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use config::{
    CapacityConfig, MonitorConfig, ResourceLimits, WorkspaceStrategy, WorktreeConfig,
};
pub use error::CoreError;
pub use event::{
    ContainerEvent, ContainerEventData, ContainerEventKind, ExecutionEvent, OrchestratorEvent,
};
pub use ids::{ContainerId, TaskId};
pub use status::{TaskStatus, WorkspaceStatus};
pub use task::Task;
