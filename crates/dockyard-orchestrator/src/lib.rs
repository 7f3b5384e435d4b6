//! Orchestration layer for Dockyard.
//!
//! This crate decides *whether* and *where* task work runs:
//!
//! - [`capacity`] is pure admission control over time windows and a
//!   daily budget.
//! - [`store`] persists tasks and their trash/restore/archive
//!   lifecycle.
//! - [`bus`] fans orchestrator events out to subscribers.
//! - [`dispatcher`] glues admission, workspace provisioning, routed
//!   execution, and bookkeeping together.

pub mod bus;
pub mod capacity;
pub mod dispatcher;
pub mod error;
pub mod store;

pub use bus::EventBus;
pub use capacity::{
    decide, CapacityDecision, CapacitySnapshot, DailyUsage, TimeWindow, TimeWindowMode,
    UsageProvider,
};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
pub use error::{OrchestratorError, StoreError};
pub use store::{MemoryTaskStore, TaskPatch, TaskStore};
