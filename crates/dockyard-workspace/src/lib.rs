//! Isolated execution environments for Dockyard tasks.
//!
//! Two strategies are implemented here:
//!
//! - [`pool`]: a capacity-enforced pool of linked git worktrees, one per
//!   task, with staleness-based pruning.
//! - [`container`]: dedicated named containers with validated resource
//!   limits applied at creation time.

pub mod container;
pub mod error;
pub mod pool;
pub mod worktree;

pub use container::ContainerProvisioner;
pub use error::WorkspaceError;
pub use pool::{ReleaseOutcome, WorktreePool};
pub use worktree::{GitCli, WorkspaceDescriptor, WorktreeGit};
