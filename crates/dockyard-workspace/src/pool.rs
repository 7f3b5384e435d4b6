//! Capacity-enforced pool of task worktrees.
//!
//! The live descriptor map is the one shared resource that needs mutual
//! exclusion: acquire, release, and prune all serialize on the pool
//! mutex, so the count check and the creation of a new worktree form a
//! single critical section.

use crate::error::WorkspaceError;
use crate::worktree::{WorkspaceDescriptor, WorktreeGit};
use chrono::{DateTime, Duration, Utc};
use dockyard_core::{TaskId, WorkspaceStatus, WorktreeConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How a task's execution ended, for release bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
}

/// Pool of linked git worktrees, at most one per task.
pub struct WorktreePool {
    git: Arc<dyn WorktreeGit>,
    repo_root: PathBuf,
    config: WorktreeConfig,
    descriptors: Mutex<HashMap<TaskId, WorkspaceDescriptor>>,
}

impl WorktreePool {
    /// Create a pool over the repository at `repo_root`.
    pub fn new(git: Arc<dyn WorktreeGit>, repo_root: PathBuf, config: WorktreeConfig) -> Self {
        Self {
            git,
            repo_root,
            config,
            descriptors: Mutex::new(HashMap::new()),
        }
    }

    /// Grant a worktree to `task_id`.
    ///
    /// Fails fast with [`WorkspaceError::PoolExhausted`] when the pool is
    /// at `max_worktrees`; it never silently exceeds the limit.
    pub async fn acquire(&self, task_id: &TaskId) -> Result<WorkspaceDescriptor, WorkspaceError> {
        let mut descriptors = self.descriptors.lock().await;

        if let Some(existing) = descriptors.get_mut(task_id) {
            if existing.status.is_held() {
                return Err(WorkspaceError::AlreadyAcquired(task_id.clone()));
            }
            // Idle worktree for the same task: reactivate instead of
            // creating a second checkout.
            existing.status = WorkspaceStatus::Active;
            existing.touch();
            debug!(task_id = %task_id, path = %existing.path.display(), "Reusing idle worktree");
            return Ok(existing.clone());
        }

        if descriptors.len() >= self.config.max_worktrees {
            return Err(WorkspaceError::PoolExhausted {
                task_id: task_id.clone(),
                max: self.config.max_worktrees,
            });
        }

        let branch = format!("dockyard/{task_id}");
        let path = self.config.base_dir.join(task_id.as_str());

        self.git
            .add_worktree(&self.repo_root, &path, &branch)
            .await?;
        let head_commit = self.git.head_commit(&path).await?;

        let now = Utc::now();
        let descriptor = WorkspaceDescriptor {
            path,
            branch,
            head_commit,
            status: WorkspaceStatus::Active,
            task_id: task_id.clone(),
            is_main: false,
            created_at: now,
            last_used_at: now,
        };
        info!(task_id = %task_id, path = %descriptor.path.display(), "Worktree acquired");
        descriptors.insert(task_id.clone(), descriptor.clone());
        Ok(descriptor)
    }

    /// Release a task's worktree.
    ///
    /// On success `cleanup_on_complete` governs removal; on failure
    /// `preserve_on_failure` keeps the checkout for post-mortem debugging.
    pub async fn release(
        &self,
        task_id: &TaskId,
        outcome: ReleaseOutcome,
    ) -> Result<(), WorkspaceError> {
        let mut descriptors = self.descriptors.lock().await;
        let descriptor = descriptors
            .get_mut(task_id)
            .ok_or_else(|| WorkspaceError::NotFound(task_id.clone()))?;

        let remove = match outcome {
            ReleaseOutcome::Success => self.config.cleanup_on_complete,
            ReleaseOutcome::Failure => !self.config.preserve_on_failure,
        };

        if remove {
            let descriptor = descriptors
                .remove(task_id)
                .ok_or_else(|| WorkspaceError::NotFound(task_id.clone()))?;
            self.remove_checkout(&descriptor).await;
            info!(task_id = %task_id, "Worktree released and removed");
        } else {
            descriptor.status = WorkspaceStatus::Stale;
            descriptor.touch();
            info!(task_id = %task_id, ?outcome, "Worktree released and kept");
        }
        Ok(())
    }

    /// Mark a workspace as held by an external process.
    pub async fn lock(&self, task_id: &TaskId) -> Result<(), WorkspaceError> {
        let mut descriptors = self.descriptors.lock().await;
        let descriptor = descriptors
            .get_mut(task_id)
            .ok_or_else(|| WorkspaceError::NotFound(task_id.clone()))?;
        descriptor.status = WorkspaceStatus::Locked;
        Ok(())
    }

    /// Release an external hold; the workspace becomes idle.
    pub async fn unlock(&self, task_id: &TaskId) -> Result<(), WorkspaceError> {
        let mut descriptors = self.descriptors.lock().await;
        let descriptor = descriptors
            .get_mut(task_id)
            .ok_or_else(|| WorkspaceError::NotFound(task_id.clone()))?;
        if descriptor.status == WorkspaceStatus::Locked {
            descriptor.status = WorkspaceStatus::Stale;
            descriptor.touch();
        }
        Ok(())
    }

    /// Remove worktrees idle strictly longer than the staleness window.
    ///
    /// Active and locked descriptors are always skipped, regardless of
    /// age. Returns the removed descriptors.
    pub async fn prune(&self) -> Vec<WorkspaceDescriptor> {
        self.prune_at(Utc::now()).await
    }

    /// Prune with an explicit clock (exposed for deterministic tests).
    pub async fn prune_at(&self, now: DateTime<Utc>) -> Vec<WorkspaceDescriptor> {
        let window = Duration::days(self.config.prune_stale_after_days);
        let mut descriptors = self.descriptors.lock().await;

        let eligible: Vec<TaskId> = descriptors
            .iter()
            .filter(|(_, d)| !d.status.is_held() && now - d.last_used_at > window)
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = Vec::with_capacity(eligible.len());
        for task_id in eligible {
            if let Some(mut descriptor) = descriptors.remove(&task_id) {
                descriptor.status = WorkspaceStatus::Prunable;
                self.remove_checkout(&descriptor).await;
                info!(task_id = %task_id, "Pruned stale worktree");
                removed.push(descriptor);
            }
        }
        removed
    }

    /// Number of live descriptors (all non-removed states).
    pub async fn len(&self) -> usize {
        self.descriptors.lock().await.len()
    }

    /// True when the pool holds no descriptors.
    pub async fn is_empty(&self) -> bool {
        self.descriptors.lock().await.is_empty()
    }

    /// Snapshot of a task's descriptor.
    pub async fn get(&self, task_id: &TaskId) -> Option<WorkspaceDescriptor> {
        self.descriptors.lock().await.get(task_id).cloned()
    }

    async fn remove_checkout(&self, descriptor: &WorkspaceDescriptor) {
        if let Err(err) = self
            .git
            .remove_worktree(&self.repo_root, &descriptor.path)
            .await
        {
            warn!(task_id = %descriptor.task_id, error = %err, "Failed to remove worktree checkout");
        }
        if let Err(err) = self
            .git
            .delete_branch(&self.repo_root, &descriptor.branch)
            .await
        {
            debug!(task_id = %descriptor.task_id, error = %err, "Failed to delete task branch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory git that only counts operations.
    #[derive(Default)]
    struct FakeGit {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl WorktreeGit for FakeGit {
        async fn add_worktree(
            &self,
            _repo: &Path,
            _path: &Path,
            _branch: &str,
        ) -> Result<(), WorkspaceError> {
            self.added.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove_worktree(
            &self,
            _repo: &Path,
            _path: &Path,
        ) -> Result<(), WorkspaceError> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn head_commit(&self, _path: &Path) -> Result<String, WorkspaceError> {
            Ok("abc123".to_string())
        }

        async fn delete_branch(&self, _repo: &Path, _branch: &str) -> Result<(), WorkspaceError> {
            Ok(())
        }
    }

    fn pool(max: usize, prune_days: i64) -> (Arc<FakeGit>, WorktreePool) {
        let git = Arc::new(FakeGit::default());
        let config = WorktreeConfig {
            max_worktrees: max,
            prune_stale_after_days: prune_days,
            ..Default::default()
        };
        let pool = WorktreePool::new(git.clone(), PathBuf::from("/repo"), config);
        (git, pool)
    }

    #[tokio::test]
    async fn test_acquire_beyond_limit_fails_fast() {
        let (_, pool) = pool(2, 7);

        pool.acquire(&TaskId::new("t1")).await.unwrap();
        pool.acquire(&TaskId::new("t2")).await.unwrap();

        let err = pool.acquire(&TaskId::new("t3")).await.unwrap_err();
        match err {
            WorkspaceError::PoolExhausted { task_id, max } => {
                assert_eq!(task_id.as_str(), "t3");
                assert_eq!(max, 2);
            }
            other => panic!("expected PoolExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_release_frees_capacity() {
        let (_, pool) = pool(1, 7);

        pool.acquire(&TaskId::new("t1")).await.unwrap();
        assert!(pool.acquire(&TaskId::new("t2")).await.is_err());

        pool.release(&TaskId::new("t1"), ReleaseOutcome::Success)
            .await
            .unwrap();
        pool.acquire(&TaskId::new("t2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_acquire_rejected() {
        let (_, pool) = pool(4, 7);
        pool.acquire(&TaskId::new("t1")).await.unwrap();
        let err = pool.acquire(&TaskId::new("t1")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::AlreadyAcquired(_)));
    }

    #[tokio::test]
    async fn test_preserve_on_failure_keeps_checkout() {
        let (git, pool) = pool(2, 7);

        pool.acquire(&TaskId::new("t1")).await.unwrap();
        pool.release(&TaskId::new("t1"), ReleaseOutcome::Failure)
            .await
            .unwrap();

        // Default config preserves on failure; the checkout survives as
        // a stale descriptor.
        assert_eq!(git.removed.load(Ordering::SeqCst), 0);
        let descriptor = pool.get(&TaskId::new("t1")).await.unwrap();
        assert_eq!(descriptor.status, WorkspaceStatus::Stale);
    }

    #[tokio::test]
    async fn test_stale_worktree_is_reused() {
        let (git, pool) = pool(2, 7);

        pool.acquire(&TaskId::new("t1")).await.unwrap();
        pool.release(&TaskId::new("t1"), ReleaseOutcome::Failure)
            .await
            .unwrap();

        let descriptor = pool.acquire(&TaskId::new("t1")).await.unwrap();
        assert_eq!(descriptor.status, WorkspaceStatus::Active);
        assert_eq!(git.added.load(Ordering::SeqCst), 1, "no second checkout");
    }

    #[tokio::test]
    async fn test_prune_boundary_is_exclusive() {
        let (_, pool) = pool(4, 7);

        pool.acquire(&TaskId::new("t1")).await.unwrap();
        pool.release(&TaskId::new("t1"), ReleaseOutcome::Failure)
            .await
            .unwrap();

        let released_at = pool.get(&TaskId::new("t1")).await.unwrap().last_used_at;

        // Exactly at the boundary: kept.
        let removed = pool.prune_at(released_at + Duration::days(7)).await;
        assert!(removed.is_empty());
        assert_eq!(pool.len().await, 1);

        // One second past: pruned.
        let removed = pool
            .prune_at(released_at + Duration::days(7) + Duration::seconds(1))
            .await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].task_id.as_str(), "t1");
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_locked_descriptor_never_pruned() {
        let (_, pool) = pool(4, 7);

        pool.acquire(&TaskId::new("t1")).await.unwrap();
        pool.lock(&TaskId::new("t1")).await.unwrap();

        let far_future = Utc::now() + Duration::days(365);
        let removed = pool.prune_at(far_future).await;
        assert!(removed.is_empty());

        pool.unlock(&TaskId::new("t1")).await.unwrap();
        // After unlock the descriptor is idle again; a fresh stamp means
        // it still is not pruned until the window elapses.
        let removed = pool.prune_at(Utc::now()).await;
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn test_active_descriptor_never_pruned() {
        let (_, pool) = pool(4, 0);
        pool.acquire(&TaskId::new("t1")).await.unwrap();

        let far_future = Utc::now() + Duration::days(365);
        let removed = pool.prune_at(far_future).await;
        assert!(removed.is_empty());
    }
}
