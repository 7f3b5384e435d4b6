//! Configuration surface consumed by the orchestration layers.
//!
//! Values are validated here, before any process is started. A running
//! scheduler never crashes on configuration it already accepted.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Bounds applied to container resource limits.
const MIN_CPUS: f64 = 0.1;
const MAX_CPUS: f64 = 64.0;
const MIN_CPU_SHARES: u32 = 2;
const MAX_CPU_SHARES: u32 = 262_144;

/// Resource limits applied to container workspaces at creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU cores (0.1 - 64).
    pub cpus: Option<f64>,

    /// Memory limit: integer with optional k/m/g suffix, case-insensitive
    /// (e.g. "512m", "8G").
    pub memory: Option<String>,

    /// Relative CPU weight (2 - 262144).
    pub cpu_shares: Option<u32>,

    /// Maximum number of processes (>= 1).
    pub pids_limit: Option<u32>,
}

impl ResourceLimits {
    /// Validate all limits against their allowed ranges.
    ///
    /// Out-of-range values are rejected here, not at container creation.
    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(cpus) = self.cpus {
            if !cpus.is_finite() || !(MIN_CPUS..=MAX_CPUS).contains(&cpus) {
                return Err(CoreError::InvalidConfig(format!(
                    "cpus must be between {MIN_CPUS} and {MAX_CPUS}, got {cpus}"
                )));
            }
        }
        if let Some(memory) = &self.memory {
            if !is_valid_memory(memory) {
                return Err(CoreError::InvalidConfig(format!(
                    "memory must match an integer with optional k/m/g suffix, got '{memory}'"
                )));
            }
        }
        if let Some(shares) = self.cpu_shares {
            if !(MIN_CPU_SHARES..=MAX_CPU_SHARES).contains(&shares) {
                return Err(CoreError::InvalidConfig(format!(
                    "cpu_shares must be between {MIN_CPU_SHARES} and {MAX_CPU_SHARES}, got {shares}"
                )));
            }
        }
        if let Some(pids) = self.pids_limit {
            if pids < 1 {
                return Err(CoreError::InvalidConfig(format!(
                    "pids_limit must be at least 1, got {pids}"
                )));
            }
        }
        Ok(())
    }
}

/// Memory strings are one or more digits plus an optional single
/// k/m/g suffix in either case (`^\d+[kmgKMG]?$`).
fn is_valid_memory(value: &str) -> bool {
    let mut chars = value.chars().peekable();
    let mut digits = 0usize;
    while let Some(c) = chars.peek() {
        if c.is_ascii_digit() {
            digits += 1;
            chars.next();
        } else {
            break;
        }
    }
    if digits == 0 {
        return false;
    }
    match chars.next() {
        None => true,
        Some(suffix) => {
            chars.next().is_none() && matches!(suffix.to_ascii_lowercase(), 'k' | 'm' | 'g')
        }
    }
}

/// How a task's isolated execution environment is provided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStrategy {
    /// Run in the repository itself with no isolation.
    None,
    /// Linked git worktree per task.
    #[default]
    Worktree,
    /// Dedicated container per task.
    Container,
    /// Plain scratch directory per task.
    Directory,
}

/// Time-based capacity thresholds for admission control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// Hours of day (0-23) that count as day mode.
    pub day_hours: Vec<u32>,

    /// Hours of day (0-23) that count as night mode.
    pub night_hours: Vec<u32>,

    /// Pause when usage/budget reaches this fraction during day mode.
    pub day_capacity_threshold: f64,

    /// Pause when usage/budget reaches this fraction during night mode.
    pub night_capacity_threshold: f64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            day_hours: (8..20).collect(),
            night_hours: (20..24).chain(0..2).collect(),
            day_capacity_threshold: 0.7,
            night_capacity_threshold: 0.9,
        }
    }
}

/// Worktree pool sizing and pruning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeConfig {
    /// Directory under which task worktrees are created.
    pub base_dir: PathBuf,

    /// Maximum number of live worktrees.
    pub max_worktrees: usize,

    /// Days a workspace may idle before it becomes prunable.
    pub prune_stale_after_days: i64,

    /// Keep the workspace on failure for post-mortem debugging.
    pub preserve_on_failure: bool,

    /// Remove the workspace once its task succeeds.
    pub cleanup_on_complete: bool,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(".dockyard/worktrees"),
            max_worktrees: 8,
            prune_stale_after_days: 7,
            preserve_on_failure: true,
            cleanup_on_complete: true,
        }
    }
}

/// Options for the container lifecycle monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Managed containers are named `<prefix>-<task id>`.
    pub container_name_prefix: String,

    /// Engine event kinds to subscribe to.
    pub event_kinds: Vec<String>,

    /// How long to wait after a graceful stop before force-killing.
    #[serde(with = "duration_secs")]
    pub stop_grace_period: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            container_name_prefix: "dockyard".to_string(),
            event_kinds: vec![
                "create".to_string(),
                "start".to_string(),
                "stop".to_string(),
                "die".to_string(),
                "destroy".to_string(),
                "health_status".to_string(),
            ],
            stop_grace_period: Duration::from_secs(5),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pattern() {
        for ok in ["512", "512m", "512M", "1g", "8G", "64k", "64K"] {
            assert!(is_valid_memory(ok), "expected '{ok}' to validate");
        }
        for bad in ["", "m", "512mb", "1.5g", "g512", "512 m", "-512m"] {
            assert!(!is_valid_memory(bad), "expected '{bad}' to be rejected");
        }
    }

    #[test]
    fn test_resource_limits_ranges() {
        let ok = ResourceLimits {
            cpus: Some(2.0),
            memory: Some("4g".to_string()),
            cpu_shares: Some(1024),
            pids_limit: Some(256),
        };
        assert!(ok.validate().is_ok());

        let too_many_cpus = ResourceLimits {
            cpus: Some(128.0),
            ..Default::default()
        };
        assert!(too_many_cpus.validate().is_err());

        let tiny_cpus = ResourceLimits {
            cpus: Some(0.05),
            ..Default::default()
        };
        assert!(tiny_cpus.validate().is_err());

        let bad_shares = ResourceLimits {
            cpu_shares: Some(1),
            ..Default::default()
        };
        assert!(bad_shares.validate().is_err());

        let zero_pids = ResourceLimits {
            pids_limit: Some(0),
            ..Default::default()
        };
        assert!(zero_pids.validate().is_err());
    }

    #[test]
    fn test_empty_limits_validate() {
        assert!(ResourceLimits::default().validate().is_ok());
    }

    #[test]
    fn test_default_capacity_windows() {
        let config = CapacityConfig::default();
        assert!(config.day_hours.contains(&9));
        assert!(config.night_hours.contains(&23));
        assert!(config.night_hours.contains(&0));
        // 03:00 belongs to neither set: off-hours.
        assert!(!config.day_hours.contains(&3));
        assert!(!config.night_hours.contains(&3));
    }
}
