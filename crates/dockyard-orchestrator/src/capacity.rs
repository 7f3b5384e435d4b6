//! Pure capacity-aware admission control.
//!
//! [`decide`] is a pure function of the clock, today's usage, and the
//! configured windows. It never performs I/O and never panics, even on
//! degenerate configuration: malformed hour sets collapse to off-hours
//! (which pauses), and non-finite arithmetic collapses to zero usage.

use crate::error::OrchestratorError;
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use dockyard_core::CapacityConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which configured window the current hour falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindowMode {
    Day,
    Night,
    /// Outside both windows; execution is always paused.
    OffHours,
}

/// The window the decision was made in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub mode: TimeWindowMode,
    /// Hour of day (0-23) the decision was evaluated at.
    pub hour: u32,
}

/// Usage-versus-budget numbers backing a decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    /// Today's spend as a percentage of the daily budget (0 when the
    /// budget is unusable).
    pub current_percentage: f64,

    /// Pause threshold for the active window, as a percentage.
    pub threshold_percentage: f64,

    /// Tasks currently executing.
    pub active_task_count: usize,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacityDecision {
    pub time_window: TimeWindow,
    pub should_pause: bool,
    pub capacity: CapacitySnapshot,
}

/// Aggregated spend for the current day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    /// Total cost accrued today, in budget units.
    pub total_cost: f64,
}

/// Seam over whatever system tracks spend, so admission control can be
/// tested without one.
#[async_trait]
pub trait UsageProvider: Send + Sync {
    /// Report today's accrued usage.
    async fn daily_usage(&self) -> Result<DailyUsage, OrchestratorError>;
}

/// Decide whether new work may start right now.
///
/// Off-hours always pauses regardless of usage. Within a window, work
/// pauses once usage reaches the window's threshold (a usage exactly at
/// the threshold pauses).
pub fn decide(
    now: DateTime<Utc>,
    usage: &DailyUsage,
    active_task_count: usize,
    daily_budget: f64,
    config: &CapacityConfig,
) -> CapacityDecision {
    let hour = now.hour();
    let mode = resolve_mode(hour, config);

    let current_percentage = usage_percentage(usage.total_cost, daily_budget);
    let threshold_fraction = match mode {
        TimeWindowMode::Day => config.day_capacity_threshold,
        TimeWindowMode::Night => config.night_capacity_threshold,
        TimeWindowMode::OffHours => 0.0,
    };
    let threshold_percentage = clamp_fraction(threshold_fraction) * 100.0;

    let should_pause = match mode {
        TimeWindowMode::OffHours => true,
        _ => current_percentage >= threshold_percentage,
    };

    debug!(
        hour,
        ?mode,
        current = current_percentage,
        threshold = threshold_percentage,
        active_task_count,
        should_pause,
        "Capacity decision"
    );

    CapacityDecision {
        time_window: TimeWindow { mode, hour },
        should_pause,
        capacity: CapacitySnapshot {
            current_percentage,
            threshold_percentage,
            active_task_count,
        },
    }
}

/// Day wins when an hour is listed in both windows.
fn resolve_mode(hour: u32, config: &CapacityConfig) -> TimeWindowMode {
    if config.day_hours.iter().any(|&h| h == hour) {
        TimeWindowMode::Day
    } else if config.night_hours.iter().any(|&h| h == hour) {
        TimeWindowMode::Night
    } else {
        TimeWindowMode::OffHours
    }
}

/// Usage as a percentage of budget; anything unusable (zero, negative,
/// or non-finite budget or cost) reads as zero rather than poisoning
/// the comparison.
fn usage_percentage(cost: f64, budget: f64) -> f64 {
    if !cost.is_finite() || !budget.is_finite() || budget <= 0.0 {
        return 0.0;
    }
    let fraction = cost.max(0.0) / budget;
    if fraction.is_finite() {
        fraction * 100.0
    } else {
        0.0
    }
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, 30, 0).unwrap()
    }

    fn usage(cost: f64) -> DailyUsage {
        DailyUsage { total_cost: cost }
    }

    #[test]
    fn test_off_hours_always_pauses() {
        let config = CapacityConfig::default();
        // 03:00 is in neither default window.
        let decision = decide(at_hour(3), &usage(0.0), 0, 100.0, &config);
        assert_eq!(decision.time_window.mode, TimeWindowMode::OffHours);
        assert!(decision.should_pause);
    }

    #[test]
    fn test_day_window_under_threshold_admits() {
        let config = CapacityConfig::default();
        let decision = decide(at_hour(10), &usage(50.0), 2, 100.0, &config);
        assert_eq!(decision.time_window.mode, TimeWindowMode::Day);
        assert!(!decision.should_pause);
        assert_eq!(decision.capacity.current_percentage, 50.0);
        assert_eq!(decision.capacity.threshold_percentage, 70.0);
        assert_eq!(decision.capacity.active_task_count, 2);
    }

    #[test]
    fn test_usage_at_threshold_pauses() {
        let config = CapacityConfig::default();
        let decision = decide(at_hour(10), &usage(70.0), 0, 100.0, &config);
        assert!(decision.should_pause, "threshold boundary must pause");
    }

    #[test]
    fn test_night_threshold_is_higher() {
        let config = CapacityConfig::default();
        // 80% of budget: over the 70% day threshold, under night's 90%.
        let day = decide(at_hour(10), &usage(80.0), 0, 100.0, &config);
        let night = decide(at_hour(22), &usage(80.0), 0, 100.0, &config);
        assert!(day.should_pause);
        assert_eq!(night.time_window.mode, TimeWindowMode::Night);
        assert!(!night.should_pause);
    }

    #[test]
    fn test_unusable_budget_reads_as_zero_usage() {
        let config = CapacityConfig::default();
        for budget in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let decision = decide(at_hour(10), &usage(50.0), 0, budget, &config);
            assert_eq!(decision.capacity.current_percentage, 0.0);
            assert!(!decision.should_pause);
        }
    }

    #[test]
    fn test_non_finite_cost_reads_as_zero() {
        let config = CapacityConfig::default();
        let decision = decide(at_hour(10), &usage(f64::NAN), 0, 100.0, &config);
        assert_eq!(decision.capacity.current_percentage, 0.0);
    }

    #[test]
    fn test_thresholds_clamped_to_unit_range() {
        let config = CapacityConfig {
            day_capacity_threshold: 7.5,
            night_capacity_threshold: -2.0,
            ..Default::default()
        };
        let day = decide(at_hour(10), &usage(0.0), 0, 100.0, &config);
        assert_eq!(day.capacity.threshold_percentage, 100.0);

        let night = decide(at_hour(22), &usage(0.0), 0, 100.0, &config);
        assert_eq!(night.capacity.threshold_percentage, 0.0);
        // Zero threshold pauses even with zero usage.
        assert!(night.should_pause);
    }

    #[test]
    fn test_empty_windows_collapse_to_off_hours() {
        let config = CapacityConfig {
            day_hours: Vec::new(),
            night_hours: Vec::new(),
            ..Default::default()
        };
        for hour in 0..24 {
            let decision = decide(at_hour(hour), &usage(0.0), 0, 100.0, &config);
            assert_eq!(decision.time_window.mode, TimeWindowMode::OffHours);
            assert!(decision.should_pause);
        }
    }

    #[test]
    fn test_day_wins_overlapping_windows() {
        let config = CapacityConfig {
            day_hours: vec![12],
            night_hours: vec![12],
            ..Default::default()
        };
        let decision = decide(at_hour(12), &usage(0.0), 0, 100.0, &config);
        assert_eq!(decision.time_window.mode, TimeWindowMode::Day);
    }
}
