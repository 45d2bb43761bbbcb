//! Cross-device statistics, device comparison and failure correlation
//!
//! [`ResultAggregator::aggregate`] is a pure function of one
//! [`CollaborativeExecutionResult`]; running it twice yields identical output.

mod correlation;
mod timeline;

pub use correlation::{correlate, infer_cause, normalize_error, FailedStepRef, FailureCause, FailurePattern};
pub use timeline::{build_segments, SegmentLane, TimelineSegment};

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use tandem_common::{CollaborativeExecutionResult, DeviceExecutionResult};

/// Number of failure patterns listed in the summary
const SUMMARY_PATTERNS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedStats {
    pub total_steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    /// Percentage of steps that passed, 0 when nothing ran
    pub success_rate: f64,
    pub average_step_duration_ms: f64,
    pub total_duration_ms: u64,
    pub sync_overhead_ms: u64,
    /// Sync overhead relative to wall-clock duration, in percent
    pub sync_overhead_percent: f64,
    pub device_with_most_failures: Option<String>,
    pub slowest_device: Option<String>,
    pub fastest_device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceComparison {
    pub alias: String,
    pub device_id: String,
    pub total_steps: usize,
    pub passed_steps: usize,
    pub failed_steps: usize,
    pub success_rate: f64,
    pub total_duration_ms: u64,
    pub average_step_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub success: bool,
    pub stats: AggregatedStats,
    pub device_comparison: Vec<DeviceComparison>,
    pub failure_patterns: Vec<FailurePattern>,
    pub timeline: Vec<TimelineSegment>,
    pub summary: String,
}

/// Stateless post-processing of execution results
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn new() -> Self {
        Self
    }

    pub fn aggregate(&self, result: &CollaborativeExecutionResult) -> AggregatedResult {
        let stats = stats(result);
        let device_comparison = result.devices.iter().map(compare_device).collect();
        let failure_patterns = correlate(result);
        let timeline = build_segments(result);
        let summary = summarize(result, &stats, &failure_patterns);

        AggregatedResult {
            success: result.success,
            stats,
            device_comparison,
            failure_patterns,
            timeline,
            summary,
        }
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part * 100.0 / whole
    } else {
        0.0
    }
}

fn stats(result: &CollaborativeExecutionResult) -> AggregatedStats {
    let total_steps = result.total_steps();
    let successful_steps: usize = result.devices.iter().map(|d| d.passed_count()).sum();
    let step_time: u64 = result.devices.iter().map(|d| d.total_duration_ms).sum();
    let sync_overhead_ms: u64 = result.sync_points.iter().map(|s| s.duration_ms).sum();

    AggregatedStats {
        total_steps,
        successful_steps,
        failed_steps: total_steps - successful_steps,
        success_rate: percent(successful_steps as f64, total_steps as f64),
        average_step_duration_ms: if total_steps > 0 {
            step_time as f64 / total_steps as f64
        } else {
            0.0
        },
        total_duration_ms: result.total_duration_ms,
        sync_overhead_ms,
        sync_overhead_percent: percent(sync_overhead_ms as f64, result.total_duration_ms as f64),
        device_with_most_failures: first_max_by(&result.devices, |d| d.failed_count())
            .filter(|d| d.failed_count() > 0)
            .map(|d| d.alias.clone()),
        slowest_device: first_max_by(&result.devices, |d| d.total_duration_ms).map(|d| d.alias.clone()),
        fastest_device: first_max_by(&result.devices, |d| std::cmp::Reverse(d.total_duration_ms))
            .map(|d| d.alias.clone()),
    }
}

/// Maximum by key; ties go to the earliest device
fn first_max_by<K: Ord>(
    devices: &[DeviceExecutionResult],
    key: impl Fn(&DeviceExecutionResult) -> K,
) -> Option<&DeviceExecutionResult> {
    let mut best: Option<(&DeviceExecutionResult, K)> = None;
    for device in devices {
        let k = key(device);
        let better = match &best {
            Some((_, current)) => k > *current,
            None => true,
        };
        if better {
            best = Some((device, k));
        }
    }
    best.map(|(device, _)| device)
}

fn compare_device(device: &DeviceExecutionResult) -> DeviceComparison {
    let total_steps = device.steps.len();
    let passed_steps = device.passed_count();
    DeviceComparison {
        alias: device.alias.clone(),
        device_id: device.device_id.clone(),
        total_steps,
        passed_steps,
        failed_steps: total_steps - passed_steps,
        success_rate: percent(passed_steps as f64, total_steps as f64),
        total_duration_ms: device.total_duration_ms,
        average_step_duration_ms: if total_steps > 0 {
            device.total_duration_ms as f64 / total_steps as f64
        } else {
            0.0
        },
    }
}

fn summarize(result: &CollaborativeExecutionResult, stats: &AggregatedStats, patterns: &[FailurePattern]) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{} in {}ms: {}/{} steps passed across {} device(s)",
        if result.success { "PASSED" } else { "FAILED" },
        stats.total_duration_ms,
        stats.successful_steps,
        stats.total_steps,
        result.devices.len()
    );
    let _ = writeln!(
        out,
        "Sync overhead: {}ms ({:.1}%) over {} sync point(s)",
        stats.sync_overhead_ms,
        stats.sync_overhead_percent,
        result.sync_points.len()
    );
    if let Some(slowest) = stats.slowest_device.as_deref().and_then(|alias| result.device(alias)) {
        let _ = writeln!(out, "Slowest device: {} ({}ms)", slowest.alias, slowest.total_duration_ms);
    }

    if !patterns.is_empty() {
        let _ = writeln!(out, "Top failure patterns:");
        for (rank, pattern) in patterns.iter().take(SUMMARY_PATTERNS).enumerate() {
            let cause = pattern
                .likely_cause
                .map(|c| format!(" (likely cause: {})", c))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "  {}. [{}x on {}] {}{}",
                rank + 1,
                pattern.occurrences,
                pattern.affected_devices.join(", "),
                pattern.pattern,
                cause
            );
        }
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tandem_common::{ExecutionError, StepResult, SyncPointTiming};

    fn device(alias: &str, steps: &[(bool, u64, Option<&str>)]) -> DeviceExecutionResult {
        let mut device = DeviceExecutionResult::new(format!("{}-id", alias), alias);
        for (i, (success, duration, error)) in steps.iter().enumerate() {
            let result = if *success {
                StepResult::passed(*duration)
            } else {
                StepResult::failed(error.unwrap_or("boom"), *duration)
            };
            device.record(format!("step {}", i), result);
        }
        device
    }

    fn result(devices: Vec<DeviceExecutionResult>) -> CollaborativeExecutionResult {
        let start = Utc::now();
        let errors: Vec<ExecutionError> = devices
            .iter()
            .flat_map(|d| {
                d.steps
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| !s.result.success)
                    .map(|(i, s)| ExecutionError::step(&d.alias, i, s.result.error.clone().unwrap_or_default()))
                    .collect::<Vec<_>>()
            })
            .collect();
        CollaborativeExecutionResult {
            success: errors.is_empty(),
            start_time: start,
            end_time: start + Duration::milliseconds(1000),
            total_duration_ms: 1000,
            devices,
            sync_points: vec![SyncPointTiming {
                id: "handoff".into(),
                start_time: start + Duration::milliseconds(400),
                end_time: start + Duration::milliseconds(500),
                duration_ms: 100,
                waiting_devices: vec!["a".into(), "b".into()],
                timeout_ms: Some(5000),
                timed_out: false,
            }],
            shared_data: Default::default(),
            errors,
            timeline: Vec::new(),
        }
    }

    #[test]
    fn test_stats_and_device_rankings() {
        let result = result(vec![
            device("a", &[(true, 100, None), (false, 50, None), (true, 50, None)]),
            device("b", &[(true, 300, None), (false, 10, None), (false, 10, None)]),
            device("c", &[(true, 20, None)]),
        ]);
        let stats = ResultAggregator::new().aggregate(&result).stats;

        assert_eq!(stats.total_steps, 7);
        assert_eq!(stats.successful_steps, 4);
        assert_eq!(stats.failed_steps, 3);
        assert!((stats.success_rate - 400.0 / 7.0).abs() < 1e-9);
        assert_eq!(stats.sync_overhead_ms, 100);
        assert_eq!(stats.sync_overhead_percent, 10.0);
        assert_eq!(stats.device_with_most_failures.as_deref(), Some("b"));
        assert_eq!(stats.slowest_device.as_deref(), Some("b"));
        assert_eq!(stats.fastest_device.as_deref(), Some("c"));
    }

    #[test]
    fn test_ties_go_to_first_device() {
        let result = result(vec![
            device("a", &[(true, 10, None)]),
            device("b", &[(true, 10, None)]),
        ]);
        let stats = ResultAggregator::new().aggregate(&result).stats;
        assert_eq!(stats.slowest_device.as_deref(), Some("a"));
        assert_eq!(stats.fastest_device.as_deref(), Some("a"));
        assert_eq!(stats.device_with_most_failures, None);
    }

    #[test]
    fn test_failure_patterns_collapse_across_devices() {
        let result = result(vec![
            device("a", &[(false, 5, Some("Element not found: #submit-123"))]),
            device("b", &[(true, 5, None), (false, 5, Some("Element not found: #submit-456"))]),
            device("c", &[(false, 5, Some("Assertion failed"))]),
        ]);
        let aggregated = ResultAggregator::new().aggregate(&result);

        assert_eq!(aggregated.failure_patterns.len(), 2);
        let top = &aggregated.failure_patterns[0];
        assert_eq!(top.occurrences, 2);
        assert_eq!(top.affected_devices, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(top.likely_cause, Some(FailureCause::ElementNotFound));
        assert_eq!(
            top.steps[1],
            FailedStepRef {
                device: "b".into(),
                step_index: 1
            }
        );
        assert!(aggregated.summary.contains("Top failure patterns"));
        assert!(aggregated.summary.starts_with("FAILED"));
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let result = result(vec![
            device("a", &[(true, 10, None), (false, 3, Some("Timeout 3000ms exceeded"))]),
            device("b", &[(true, 7, None)]),
        ]);
        let aggregator = ResultAggregator::new();
        assert_eq!(aggregator.aggregate(&result), aggregator.aggregate(&result));
    }

    #[test]
    fn test_timeline_segments_without_events_are_back_to_back() {
        let result = result(vec![device("a", &[(true, 10, None), (true, 20, None)])]);
        let segments = build_segments(&result);

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].start_offset_ms, 0);
        assert_eq!(segments[1].start_offset_ms, 10);
        assert_eq!(segments[1].end_offset_ms, 30);
        assert_eq!(segments[2].lane, SegmentLane::Sync("handoff".into()));
        assert_eq!(segments[2].start_offset_ms, 400);
    }

    #[test]
    fn test_empty_result() {
        let mut empty = result(Vec::new());
        empty.sync_points.clear();
        let aggregated = ResultAggregator::new().aggregate(&empty);
        assert_eq!(aggregated.stats.total_steps, 0);
        assert_eq!(aggregated.stats.success_rate, 0.0);
        assert_eq!(aggregated.stats.slowest_device, None);
        assert!(aggregated.failure_patterns.is_empty());
        assert!(aggregated.summary.starts_with("PASSED"));
    }
}
