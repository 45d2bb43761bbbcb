//! Summarize Command

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use tandem_common::CollaborativeExecutionResult;
use tandem_orchestrator::{AggregatedResult, ResultAggregator};

use crate::output::{print_aggregated, OutputFormat};

#[derive(Args)]
pub struct SummarizeArgs {
    /// Saved execution-result.json from an earlier run
    pub result: PathBuf,
}

pub fn load_result(path: &Path) -> Result<CollaborativeExecutionResult> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

pub fn summarize(path: &Path) -> Result<AggregatedResult> {
    let result = load_result(path)?;
    Ok(ResultAggregator::new().aggregate(&result))
}

/// Returns whether the summarized run succeeded
pub fn execute(args: SummarizeArgs, format: OutputFormat) -> Result<bool> {
    let aggregated = summarize(&args.result)?;
    print_aggregated(&aggregated, format);
    Ok(aggregated.success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tandem_common::{DeviceExecutionResult, ExecutionError, StepResult};

    fn saved_run() -> CollaborativeExecutionResult {
        let mut host = DeviceExecutionResult::new("host-1", "host");
        host.record("click #start".to_string(), StepResult::passed(40));
        let mut guest = DeviceExecutionResult::new("guest-1", "guest");
        guest.record(
            "visible #lobby".to_string(),
            StepResult::failed("Timeout 5000ms exceeded", 5000),
        );

        let now = Utc::now();
        CollaborativeExecutionResult {
            success: false,
            start_time: now,
            end_time: now,
            total_duration_ms: 5040,
            devices: vec![host, guest],
            sync_points: Vec::new(),
            shared_data: Default::default(),
            errors: vec![ExecutionError::step("guest", 0, "Timeout 5000ms exceeded")],
            timeline: Vec::new(),
        }
    }

    #[test]
    fn test_summarize_saved_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execution-result.json");
        std::fs::write(&path, serde_json::to_string(&saved_run()).unwrap()).unwrap();

        let aggregated = summarize(&path).unwrap();
        assert!(!aggregated.success);
        assert_eq!(aggregated.stats.total_steps, 2);
        assert_eq!(aggregated.stats.failed_steps, 1);
        assert_eq!(aggregated.failure_patterns.len(), 1);
        assert_eq!(aggregated.device_comparison[0].alias, "host");
    }

    #[test]
    fn test_missing_file_names_the_path() {
        let err = summarize(Path::new("/nonexistent/execution-result.json")).unwrap_err();
        assert!(err.to_string().contains("execution-result.json"));
    }
}
