//! Run Command

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info, warn};

use tandem_common::{
    CollaborativeExecutionResult, CollaborativeScript, DeviceStatus, ExecutionError, OrchestratorState,
    ProgressSnapshot, TestStep,
};
use tandem_orchestrator::{
    AggregatedResult, DefaultSessionFactory, Orchestrator, OrchestratorEvents, ResultAggregator,
};

use crate::config::TandemConfig;
use crate::output::{print_aggregated, print_warning, OutputFormat};

pub const EXECUTION_RESULT_FILE: &str = "execution-result.json";
pub const AGGREGATED_RESULT_FILE: &str = "aggregated-result.json";

#[derive(Args)]
pub struct RunArgs {
    /// Collaborative script (.yaml, .yml or .json)
    pub script: PathBuf,

    /// Stop a device block at its first failing step
    #[arg(long)]
    pub stop_on_failure: bool,

    /// Stop walking the flow once a block reports a failure
    #[arg(long)]
    pub abort_on_failure: bool,

    /// Show browser windows
    #[arg(long)]
    pub headed: bool,

    /// Results directory (overrides `output_dir` from the config file)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Progress bar fed by orchestrator callbacks
struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    fn new(visible: bool) -> Self {
        let bar = if visible { ProgressBar::new(0) } else { ProgressBar::hidden() };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl OrchestratorEvents for ProgressReporter {
    fn on_device_status_change(&self, alias: &str, status: DeviceStatus) {
        debug!("{} is now {}", alias, status);
    }

    fn on_step_start(&self, alias: &str, _index: usize, step: &TestStep) {
        self.bar.set_message(format!("{}: {}", alias, step.instruction()));
    }

    fn on_sync_wait(&self, sync_id: &str, devices: &[String]) {
        self.bar
            .set_message(format!("sync {} waiting on {}", sync_id, devices.join(", ")));
    }

    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_length(snapshot.total_steps as u64);
        self.bar.set_position(snapshot.completed_steps as u64);
    }

    fn on_error(&self, alias: &str, error: &ExecutionError) {
        let location = if error.step_index >= 0 {
            format!("{} step {}", alias, error.step_index)
        } else {
            alias.to_string()
        };
        self.bar
            .println(format!("{} {}: {}", "✗".red(), location.bold(), error.message));
    }
}

/// Everything a finished run leaves behind
pub struct RunOutcome {
    pub result: CollaborativeExecutionResult,
    pub aggregated: AggregatedResult,
    pub run_dir: PathBuf,
    /// Ended by `stop()` rather than by reaching the end of the flow
    pub stopped: bool,
}

/// `<output>/<script-stem>-<YYYYmmdd-HHMMSS>`
fn run_dir(output: &Path, script: &Path) -> PathBuf {
    let stem = script
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("run");
    output.join(format!("{}-{}", stem, chrono::Local::now().format("%Y%m%d-%H%M%S")))
}

/// Keep screenshots with the run that took them unless a directory is configured
fn place_screenshots(config: &mut TandemConfig, run_dir: &Path) {
    if config.browser.screenshot_dir.is_none() {
        config.browser.screenshot_dir = Some(run_dir.join("screenshots"));
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))
}

/// Run one script to completion and persist its results
pub async fn run_script(
    mut config: TandemConfig,
    script_path: &Path,
    show_progress: bool,
) -> Result<RunOutcome> {
    let script = CollaborativeScript::from_file(script_path)
        .with_context(|| format!("loading {}", script_path.display()))?;

    let run_dir = run_dir(&config.output_dir, script_path);
    std::fs::create_dir_all(&run_dir)?;
    place_screenshots(&mut config, &run_dir);

    info!(
        "Running {} ({} devices, {} steps)",
        script.name.as_deref().unwrap_or("script"),
        script.devices.len(),
        script.total_steps()
    );

    let reporter = Arc::new(ProgressReporter::new(show_progress));
    let orchestrator = Orchestrator::builder()
        .config(config.orchestrator.clone())
        .factory(DefaultSessionFactory::new(config.browser.clone()))
        .events(reporter.clone())
        .build();

    let interrupt = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current step");
                orchestrator.stop();
            }
        })
    };

    let outcome = orchestrator.execute(&script).await;
    interrupt.abort();
    reporter.finish();
    let result = outcome?;
    let stopped = orchestrator.state() == OrchestratorState::Idle;

    let aggregated = ResultAggregator::new().aggregate(&result);
    write_json(&run_dir.join(EXECUTION_RESULT_FILE), &result)?;
    write_json(&run_dir.join(AGGREGATED_RESULT_FILE), &aggregated)?;
    info!("Results written to {}", run_dir.display());

    Ok(RunOutcome {
        result,
        aggregated,
        run_dir,
        stopped,
    })
}

/// Returns whether the run succeeded
pub async fn execute(args: RunArgs, mut config: TandemConfig, format: OutputFormat) -> Result<bool> {
    config.orchestrator.stop_on_failure |= args.stop_on_failure;
    config.orchestrator.abort_on_failure |= args.abort_on_failure;
    if args.headed {
        config.browser.headless = false;
    }
    if let Some(output) = args.output {
        config.output_dir = output;
    }

    let show_progress = matches!(format, OutputFormat::Table);
    let outcome = run_script(config, &args.script, show_progress).await?;

    print_aggregated(&outcome.aggregated, format);
    if matches!(format, OutputFormat::Table) {
        if outcome.stopped {
            print_warning("Run was stopped before the flow finished");
        }
        println!("Results: {}", outcome.run_dir.display());
    }

    Ok(outcome.result.success)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> TandemConfig {
        TandemConfig {
            output_dir: dir.join("results"),
            ..TandemConfig::default()
        }
    }

    #[test]
    fn test_run_dir_uses_script_stem() {
        let dir = run_dir(Path::new("out"), Path::new("flows/checkout.yaml"));
        let name = dir.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("checkout-"));
        assert_eq!(dir.parent(), Some(Path::new("out")));
    }

    #[test]
    fn test_default_config_keeps_screenshots_per_run() {
        let mut config = TandemConfig::default();
        place_screenshots(&mut config, Path::new("out/checkout-1"));
        assert_eq!(
            config.browser.screenshot_dir,
            Some(PathBuf::from("out/checkout-1/screenshots"))
        );

        let mut pinned = TandemConfig::default();
        pinned.browser.screenshot_dir = Some(PathBuf::from("shots"));
        place_screenshots(&mut pinned, Path::new("out/checkout-2"));
        assert_eq!(pinned.browser.screenshot_dir, Some(PathBuf::from("shots")));
    }

    #[tokio::test]
    async fn test_empty_flow_writes_both_result_files() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("empty.yaml");
        std::fs::write(&script, "devices: {}\nflow: []\n").unwrap();

        let outcome = run_script(config_in(dir.path()), &script, false).await.unwrap();
        assert!(outcome.result.success);
        assert!(!outcome.stopped);
        assert!(outcome.run_dir.join(EXECUTION_RESULT_FILE).exists());
        assert!(outcome.run_dir.join(AGGREGATED_RESULT_FILE).exists());
        assert_eq!(outcome.aggregated.stats.total_steps, 0);
    }

    #[tokio::test]
    async fn test_unsupported_device_kind_fails_before_execution() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("phone.yaml");
        std::fs::write(
            &script,
            "devices:\n  phone:\n    kind: mobile\n    platform: android\nflow: []\n",
        )
        .unwrap();

        let mut config = config_in(dir.path());
        config.orchestrator.connect_retry.max_attempts = 1;
        let err = run_script(config, &script, false).await.err().unwrap();
        assert!(err.to_string().contains("not yet implemented"));
    }
}
