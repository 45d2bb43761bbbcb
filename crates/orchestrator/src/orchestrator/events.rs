//! Callback surface for progress and reporting observers
//!
//! All callbacks are notifications only. They run synchronously on the
//! orchestrator's task, so implementations should return quickly.

use serde_json::Value;

use tandem_common::{DeviceStatus, ExecutionError, ProgressSnapshot, StepResult, TestStep, TimelineEvent};

pub trait OrchestratorEvents: Send + Sync {
    fn on_device_status_change(&self, _alias: &str, _status: DeviceStatus) {}

    fn on_step_start(&self, _alias: &str, _index: usize, _step: &TestStep) {}

    fn on_step_complete(&self, _alias: &str, _index: usize, _result: &StepResult) {}

    fn on_sync_wait(&self, _sync_id: &str, _devices: &[String]) {}

    fn on_sync_release(&self, _sync_id: &str, _devices: &[String]) {}

    /// A key was written to shared data, by a step export or by the embedding caller
    fn on_data_export(&self, _key: &str, _value: &Value, _source: &str) {}

    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}

    fn on_error(&self, _alias: &str, _error: &ExecutionError) {}

    fn on_timeline_event(&self, _event: &TimelineEvent) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl OrchestratorEvents for NoopEvents {}
