//! Core types for tandem

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Key/value map used for shared data, injected context and step exports
pub type DataMap = HashMap<String, serde_json::Value>;

/// Device id used for errors raised by the orchestrator itself
pub const ORCHESTRATOR_DEVICE_ID: &str = "orchestrator";

// ============================================================================
// Devices
// ============================================================================

/// Viewport dimensions for browser-like devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { width: 1280, height: 720 }
    }
}

/// Settings for a browser tab driven through Playwright
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserSettings {
    /// Location opened right after connecting
    #[serde(default)]
    pub start_url: Option<String>,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub has_touch: bool,
    #[serde(default)]
    pub is_mobile: bool,
    #[serde(default)]
    pub device_scale_factor: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MobilePlatform {
    Android,
    Ios,
}

/// Settings for a touch-based emulator or handset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileSettings {
    pub platform: MobilePlatform,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub start_url: Option<String>,
}

/// Settings for a device reached through a remote automation endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSettings {
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: DataMap,
}

/// Device kind together with its kind-specific settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceKind {
    Browser(BrowserSettings),
    Mobile(MobileSettings),
    Remote(RemoteSettings),
}

impl DeviceKind {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::Browser(_) => "browser",
            DeviceKind::Mobile(_) => "mobile",
            DeviceKind::Remote(_) => "remote",
        }
    }
}

/// Script-side device declaration; the alias is the map key and the id is
/// synthesized when the script runs
pub type DeviceSpec = DeviceKind;

/// Full configuration of one device. Immutable once a session is built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub alias: String,
    #[serde(flatten)]
    pub kind: DeviceKind,
}

impl DeviceConfig {
    /// Build a config for `alias`, synthesizing a fresh id
    pub fn new(alias: impl Into<String>, kind: DeviceKind) -> Self {
        let alias = alias.into();
        Self {
            id: format!("{}-{}", alias, Uuid::new_v4()),
            alias,
            kind,
        }
    }
}

/// Lifecycle state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Ready,
    Busy,
    Error,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl DeviceStatus {
    /// Whether a session in this status has no work in flight
    pub fn is_settled(&self) -> bool {
        !matches!(self, DeviceStatus::Busy | DeviceStatus::Connecting)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Disconnected => write!(f, "disconnected"),
            DeviceStatus::Connecting => write!(f, "connecting"),
            DeviceStatus::Ready => write!(f, "ready"),
            DeviceStatus::Busy => write!(f, "busy"),
            DeviceStatus::Error => write!(f, "error"),
        }
    }
}

/// Read-only snapshot of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub alias: String,
    pub kind: String,
    pub status: DeviceStatus,
    pub last_error: Option<String>,
    pub last_screenshot: Option<String>,
}

impl DeviceInfo {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            id: config.id.clone(),
            alias: config.alias.clone(),
            kind: config.kind.label().to_string(),
            status: DeviceStatus::Disconnected,
            last_error: None,
            last_screenshot: None,
        }
    }
}

// ============================================================================
// Steps
// ============================================================================

fn default_wait_timeout() -> u64 {
    5000
}

/// The single instruction carried by a test step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Free-form action instruction, e.g. `click #submit`
    Action { instruction: String },

    /// Assertion about the device's current state
    Assert { assertion: String },

    /// Wait until a condition holds
    Wait {
        condition: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },

    /// Navigate to a target location
    Navigate { url: String },
}

/// One instruction sent to a device session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    #[serde(flatten)]
    pub kind: StepKind,

    /// Export key -> extraction query, evaluated after the step succeeds
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub export: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TestStep {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            export: BTreeMap::new(),
            description: None,
        }
    }

    pub fn action(instruction: impl Into<String>) -> Self {
        Self::new(StepKind::Action {
            instruction: instruction.into(),
        })
    }

    pub fn assert(assertion: impl Into<String>) -> Self {
        Self::new(StepKind::Assert {
            assertion: assertion.into(),
        })
    }

    pub fn wait(condition: impl Into<String>, timeout_ms: u64) -> Self {
        Self::new(StepKind::Wait {
            condition: condition.into(),
            timeout_ms,
        })
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self::new(StepKind::Navigate { url: url.into() })
    }

    pub fn with_export(mut self, key: impl Into<String>, query: impl Into<String>) -> Self {
        self.export.insert(key.into(), query.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// One-line label recorded next to the step's result
    pub fn instruction(&self) -> String {
        match &self.kind {
            StepKind::Action { instruction } => instruction.clone(),
            StepKind::Assert { assertion } => format!("assert {}", assertion),
            StepKind::Wait { condition, .. } => format!("wait {}", condition),
            StepKind::Navigate { url } => format!("navigate {}", url),
        }
    }
}

/// Outcome of one test step. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub screenshot: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub exported: Option<DataMap>,
}

impl StepResult {
    pub fn passed(duration_ms: u64) -> Self {
        Self {
            success: true,
            error: None,
            screenshot: None,
            duration_ms,
            exported: None,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            screenshot: None,
            duration_ms,
            exported: None,
        }
    }

    pub fn with_screenshot(mut self, screenshot: Option<String>) -> Self {
        self.screenshot = screenshot;
        self
    }

    pub fn with_exported(mut self, exported: DataMap) -> Self {
        self.exported = if exported.is_empty() { None } else { Some(exported) };
        self
    }
}

// ============================================================================
// Script
// ============================================================================

/// Steps executed sequentially on one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBlock {
    pub device: String,
    #[serde(default)]
    pub steps: Vec<TestStep>,
}

/// Named rendezvous point in the flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub id: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Device blocks run concurrently; the flow advances once all of them finish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBlock {
    pub blocks: Vec<DeviceBlock>,
}

/// One unit of the script's flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowStep {
    Device(DeviceBlock),
    Sync(SyncPoint),
    Parallel(ParallelBlock),
}

impl FlowStep {
    /// Number of test steps this flow step will execute
    pub fn step_count(&self) -> usize {
        match self {
            FlowStep::Device(block) => block.steps.len(),
            FlowStep::Sync(_) => 0,
            FlowStep::Parallel(parallel) => parallel.blocks.iter().map(|b| b.steps.len()).sum(),
        }
    }
}

/// Declarative input: devices, initial shared data and the ordered flow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollaborativeScript {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Initial shared key/value seed
    #[serde(default)]
    pub variables: DataMap,

    /// alias -> device configuration, in declaration order
    #[serde(default)]
    pub devices: IndexMap<String, DeviceSpec>,

    #[serde(default)]
    pub flow: Vec<FlowStep>,
}

// ============================================================================
// Execution results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    StepStart,
    StepEnd,
    SyncWait,
    SyncRelease,
    Error,
}

/// Append-only log entry for progress reporting and visualization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: TimelineEventType,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub sync_point_id: Option<String>,
    pub message: String,
}

impl TimelineEvent {
    pub fn device(event_type: TimelineEventType, alias: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            device_id: Some(alias.to_string()),
            sync_point_id: None,
            message: message.into(),
        }
    }

    pub fn sync(event_type: TimelineEventType, sync_id: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            device_id: None,
            sync_point_id: Some(sync_id.to_string()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedStep {
    pub instruction: String,
    pub result: StepResult,
}

/// Per-device accumulation of executed steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceExecutionResult {
    pub device_id: String,
    pub alias: String,
    pub steps: Vec<ExecutedStep>,
    pub total_duration_ms: u64,
}

impl DeviceExecutionResult {
    pub fn new(device_id: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            alias: alias.into(),
            steps: Vec::new(),
            total_duration_ms: 0,
        }
    }

    /// Append a step, returning its index in this device's history
    pub fn record(&mut self, instruction: String, result: StepResult) -> usize {
        self.total_duration_ms += result.duration_ms;
        self.steps.push(ExecutedStep { instruction, result });
        self.steps.len() - 1
    }

    pub fn passed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.result.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.steps.len() - self.passed_count()
    }
}

/// Timing record for one executed sync point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPointTiming {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub waiting_devices: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub device_id: String,
    /// Index into the device's step history, -1 for orchestration errors
    pub step_index: i64,
    pub message: String,
}

impl ExecutionError {
    pub fn step(alias: &str, step_index: usize, message: impl Into<String>) -> Self {
        Self {
            device_id: alias.to_string(),
            step_index: step_index as i64,
            message: message.into(),
        }
    }

    pub fn orchestration(message: impl Into<String>) -> Self {
        Self {
            device_id: ORCHESTRATOR_DEVICE_ID.to_string(),
            step_index: -1,
            message: message.into(),
        }
    }
}

/// Terminal artifact of one `execute` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborativeExecutionResult {
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub devices: Vec<DeviceExecutionResult>,
    pub sync_points: Vec<SyncPointTiming>,
    pub shared_data: DataMap,
    pub errors: Vec<ExecutionError>,
    #[serde(default)]
    pub timeline: Vec<TimelineEvent>,
}

impl CollaborativeExecutionResult {
    pub fn total_steps(&self) -> usize {
        self.devices.iter().map(|d| d.steps.len()).sum()
    }

    pub fn device(&self, alias: &str) -> Option<&DeviceExecutionResult> {
        self.devices.iter().find(|d| d.alias == alias)
    }
}

// ============================================================================
// Orchestrator state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorState::Idle => write!(f, "idle"),
            OrchestratorState::Initializing => write!(f, "initializing"),
            OrchestratorState::Running => write!(f, "running"),
            OrchestratorState::Paused => write!(f, "paused"),
            OrchestratorState::Completed => write!(f, "completed"),
            OrchestratorState::Failed => write!(f, "failed"),
        }
    }
}

/// Progress snapshot handed to progress callbacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub state: OrchestratorState,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub current_device: Option<String>,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total_steps == 0 {
            100.0
        } else {
            self.completed_steps as f64 * 100.0 / self.total_steps as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_synthesizes_unique_ids() {
        let kind = DeviceKind::Browser(BrowserSettings::default());
        let a = DeviceConfig::new("host", kind.clone());
        let b = DeviceConfig::new("host", kind);
        assert!(a.id.starts_with("host-"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_step_roundtrip_keeps_export_map() {
        let json = r##"{"type":"action","instruction":"click #go","export":{"order":"#order-id"}}"##;
        let step: TestStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.instruction(), "click #go");
        assert_eq!(step.export.get("order").map(String::as_str), Some("#order-id"));
    }

    #[test]
    fn test_wait_timeout_defaults() {
        let step: TestStep = serde_json::from_str(r#"{"type":"wait","condition":"text=Done"}"#).unwrap();
        assert_eq!(step.kind, StepKind::Wait { condition: "text=Done".into(), timeout_ms: 5000 });
    }

    #[test]
    fn test_device_result_record_accumulates_duration() {
        let mut device = DeviceExecutionResult::new("id", "host");
        assert_eq!(device.record("a".into(), StepResult::passed(10)), 0);
        assert_eq!(device.record("b".into(), StepResult::failed("boom", 5)), 1);
        assert_eq!(device.total_duration_ms, 15);
        assert_eq!(device.passed_count(), 1);
        assert_eq!(device.failed_count(), 1);
    }

    #[test]
    fn test_progress_percent() {
        let snapshot = ProgressSnapshot {
            state: OrchestratorState::Running,
            completed_steps: 1,
            total_steps: 4,
            current_device: None,
        };
        assert_eq!(snapshot.percent(), 25.0);
    }

    #[test]
    fn test_orchestration_error_shape() {
        let err = ExecutionError::orchestration("boom");
        assert_eq!(err.device_id, ORCHESTRATOR_DEVICE_ID);
        assert_eq!(err.step_index, -1);
    }
}
