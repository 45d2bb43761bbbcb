//! Collaborative script interpreter
//!
//! The [`Orchestrator`] owns one session per declared device, walks the
//! script's flow in order and collects a [`CollaborativeExecutionResult`].
//! Device blocks run sequentially on their session, parallel blocks fan out
//! on the calling task and join before the flow advances, and sync points
//! wait until every session has settled.
//!
//! Pause and stop are cooperative: both are observed before each flow step
//! and between the steps of a block, never in the middle of a step.

mod barrier;
mod events;
mod recorder;
mod shared;

pub use events::{NoopEvents, OrchestratorEvents};
pub use shared::SharedData;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tandem_common::{
    CollaborativeExecutionResult, CollaborativeScript, DataMap, DeviceBlock, DeviceConfig, DeviceInfo, Error,
    ExecutionError, FlowStep, OrchestratorState, ParallelBlock, ProgressSnapshot, Result, SyncPoint,
    SyncPointTiming, TimelineEvent, TimelineEventType, ORCHESTRATOR_DEVICE_ID,
};

use crate::retry::{with_retry, RetryConfig};
use crate::session::{DefaultSessionFactory, DeviceSession, SessionFactory};
use recorder::RunRecorder;

/// Orchestrator behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Skip the remaining steps of a device block once one of them fails
    pub stop_on_failure: bool,

    /// Stop walking the flow after any flow step reported a failure
    pub abort_on_failure: bool,

    /// Retry policy for connecting sessions during initialization
    pub connect_retry: RetryConfig,

    /// Barrier timeout for sync points that do not declare one
    pub default_sync_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stop_on_failure: false,
            abort_on_failure: false,
            connect_retry: RetryConfig::default(),
            default_sync_timeout_ms: 30_000,
        }
    }
}

/// How a flow step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowOutcome {
    Completed,
    Failed,
    Stopped,
}

impl FlowOutcome {
    fn combine(self, other: FlowOutcome) -> FlowOutcome {
        use FlowOutcome::*;
        match (self, other) {
            (Stopped, _) | (_, Stopped) => Stopped,
            (Failed, _) | (_, Failed) => Failed,
            _ => Completed,
        }
    }
}

/// State of one `execute` call
struct Run {
    recorder: RunRecorder,
    total_steps: usize,
}

struct Inner {
    config: OrchestratorConfig,
    factory: Arc<dyn SessionFactory>,
    events: Arc<dyn OrchestratorEvents>,
    state: watch::Sender<OrchestratorState>,
    shared: SharedData,
    /// Values written through `set_shared_data`, carried into the next run
    seeds: Mutex<DataMap>,
    sessions: RwLock<IndexMap<String, Arc<dyn DeviceSession>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    progress: Mutex<ProgressSnapshot>,
    running: tokio::sync::Mutex<()>,
}

/// Handle to a multi-device orchestrator. Cloning is cheap; all clones
/// control the same run.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    factory: Option<Arc<dyn SessionFactory>>,
    events: Option<Arc<dyn OrchestratorEvents>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Session factory used to build one session per declared device
    pub fn factory<F: SessionFactory + 'static>(mut self, factory: F) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn events<E: OrchestratorEvents + 'static>(mut self, events: Arc<E>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Orchestrator {
        let (state, _) = watch::channel(OrchestratorState::Idle);
        Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                factory: self
                    .factory
                    .unwrap_or_else(|| Arc::new(DefaultSessionFactory::default())),
                events: self.events.unwrap_or_else(|| Arc::new(NoopEvents)),
                state,
                shared: SharedData::new(),
                seeds: Mutex::new(DataMap::new()),
                sessions: RwLock::new(IndexMap::new()),
                listeners: Mutex::new(Vec::new()),
                progress: Mutex::new(ProgressSnapshot {
                    state: OrchestratorState::Idle,
                    completed_steps: 0,
                    total_steps: 0,
                    current_device: None,
                }),
                running: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: OrchestratorConfig::default(),
            factory: None,
            events: None,
        }
    }

    pub fn new(config: OrchestratorConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn state(&self) -> OrchestratorState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every lifecycle change
    pub fn subscribe_state(&self) -> watch::Receiver<OrchestratorState> {
        self.inner.state.subscribe()
    }

    /// Latest progress snapshot
    pub fn progress(&self) -> ProgressSnapshot {
        self.inner.progress.lock().clone()
    }

    /// Suspend the run at the next boundary. Only a running orchestrator pauses.
    pub fn pause(&self) {
        let paused = self.inner.state.send_if_modified(|state| {
            if *state == OrchestratorState::Running {
                *state = OrchestratorState::Paused;
                true
            } else {
                false
            }
        });
        if paused {
            info!("Orchestrator paused");
            self.emit_progress();
        }
    }

    /// Resume a paused run; a no-op otherwise
    pub fn resume(&self) {
        let resumed = self.inner.state.send_if_modified(|state| {
            if *state == OrchestratorState::Paused {
                *state = OrchestratorState::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            info!("Orchestrator resumed");
            self.emit_progress();
        }
    }

    /// Force the state to idle. A running flow stops at its next boundary.
    pub fn stop(&self) {
        let stopped = self.inner.state.send_if_modified(|state| {
            if *state == OrchestratorState::Idle {
                false
            } else {
                *state = OrchestratorState::Idle;
                true
            }
        });
        if stopped {
            info!("Orchestrator stopped");
        }
    }

    /// Snapshot of all shared data
    pub fn shared_data(&self) -> DataMap {
        self.inner.shared.snapshot()
    }

    pub fn shared_value(&self, key: &str) -> Option<Value> {
        self.inner.shared.get(key)
    }

    /// Write a shared value from outside the script, notifying observers
    /// exactly as an in-script export would
    pub fn set_shared_data(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.inner.seeds.lock().insert(key.clone(), value.clone());
        self.inner.shared.set(key.clone(), value.clone());
        self.inner.events.on_data_export(&key, &value, ORCHESTRATOR_DEVICE_ID);
    }

    /// Current info for a registered session
    pub fn device_info(&self, alias: &str) -> Option<DeviceInfo> {
        self.inner.sessions.read().get(alias).map(|s| s.info())
    }

    /// Build and connect one session per config. Any failure aborts
    /// initialization; sessions connected so far stay registered so the
    /// caller can disconnect them.
    pub async fn initialize_sessions(&self, configs: &[DeviceConfig]) -> Result<()> {
        self.inner.sessions.write().clear();

        for config in configs {
            let session = self.inner.factory.create(config)?;
            self.listen(&session);
            self.inner
                .sessions
                .write()
                .insert(config.alias.clone(), session.clone());

            info!("Connecting device {} ({})", config.alias, config.kind.label());
            let label = format!("connect {}", config.alias);
            let target: &dyn DeviceSession = session.as_ref();
            with_retry(&self.inner.config.connect_retry, &label, move || target.connect()).await?;
        }

        Ok(())
    }

    /// Run a collaborative script to completion, stop or failure.
    ///
    /// Returns `Err` only when the script is invalid or a device cannot be
    /// initialized. Every other failure is recorded in the result.
    pub async fn execute(&self, script: &CollaborativeScript) -> Result<CollaborativeExecutionResult> {
        let _running = self
            .inner
            .running
            .try_lock()
            .map_err(|_| Error::Internal("an execution is already in progress".to_string()))?;

        let start_time = Utc::now();
        let clock = Instant::now();

        if let Err(e) = script.validate() {
            self.set_state(OrchestratorState::Failed);
            return Err(e);
        }

        self.set_state(OrchestratorState::Initializing);
        // exports from earlier runs do not carry over, caller seeds do
        let mut initial = std::mem::take(&mut *self.inner.seeds.lock());
        initial.extend(script.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.inner.shared.replace(initial);

        let configs = script.device_configs();
        let run = Run {
            recorder: RunRecorder::new(&configs),
            total_steps: script.total_steps(),
        };
        *self.inner.progress.lock() = ProgressSnapshot {
            state: OrchestratorState::Initializing,
            completed_steps: 0,
            total_steps: run.total_steps,
            current_device: None,
        };
        self.emit_progress();

        info!(
            "Executing script {} ({} devices, {} steps)",
            script.name.as_deref().unwrap_or("<unnamed>"),
            configs.len(),
            run.total_steps
        );

        if let Err(e) = self.initialize_sessions(&configs).await {
            error!("Initialization failed: {}", e);
            self.cleanup().await;
            self.set_state(OrchestratorState::Failed);
            return Err(e);
        }

        self.inner.state.send_if_modified(|state| {
            if *state == OrchestratorState::Initializing {
                *state = OrchestratorState::Running;
                true
            } else {
                false
            }
        });
        self.emit_progress();

        if let Err(e) = self.walk(script, &run).await {
            error!("Orchestration error: {}", e);
            let err = ExecutionError::orchestration(e.to_string());
            self.report_error(&run, ORCHESTRATOR_DEVICE_ID, err);
        }

        self.cleanup().await;

        let log = run.recorder.into_log();
        let success = log.errors.is_empty();
        let stopped = self.state() == OrchestratorState::Idle;
        if !stopped {
            self.set_state(if success {
                OrchestratorState::Completed
            } else {
                OrchestratorState::Failed
            });
        }

        let end_time = Utc::now();
        let result = CollaborativeExecutionResult {
            success,
            start_time,
            end_time,
            total_duration_ms: clock.elapsed().as_millis() as u64,
            devices: log.devices.into_values().collect(),
            sync_points: log.sync_points,
            shared_data: self.inner.shared.snapshot(),
            errors: log.errors,
            timeline: log.timeline,
        };

        *self.inner.progress.lock() = ProgressSnapshot {
            state: self.state(),
            completed_steps: log.completed_steps,
            total_steps: run.total_steps,
            current_device: None,
        };
        self.inner.events.on_progress(&self.progress());

        info!(
            "Script finished: {} ({} steps, {} errors, {}ms{})",
            if success { "passed" } else { "failed" },
            result.total_steps(),
            result.errors.len(),
            result.total_duration_ms,
            if stopped { ", stopped" } else { "" }
        );

        Ok(result)
    }

    async fn walk(&self, script: &CollaborativeScript, run: &Run) -> Result<()> {
        for (index, flow_step) in script.flow.iter().enumerate() {
            if !self.checkpoint().await {
                info!("Stop requested, skipping remaining flow from step {}", index);
                break;
            }

            let outcome = match flow_step {
                FlowStep::Device(block) => self.run_block(block, run).await?,
                FlowStep::Sync(point) => self.sync_point(point, run).await,
                FlowStep::Parallel(parallel) => self.run_parallel(parallel, run).await?,
            };

            match outcome {
                FlowOutcome::Stopped => {
                    info!("Stop requested during flow step {}", index);
                    break;
                }
                FlowOutcome::Failed if self.inner.config.abort_on_failure => {
                    warn!("Flow step {} failed, aborting remaining flow", index);
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Wait out a pause. Returns `false` once the run has been stopped.
    async fn checkpoint(&self) -> bool {
        let mut rx = self.inner.state.subscribe();
        let running = match rx.wait_for(|state| *state != OrchestratorState::Paused).await {
            Ok(state) => *state == OrchestratorState::Running,
            Err(_) => false,
        };
        running
    }

    async fn run_block(&self, block: &DeviceBlock, run: &Run) -> Result<FlowOutcome> {
        let alias = block.device.as_str();
        let session = self.session(alias)?;
        let mut outcome = FlowOutcome::Completed;

        debug!("Running block of {} steps on {}", block.steps.len(), alias);

        for step in &block.steps {
            if !self.checkpoint().await {
                return Ok(FlowOutcome::Stopped);
            }

            session.inject_data(&self.inner.shared.snapshot());

            let instruction = step.instruction();
            let next = run.recorder.next_index(alias);
            self.inner.events.on_step_start(alias, next, step);
            self.record_event(
                run,
                TimelineEvent::device(TimelineEventType::StepStart, alias, instruction.clone()),
            );

            let result = session.execute_step(step).await;
            let (index, completed) = run.recorder.record_step(alias, instruction, result.clone())?;

            if let Some(exported) = &result.exported {
                for (key, value) in exported {
                    self.inner.shared.set(key.clone(), value.clone());
                    self.inner.events.on_data_export(key, value, alias);
                }
            }

            let message = match &result.error {
                None => format!("step {} passed in {}ms", index, result.duration_ms),
                Some(err) => format!("step {} failed: {}", index, err),
            };
            self.record_event(run, TimelineEvent::device(TimelineEventType::StepEnd, alias, message));
            self.inner.events.on_step_complete(alias, index, &result);

            if !result.success {
                let message = result.error.clone().unwrap_or_else(|| "step failed".to_string());
                self.report_error(run, alias, ExecutionError::step(alias, index, message));
                outcome = FlowOutcome::Failed;
            }

            *self.inner.progress.lock() = ProgressSnapshot {
                state: self.state(),
                completed_steps: completed,
                total_steps: run.total_steps,
                current_device: Some(alias.to_string()),
            };
            self.inner.events.on_progress(&self.progress());

            if !result.success && self.inner.config.stop_on_failure {
                warn!("[{}] step {} failed, skipping rest of block", alias, index);
                break;
            }
        }

        Ok(outcome)
    }

    async fn run_parallel(&self, parallel: &ParallelBlock, run: &Run) -> Result<FlowOutcome> {
        debug!("Fanning out {} parallel branches", parallel.blocks.len());

        let branches = parallel.blocks.iter().map(|block| self.run_block(block, run));
        let mut outcome = FlowOutcome::Completed;
        for branch in join_all(branches).await {
            outcome = outcome.combine(branch?);
        }
        Ok(outcome)
    }

    async fn sync_point(&self, point: &SyncPoint, run: &Run) -> FlowOutcome {
        let sessions: Vec<Arc<dyn DeviceSession>> = self.inner.sessions.read().values().cloned().collect();
        let devices: Vec<String> = sessions.iter().map(|s| s.alias().to_string()).collect();
        let timeout_ms = point
            .timeout_ms
            .unwrap_or(self.inner.config.default_sync_timeout_ms);

        let start_time = Utc::now();
        let clock = Instant::now();
        info!("Sync point {}: waiting for {}", point.id, devices.join(", "));
        self.record_event(
            run,
            TimelineEvent::sync(
                TimelineEventType::SyncWait,
                &point.id,
                format!("waiting for {}", devices.join(", ")),
            ),
        );
        self.inner.events.on_sync_wait(&point.id, &devices);

        let settled = barrier::wait_for_quiescence(&sessions, Duration::from_millis(timeout_ms)).await;
        let duration_ms = clock.elapsed().as_millis() as u64;

        let message = if settled {
            format!("released after {}ms", duration_ms)
        } else {
            format!("timed out after {}ms", timeout_ms)
        };
        self.record_event(
            run,
            TimelineEvent::sync(TimelineEventType::SyncRelease, &point.id, message),
        );
        self.inner.events.on_sync_release(&point.id, &devices);

        run.recorder.push_sync(SyncPointTiming {
            id: point.id.clone(),
            start_time,
            end_time: Utc::now(),
            duration_ms,
            waiting_devices: devices,
            timeout_ms: Some(timeout_ms),
            timed_out: !settled,
        });

        if settled {
            FlowOutcome::Completed
        } else {
            warn!("Sync point {} timed out after {}ms", point.id, timeout_ms);
            let err = ExecutionError::orchestration(format!(
                "sync point '{}' timed out after {}ms",
                point.id, timeout_ms
            ));
            self.report_error(run, ORCHESTRATOR_DEVICE_ID, err);
            FlowOutcome::Failed
        }
    }

    fn session(&self, alias: &str) -> Result<Arc<dyn DeviceSession>> {
        self.inner
            .sessions
            .read()
            .get(alias)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice {
                alias: alias.to_string(),
            })
    }

    /// Relay status changes of `session` to the status-change callback
    fn listen(&self, session: &Arc<dyn DeviceSession>) {
        let mut rx = session.subscribe();
        let alias = session.alias().to_string();
        let events = self.inner.events.clone();

        let handle = tokio::spawn(async move {
            let mut last = rx.borrow_and_update().status;
            while rx.changed().await.is_ok() {
                let status = rx.borrow_and_update().status;
                if status != last {
                    last = status;
                    events.on_device_status_change(&alias, status);
                }
            }
        });
        self.inner.listeners.lock().push(handle);
    }

    /// Disconnect every session and drop the status listeners
    async fn cleanup(&self) {
        let sessions: Vec<Arc<dyn DeviceSession>> = self.inner.sessions.read().values().cloned().collect();
        join_all(sessions.iter().map(|session| session.disconnect())).await;

        // let listeners observe the final transition before they go away
        tokio::task::yield_now().await;
        for handle in self.inner.listeners.lock().drain(..) {
            handle.abort();
        }
        debug!("Disconnected {} sessions", sessions.len());
    }

    fn record_event(&self, run: &Run, event: TimelineEvent) {
        self.inner.events.on_timeline_event(&event);
        run.recorder.push_event(event);
    }

    fn report_error(&self, run: &Run, alias: &str, err: ExecutionError) {
        self.inner.events.on_error(alias, &err);
        let event = match alias {
            ORCHESTRATOR_DEVICE_ID => TimelineEvent {
                timestamp: Utc::now(),
                event_type: TimelineEventType::Error,
                device_id: None,
                sync_point_id: None,
                message: err.message.clone(),
            },
            _ => TimelineEvent::device(TimelineEventType::Error, alias, err.message.clone()),
        };
        self.record_event(run, event);
        run.recorder.push_error(err);
    }

    fn set_state(&self, state: OrchestratorState) {
        self.inner.state.send_modify(|current| *current = state);
    }

    /// Publish the current state with the last known step counts
    fn emit_progress(&self) {
        let snapshot = {
            let mut progress = self.inner.progress.lock();
            progress.state = self.state();
            progress.clone()
        };
        self.inner.events.on_progress(&snapshot);
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(r#"{"stop_on_failure":true}"#).unwrap();
        assert!(config.stop_on_failure);
        assert!(!config.abort_on_failure);
        assert_eq!(config.connect_retry.max_attempts, 3);
        assert_eq!(config.default_sync_timeout_ms, 30_000);
    }

    #[test]
    fn test_outcome_combine() {
        use FlowOutcome::*;
        assert_eq!(Completed.combine(Failed), Failed);
        assert_eq!(Failed.combine(Stopped), Stopped);
        assert_eq!(Completed.combine(Completed), Completed);
    }

    #[test]
    fn test_pause_resume_only_from_matching_states() {
        let orchestrator = Orchestrator::default();
        orchestrator.pause();
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);

        orchestrator.set_state(OrchestratorState::Running);
        orchestrator.resume();
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        orchestrator.pause();
        assert_eq!(orchestrator.state(), OrchestratorState::Paused);
        orchestrator.resume();
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        orchestrator.stop();
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn test_empty_flow_succeeds() {
        let orchestrator = Orchestrator::default();
        let result = orchestrator
            .execute(&CollaborativeScript::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.total_steps(), 0);
        assert!(result.errors.is_empty());
        assert_eq!(orchestrator.state(), OrchestratorState::Completed);
    }
}
