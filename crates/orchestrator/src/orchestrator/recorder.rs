//! Accumulates everything one `execute` call produces

use indexmap::IndexMap;
use parking_lot::Mutex;

use tandem_common::{
    DeviceConfig, DeviceExecutionResult, Error, ExecutionError, Result, StepResult, SyncPointTiming, TimelineEvent,
};

#[derive(Debug, Default)]
pub(crate) struct RunLog {
    pub devices: IndexMap<String, DeviceExecutionResult>,
    pub sync_points: Vec<SyncPointTiming>,
    pub errors: Vec<ExecutionError>,
    pub timeline: Vec<TimelineEvent>,
    pub completed_steps: usize,
}

/// Run log shared by concurrently executing branches
#[derive(Debug, Default)]
pub(crate) struct RunRecorder {
    log: Mutex<RunLog>,
}

impl RunRecorder {
    /// One empty result per device, in declaration order
    pub fn new(configs: &[DeviceConfig]) -> Self {
        let devices = configs
            .iter()
            .map(|c| (c.alias.clone(), DeviceExecutionResult::new(c.id.clone(), c.alias.clone())))
            .collect();
        Self {
            log: Mutex::new(RunLog {
                devices,
                ..Default::default()
            }),
        }
    }

    /// Index the next step recorded for `alias` will get
    pub fn next_index(&self, alias: &str) -> usize {
        self.log.lock().devices.get(alias).map(|d| d.steps.len()).unwrap_or(0)
    }

    /// Append a step to the device's history; returns its index and the new completed count
    pub fn record_step(&self, alias: &str, instruction: String, result: StepResult) -> Result<(usize, usize)> {
        let mut log = self.log.lock();
        let device = log.devices.get_mut(alias).ok_or_else(|| Error::UnknownDevice {
            alias: alias.to_string(),
        })?;
        let index = device.record(instruction, result);
        log.completed_steps += 1;
        Ok((index, log.completed_steps))
    }

    pub fn push_error(&self, error: ExecutionError) {
        self.log.lock().errors.push(error);
    }

    pub fn push_event(&self, event: TimelineEvent) {
        self.log.lock().timeline.push(event);
    }

    pub fn push_sync(&self, timing: SyncPointTiming) {
        self.log.lock().sync_points.push(timing);
    }

    pub fn into_log(self) -> RunLog {
        self.log.into_inner()
    }
}
