//! Collaborative script loading and validation

use std::collections::HashSet;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{CollaborativeScript, DeviceBlock, DeviceConfig, FlowStep, ORCHESTRATOR_DEVICE_ID};

impl CollaborativeScript {
    /// Parse a script from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    /// Parse a script from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Error::from)
    }

    /// Parse a script file, choosing the format by extension
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Load every script (`.yaml`, `.yml`, `.json`) below a directory
    pub fn load_all(dir: &Path) -> Result<Vec<(std::path::PathBuf, Self)>> {
        let mut scripts = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml" || ext == "json")
                    .unwrap_or(false)
            })
        {
            debug!("Loading script {}", entry.path().display());
            let script = Self::from_file(entry.path())?;
            scripts.push((entry.path().to_path_buf(), script));
        }

        Ok(scripts)
    }

    /// Sum of test steps across all device blocks, including parallel ones
    pub fn total_steps(&self) -> usize {
        self.flow.iter().map(FlowStep::step_count).sum()
    }

    /// Full device configs in declaration order, each with a synthesized id
    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        self.devices
            .iter()
            .map(|(alias, kind)| DeviceConfig::new(alias.clone(), kind.clone()))
            .collect()
    }

    /// Check the script's structural invariants, reporting every problem found
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        for alias in self.devices.keys() {
            if alias.trim().is_empty() {
                problems.push("device alias must not be empty".to_string());
            } else if alias == ORCHESTRATOR_DEVICE_ID {
                problems.push(format!(
                    "device alias '{}' is reserved for orchestration errors",
                    ORCHESTRATOR_DEVICE_ID
                ));
            }
        }

        for (index, step) in self.flow.iter().enumerate() {
            match step {
                FlowStep::Device(block) => self.check_block(index, block, &mut problems),
                FlowStep::Sync(sync) => {
                    if sync.id.trim().is_empty() {
                        problems.push(format!("flow[{}]: sync point id must not be empty", index));
                    }
                }
                FlowStep::Parallel(parallel) => {
                    let mut seen = HashSet::new();
                    for block in &parallel.blocks {
                        self.check_block(index, block, &mut problems);
                        if !seen.insert(block.device.as_str()) {
                            problems.push(format!(
                                "flow[{}]: device '{}' appears more than once in a parallel block",
                                index, block.device
                            ));
                        }
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidScript(problems.join("; ")))
        }
    }

    fn check_block(&self, index: usize, block: &DeviceBlock, problems: &mut Vec<String>) {
        if !self.devices.contains_key(&block.device) {
            problems.push(format!(
                "flow[{}]: unknown device alias '{}'",
                index, block.device
            ));
        }
    }
}
