//! CLI configuration file

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tandem_orchestrator::{BrowserDriverConfig, OrchestratorConfig};

/// Contents of `tandem.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    /// Where run results are written
    pub output_dir: PathBuf,

    /// Failure handling, connect retry and sync timeouts
    pub orchestrator: OrchestratorConfig,

    /// Playwright driver settings for browser devices
    pub browser: BrowserDriverConfig,
}

impl Default for TandemConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("tandem-results"),
            orchestrator: OrchestratorConfig::default(),
            browser: BrowserDriverConfig::default(),
        }
    }
}

impl TandemConfig {
    /// Load configuration from file, falling back to defaults when it is missing
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
