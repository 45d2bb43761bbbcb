//! Browser sessions driven through Playwright

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use tandem_common::{
    BrowserSettings, DataMap, DeviceConfig, DeviceInfo, DeviceKind, Error, Result, StepKind, StepResult, TestStep,
};

use super::commands::{self, DriverCommand, DriverRequest, DriverResponse};
use super::{DeviceSession, SessionCore};

const DRIVER_SCRIPT: &str = include_str!("driver.js");

/// Extra time granted on top of a wait's own timeout before the session gives up on the driver
const WAIT_GRACE_MS: u64 = 2_000;

/// Driver-side timeout plus slack for the response to arrive
fn with_grace(timeout_ms: u64) -> u64 {
    timeout_ms.saturating_add(WAIT_GRACE_MS)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserEngine {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserEngine::Chromium => "chromium",
            BrowserEngine::Firefox => "firefox",
            BrowserEngine::Webkit => "webkit",
        }
    }
}

/// How browser sessions start and talk to their Playwright driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserDriverConfig {
    /// Node.js executable used to run the driver
    pub node_binary: PathBuf,

    /// Directory the driver runs in; `playwright` must be resolvable from here
    pub working_dir: Option<PathBuf>,

    pub browser: BrowserEngine,

    pub headless: bool,

    /// Where per-step screenshots are written (None disables them).
    /// The CLI points this at each run's own directory when unset.
    pub screenshot_dir: Option<PathBuf>,

    /// Upper bound for any single driver command
    pub command_timeout_ms: u64,
}

impl Default for BrowserDriverConfig {
    fn default() -> Self {
        Self {
            node_binary: PathBuf::from("node"),
            working_dir: None,
            browser: BrowserEngine::Chromium,
            headless: true,
            screenshot_dir: None,
            command_timeout_ms: 30_000,
        }
    }
}

/// Running driver process
struct Driver {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

/// A browser tab controlled by its own Playwright driver process
pub struct BrowserSession {
    core: SessionCore,
    settings: BrowserSettings,
    driver_config: BrowserDriverConfig,
    driver: Mutex<Option<Driver>>,
    steps_run: AtomicUsize,
}

impl BrowserSession {
    pub fn new(config: DeviceConfig, driver_config: BrowserDriverConfig) -> Self {
        let settings = match &config.kind {
            DeviceKind::Browser(settings) => settings.clone(),
            _ => BrowserSettings::default(),
        };
        Self {
            core: SessionCore::new(config),
            settings,
            driver_config,
            driver: Mutex::new(None),
            steps_run: AtomicUsize::new(0),
        }
    }

    fn connection_error(&self, message: impl Into<String>) -> Error {
        Error::Connection {
            alias: self.core.alias().to_string(),
            message: message.into(),
        }
    }

    /// Spawn the driver, launch the browser and open the start page
    async fn launch(&self) -> Result<()> {
        let mut command = Command::new(&self.driver_config.node_binary);
        command
            .arg("-e")
            .arg(DRIVER_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.driver_config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            self.connection_error(format!(
                "failed to spawn {}: {}",
                self.driver_config.node_binary.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.connection_error("driver stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.connection_error("driver stdout unavailable"))?;

        *self.driver.lock().await = Some(Driver {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
        });

        if let Some(dir) = &self.driver_config.screenshot_dir {
            tokio::fs::create_dir_all(dir).await?;
        }

        let launch = DriverCommand::Launch {
            browser: self.driver_config.browser.as_str().to_string(),
            headless: self.driver_config.headless,
            base_url: self.settings.start_url.clone(),
            viewport: self.settings.viewport,
            user_agent: self.settings.user_agent.clone(),
            has_touch: self.settings.has_touch,
            is_mobile: self.settings.is_mobile,
            device_scale_factor: self.settings.device_scale_factor,
        };
        self.request(&launch, self.driver_config.command_timeout_ms).await?;

        if let Some(url) = &self.settings.start_url {
            self.request(&DriverCommand::Goto { url: url.clone() }, self.driver_config.command_timeout_ms)
                .await?;
        }

        Ok(())
    }

    /// Send one command and wait for its response
    async fn request(&self, command: &DriverCommand, timeout_ms: u64) -> Result<serde_json::Value> {
        let mut guard = self.driver.lock().await;
        let driver = guard
            .as_mut()
            .ok_or_else(|| self.connection_error("driver is not running"))?;

        let id = driver.next_id;
        driver.next_id += 1;

        let mut line = serde_json::to_string(&DriverRequest { id, command })?;
        line.push('\n');
        debug!("[{}] -> {}", self.core.alias(), line.trim_end());

        let exchange = async {
            driver
                .stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| self.connection_error(format!("driver write failed: {}", e)))?;
            driver
                .stdin
                .flush()
                .await
                .map_err(|e| self.connection_error(format!("driver write failed: {}", e)))?;

            loop {
                let raw = driver
                    .stdout
                    .next_line()
                    .await
                    .map_err(|e| self.connection_error(format!("driver read failed: {}", e)))?
                    .ok_or_else(|| self.connection_error("driver process exited"))?;

                match serde_json::from_str::<DriverResponse>(&raw) {
                    Ok(response) if response.id == id => return Ok::<_, Error>(response),
                    Ok(response) => debug!("[{}] dropping stale response {}", self.core.alias(), response.id),
                    Err(_) => debug!("[{}] driver: {}", self.core.alias(), raw),
                }
            }
        };

        let response = tokio::time::timeout(Duration::from_millis(timeout_ms), exchange)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("{} driver command", self.core.alias()),
                millis: timeout_ms,
            })??;

        if response.ok {
            Ok(response.value)
        } else {
            Err(Error::Driver(
                response.error.unwrap_or_else(|| "driver reported failure".to_string()),
            ))
        }
    }

    /// Run the step body and its exports
    async fn run_step(&self, step: &TestStep) -> Result<DataMap> {
        let default_timeout = self.driver_config.command_timeout_ms;

        let (command, timeout_ms) = match &step.kind {
            StepKind::Navigate { url } => (
                DriverCommand::Goto {
                    url: self.core.interpolate(url),
                },
                default_timeout,
            ),
            StepKind::Action { instruction } => (
                commands::parse_action(&self.core.interpolate(instruction))?,
                default_timeout,
            ),
            StepKind::Assert { assertion } => (
                commands::parse_assertion(&self.core.interpolate(assertion), default_timeout)?,
                with_grace(default_timeout),
            ),
            StepKind::Wait { condition, timeout_ms } => (
                commands::parse_wait(&self.core.interpolate(condition), *timeout_ms),
                with_grace(*timeout_ms),
            ),
        };

        self.request(&command, timeout_ms).await?;

        let mut exported = DataMap::new();
        for (key, query) in &step.export {
            let query = commands::parse_export(&self.core.interpolate(query));
            let value = self.request(&query, default_timeout).await?;
            exported.insert(key.clone(), value);
        }
        Ok(exported)
    }

    async fn capture(&self, index: usize) -> Option<String> {
        let dir = self.driver_config.screenshot_dir.as_ref()?;
        let path = dir.join(format!("{}-{:03}.png", self.core.alias(), index));
        let command = DriverCommand::Screenshot {
            path: path.to_string_lossy().into_owned(),
        };

        match self.request(&command, self.driver_config.command_timeout_ms).await {
            Ok(_) => Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                warn!("[{}] screenshot failed: {}", self.core.alias(), e);
                None
            }
        }
    }

    /// Stop the driver process: ask nicely, then SIGTERM, then kill
    async fn shutdown_driver(&self) {
        let has_driver = self.driver.lock().await.is_some();
        if has_driver {
            if let Err(e) = self.request(&DriverCommand::Close, 5_000).await {
                debug!("[{}] close request failed: {}", self.core.alias(), e);
            }
        }

        let Some(mut driver) = self.driver.lock().await.take() else {
            return;
        };

        if let Ok(Some(_)) = driver.child.try_wait() {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = driver.child.id() {
                if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                    && tokio::time::timeout(Duration::from_millis(500), driver.child.wait())
                        .await
                        .is_ok()
                {
                    return;
                }
            }
        }

        if let Err(e) = driver.child.kill().await {
            warn!("[{}] failed to kill driver: {}", self.core.alias(), e);
        }
    }
}

#[async_trait]
impl DeviceSession for BrowserSession {
    fn config(&self) -> &DeviceConfig {
        self.core.config()
    }

    async fn connect(&self) -> Result<()> {
        if !self.core.begin_connect()? {
            return Ok(());
        }

        info!("[{}] connecting {} browser", self.core.alias(), self.driver_config.browser.as_str());
        match self.launch().await {
            Ok(()) => {
                self.core.transition(tandem_common::DeviceStatus::Ready)?;
                info!("[{}] ready", self.core.alias());
                Ok(())
            }
            Err(e) => {
                self.shutdown_driver().await;
                self.core.fail(e.to_string());
                if matches!(e, Error::Connection { .. }) {
                    Err(e)
                } else {
                    Err(self.connection_error(e.to_string()))
                }
            }
        }
    }

    async fn disconnect(&self) {
        self.shutdown_driver().await;
        self.core.mark_disconnected();
        debug!("[{}] disconnected", self.core.alias());
    }

    async fn execute_step(&self, step: &TestStep) -> StepResult {
        if let Err(e) = self.core.begin_step() {
            return StepResult::failed(e.to_string(), 0);
        }

        let index = self.steps_run.fetch_add(1, Ordering::SeqCst);
        debug!("[{}] step {}: {}", self.core.alias(), index, step.instruction());

        let start = Instant::now();
        let outcome = self.run_step(step).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let screenshot = self.capture(index).await;
        self.core.set_screenshot(screenshot.clone());

        match outcome {
            Ok(exported) => {
                self.core.end_step();
                StepResult::passed(duration_ms)
                    .with_exported(exported)
                    .with_screenshot(screenshot)
            }
            Err(e) => {
                let message = e.to_string();
                if matches!(e, Error::Connection { .. }) {
                    self.core.fail(message.clone());
                } else {
                    self.core.end_step();
                }
                StepResult::failed(message, duration_ms).with_screenshot(screenshot)
            }
        }
    }

    fn inject_data(&self, data: &DataMap) {
        self.core.inject(data);
    }

    fn info(&self) -> DeviceInfo {
        self.core.info()
    }

    fn subscribe(&self) -> watch::Receiver<DeviceInfo> {
        self.core.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_common::DeviceStatus;

    fn session(node: &str) -> BrowserSession {
        let config = DeviceConfig::new("tab", DeviceKind::Browser(BrowserSettings::default()));
        BrowserSession::new(
            config,
            BrowserDriverConfig {
                node_binary: PathBuf::from(node),
                screenshot_dir: None,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_driver_config_defaults_from_partial_toml() {
        let config: BrowserDriverConfig = serde_json::from_str(r#"{"browser":"firefox"}"#).unwrap();
        assert_eq!(config.browser, BrowserEngine::Firefox);
        assert!(config.headless);
        assert_eq!(config.command_timeout_ms, 30_000);
        assert_eq!(config.screenshot_dir, None);
    }

    #[test]
    fn test_grace_saturates_on_huge_timeouts() {
        assert_eq!(with_grace(1_000), 3_000);
        assert_eq!(with_grace(u64::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_step_before_connect_fails_fast() {
        let session = session("node");
        let result = session.execute_step(&TestStep::action("click #go")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not ready"));
        assert_eq!(session.state(), DeviceStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_moves_to_error() {
        let session = session("/nonexistent/tandem-node");
        let err = session.connect().await.unwrap_err();
        assert!(err.is_connection());

        let info = session.info();
        assert_eq!(info.status, DeviceStatus::Error);
        assert!(info.last_error.is_some());

        session.disconnect().await;
        assert_eq!(session.state(), DeviceStatus::Disconnected);
    }
}
