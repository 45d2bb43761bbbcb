//! Device sessions
//!
//! A session owns exactly one device connection and executes single test
//! steps against it. Concrete backends implement [`DeviceSession`]; most of
//! the bookkeeping they share lives in [`SessionCore`].

mod browser;
pub mod commands;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::{Captures, Regex};
use tokio::sync::watch;
use tracing::{debug, warn};

use tandem_common::{DataMap, DeviceConfig, DeviceInfo, DeviceKind, DeviceStatus, Error, Result, StepResult, TestStep};

use crate::retry::{with_retry, RetryConfig};

pub use browser::{BrowserDriverConfig, BrowserEngine, BrowserSession};

/// Connection lifecycle and step execution for one device
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Configuration this session was built from
    fn config(&self) -> &DeviceConfig;

    fn alias(&self) -> &str {
        &self.config().alias
    }

    /// Establish the device handle. A no-op when already ready.
    async fn connect(&self) -> Result<()>;

    /// Best-effort teardown; always ends `disconnected`.
    async fn disconnect(&self);

    /// Disconnect then connect, retried with `retry`
    async fn reconnect(&self, retry: &RetryConfig) -> Result<()> {
        let label = format!("reconnect {}", self.alias());
        with_retry(retry, &label, || async move {
            self.disconnect().await;
            self.connect().await
        })
        .await
    }

    /// Execute one step. Failures are reported in the result, never raised.
    async fn execute_step(&self, step: &TestStep) -> StepResult;

    /// Merge shared data into the interpolation context
    fn inject_data(&self, data: &DataMap);

    fn info(&self) -> DeviceInfo;

    fn state(&self) -> DeviceStatus {
        self.info().status
    }

    /// Receiver notified on every change to this session's [`DeviceInfo`]
    fn subscribe(&self) -> watch::Receiver<DeviceInfo>;
}

/// Builds sessions for device configs
pub trait SessionFactory: Send + Sync {
    fn create(&self, config: &DeviceConfig) -> Result<Arc<dyn DeviceSession>>;
}

impl<F> SessionFactory for F
where
    F: Fn(&DeviceConfig) -> Result<Arc<dyn DeviceSession>> + Send + Sync,
{
    fn create(&self, config: &DeviceConfig) -> Result<Arc<dyn DeviceSession>> {
        self(config)
    }
}

/// Factory for the device kinds tandem can drive itself
#[derive(Debug, Clone, Default)]
pub struct DefaultSessionFactory {
    browser: BrowserDriverConfig,
}

impl DefaultSessionFactory {
    pub fn new(browser: BrowserDriverConfig) -> Self {
        Self { browser }
    }
}

impl SessionFactory for DefaultSessionFactory {
    fn create(&self, config: &DeviceConfig) -> Result<Arc<dyn DeviceSession>> {
        match &config.kind {
            DeviceKind::Browser(_) => Ok(Arc::new(BrowserSession::new(
                config.clone(),
                self.browser.clone(),
            ))),
            other => Err(Error::NotImplemented(format!(
                "{} sessions (device '{}')",
                other.label(),
                config.alias
            ))),
        }
    }
}

/// Shared state holder for session implementations.
///
/// Enforces the lifecycle `disconnected -> connecting -> ready <-> busy`,
/// with `error` reachable from `connecting` and `busy` and `disconnected`
/// reachable from anywhere. Every change is published on a watch channel.
pub struct SessionCore {
    config: DeviceConfig,
    info: watch::Sender<DeviceInfo>,
    context: RwLock<DataMap>,
}

impl SessionCore {
    pub fn new(config: DeviceConfig) -> Self {
        let (info, _) = watch::channel(DeviceInfo::new(&config));
        Self {
            config,
            info,
            context: RwLock::new(DataMap::new()),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn alias(&self) -> &str {
        &self.config.alias
    }

    pub fn info(&self) -> DeviceInfo {
        self.info.borrow().clone()
    }

    pub fn status(&self) -> DeviceStatus {
        self.info.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceInfo> {
        self.info.subscribe()
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow
    pub fn transition(&self, to: DeviceStatus) -> Result<()> {
        let from = self.status();
        if !transition_allowed(from, to) {
            return Err(Error::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        debug!("[{}] {} -> {}", self.alias(), from, to);
        self.info.send_modify(|info| {
            info.status = to;
            if to == DeviceStatus::Ready {
                info.last_error = None;
            }
        });
        Ok(())
    }

    /// Start connecting. Returns `false` when the session is already ready.
    pub fn begin_connect(&self) -> Result<bool> {
        if self.status() == DeviceStatus::Ready {
            return Ok(false);
        }
        self.transition(DeviceStatus::Connecting)?;
        Ok(true)
    }

    /// Claim the session for one step, failing fast unless it is ready
    pub fn begin_step(&self) -> Result<()> {
        let status = self.status();
        if status != DeviceStatus::Ready {
            return Err(Error::DeviceNotReady {
                alias: self.alias().to_string(),
                status,
            });
        }
        self.transition(DeviceStatus::Busy)
    }

    /// Release the session after a step
    pub fn end_step(&self) {
        if let Err(e) = self.transition(DeviceStatus::Ready) {
            warn!("[{}] could not release session: {}", self.alias(), e);
        }
    }

    /// Record a failure and move to `error`
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let from = self.status();
        if !transition_allowed(from, DeviceStatus::Error) {
            warn!("[{}] error while {}: {}", self.alias(), from, message);
            self.info.send_modify(|info| info.last_error = Some(message));
            return;
        }

        debug!("[{}] {} -> error: {}", self.alias(), from, message);
        self.info.send_modify(|info| {
            info.status = DeviceStatus::Error;
            info.last_error = Some(message);
        });
    }

    /// Move to `disconnected`, which is allowed from every state
    pub fn mark_disconnected(&self) {
        self.info.send_modify(|info| info.status = DeviceStatus::Disconnected);
    }

    pub fn set_screenshot(&self, screenshot: Option<String>) {
        if screenshot.is_some() {
            self.info.send_modify(|info| info.last_screenshot = screenshot);
        }
    }

    /// Overwrite context entries with `data`. Values are replaced whole.
    pub fn inject(&self, data: &DataMap) {
        let mut context = self.context.write();
        for (key, value) in data {
            context.insert(key.clone(), value.clone());
        }
    }

    /// Copy of the current interpolation context
    pub fn context(&self) -> DataMap {
        self.context.read().clone()
    }

    /// Replace `${key}` placeholders with context values; unknown keys stay as written
    pub fn interpolate(&self, text: &str) -> String {
        let context = self.context.read();
        placeholder()
            .replace_all(text, |caps: &Captures| match context.get(&caps[1]) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\$\{\s*([A-Za-z0-9_.\-]+)\s*\}").unwrap())
}

fn transition_allowed(from: DeviceStatus, to: DeviceStatus) -> bool {
    use DeviceStatus::*;

    matches!(
        (from, to),
        (_, Disconnected)
            | (Disconnected, Connecting)
            | (Error, Connecting)
            | (Connecting, Ready)
            | (Connecting, Error)
            | (Ready, Busy)
            | (Busy, Ready)
            | (Busy, Error)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_common::BrowserSettings;

    fn core() -> SessionCore {
        SessionCore::new(DeviceConfig::new(
            "host",
            DeviceKind::Browser(BrowserSettings::default()),
        ))
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let core = core();
        assert_eq!(core.status(), DeviceStatus::Disconnected);
        assert!(core.begin_connect().unwrap());
        core.transition(DeviceStatus::Ready).unwrap();
        assert!(!core.begin_connect().unwrap());

        core.begin_step().unwrap();
        assert_eq!(core.status(), DeviceStatus::Busy);
        core.end_step();
        assert_eq!(core.status(), DeviceStatus::Ready);

        core.mark_disconnected();
        assert_eq!(core.status(), DeviceStatus::Disconnected);
    }

    #[test]
    fn test_step_requires_ready() {
        let core = core();
        let err = core.begin_step().unwrap_err();
        assert!(matches!(err, Error::DeviceNotReady { status: DeviceStatus::Disconnected, .. }));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let core = core();
        assert!(core.transition(DeviceStatus::Busy).is_err());
        assert!(core.transition(DeviceStatus::Ready).is_err());
    }

    #[test]
    fn test_fail_records_error() {
        let core = core();
        core.begin_connect().unwrap();
        core.fail("refused");
        let info = core.info();
        assert_eq!(info.status, DeviceStatus::Error);
        assert_eq!(info.last_error.as_deref(), Some("refused"));

        // Error -> Connecting is allowed so a failed device can be retried
        assert!(core.begin_connect().unwrap());
    }

    #[test]
    fn test_subscribers_see_changes() {
        let core = core();
        let mut rx = core.subscribe();
        core.begin_connect().unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().status, DeviceStatus::Connecting);
    }

    #[test]
    fn test_interpolation() {
        let core = core();
        let mut data = DataMap::new();
        data.insert("user".into(), json!("alice"));
        data.insert("count".into(), json!(3));
        core.inject(&data);

        assert_eq!(
            core.interpolate("fill #name with ${user} x${count} ${missing}"),
            "fill #name with alice x3 ${missing}"
        );
    }

    #[test]
    fn test_inject_is_last_writer_wins() {
        let core = core();
        let mut first = DataMap::new();
        first.insert("cfg".into(), json!({"a": 1, "b": 2}));
        first.insert("keep".into(), json!("yes"));
        core.inject(&first);

        let mut second = DataMap::new();
        second.insert("cfg".into(), json!({"a": 9}));
        core.inject(&second);

        let context = core.context();
        assert_eq!(context["cfg"], json!({"a": 9}));
        assert_eq!(context["keep"], json!("yes"));
    }

    #[test]
    fn test_default_factory_rejects_unsupported_kinds() {
        let factory = DefaultSessionFactory::default();
        let mobile = DeviceConfig::new(
            "phone",
            DeviceKind::Mobile(tandem_common::MobileSettings {
                platform: tandem_common::MobilePlatform::Android,
                device_name: None,
                start_url: None,
            }),
        );
        let err = factory.create(&mobile).err().unwrap();
        assert!(matches!(err, Error::NotImplemented(_)));

        let browser = DeviceConfig::new("tab", DeviceKind::Browser(BrowserSettings::default()));
        let session = factory.create(&browser).unwrap();
        assert_eq!(session.alias(), "tab");
        assert_eq!(session.state(), DeviceStatus::Disconnected);
    }
}
