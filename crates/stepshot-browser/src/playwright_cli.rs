use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::backend::{
    resolve_step_action, BackendKind, ResolvedAction, StepBackend, StepExecutionError,
    StepOutcome,
};
use stepshot_types::{RunSettings, Step};

pub const DEFAULT_WAIT_FOR_SELECTOR_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DRIVER_COMMAND_TIMEOUT_MS: u64 = 30_000;
pub const SUPPORTED_BROWSERS: [&str; 4] = ["chrome", "chromium", "firefox", "webkit"];

const DRIVER_ERROR_CODE_TIMEOUT: &str = "timeout";

/// Settings for the external Playwright driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Driver executable; a bare name is looked up on `PATH`.
    pub playwright_cli: Option<PathBuf>,
    /// Upper bound for any single driver subcommand.
    pub command_timeout_ms: u64,
    pub wait_for_selector_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            playwright_cli: None,
            command_timeout_ms: DEFAULT_DRIVER_COMMAND_TIMEOUT_MS,
            wait_for_selector_timeout_ms: DEFAULT_WAIT_FOR_SELECTOR_TIMEOUT_MS,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_ms == 0 {
            bail!("driver command_timeout_ms must be greater than 0");
        }
        if self.wait_for_selector_timeout_ms == 0 {
            bail!("driver wait_for_selector_timeout_ms must be greater than 0");
        }
        if self
            .playwright_cli
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            bail!("playwright driver path cannot be empty");
        }
        Ok(())
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Session establishment failures. Each one demotes the run to simulation.
#[derive(Debug, Error)]
pub enum BackendInitError {
    #[error("unsupported browser '{0}' (expected one of: chrome, chromium, firefox, webkit)")]
    UnsupportedBrowser(String),
    #[error("failed to start driver session: {0:#}")]
    Launch(anyhow::Error),
    #[error("driver rejected session: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
enum DriverCommandError {
    #[error("driver subcommand '{subcommand}' timed out after {timeout_ms}ms")]
    TimedOut {
        subcommand: &'static str,
        timeout_ms: u64,
    },
    #[error("{0:#}")]
    Failed(anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub browser: String,
    pub headless: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandleRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionStartResponse {
    #[serde(default)]
    session_id: String,
}

/// Payload of the `execute-action` subcommand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriverActionRequest {
    pub session_id: String,
    pub action: String,
    pub url: String,
    pub selector: String,
    pub text: String,
    pub timeout_ms: u64,
}

impl DriverActionRequest {
    fn new(session_id: &str, action: ResolvedAction<'_>, timeout_ms: u64) -> Self {
        let (url, selector, text) = match action {
            ResolvedAction::Open { url } => (url, "", ""),
            ResolvedAction::Click { selector } => ("", selector, ""),
            ResolvedAction::Type { selector, text } => ("", selector, text),
            ResolvedAction::WaitForSelector { selector } => ("", selector, ""),
        };
        Self {
            session_id: session_id.to_string(),
            action: action.name().to_string(),
            url: url.to_string(),
            selector: selector.to_string(),
            text: text.to_string(),
            timeout_ms,
        }
    }

    fn locator(&self) -> &str {
        if self.selector.is_empty() {
            &self.url
        } else {
            &self.selector
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriverActionResponse {
    pub ok: bool,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotResponse {
    #[serde(default)]
    png_base64: String,
}

/// A located, executable driver that can open sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealDriverHandle {
    cli_path: PathBuf,
    config: DriverConfig,
}

impl RealDriverHandle {
    pub fn new(cli_path: impl Into<PathBuf>, config: DriverConfig) -> Self {
        Self {
            cli_path: cli_path.into(),
            config,
        }
    }

    pub fn cli_path(&self) -> &Path {
        &self.cli_path
    }

    /// Opens one browser session for a run.
    pub async fn establish_session(
        &self,
        settings: &RunSettings,
    ) -> Result<PlaywrightCliDriver, BackendInitError> {
        let browser = settings.normalized_browser();
        if !SUPPORTED_BROWSERS.contains(&browser.as_str()) {
            return Err(BackendInitError::UnsupportedBrowser(browser));
        }

        let mut driver = PlaywrightCliDriver {
            cli_path: self.cli_path.clone(),
            config: self.config.clone(),
            session_id: None,
        };
        let payload = serde_json::to_string(&SessionRequest {
            browser: browser.clone(),
            headless: settings.headless,
        })
        .context("serialize start-session request")
        .map_err(BackendInitError::Launch)?;
        let output = driver
            .invoke_bounded("start-session", &payload, self.config.command_timeout())
            .await
            .map_err(|error| BackendInitError::Launch(error.into()))?;
        let response = serde_json::from_str::<SessionStartResponse>(&output).map_err(|error| {
            BackendInitError::Rejected(format!(
                "unparseable start-session response '{output}': {error}"
            ))
        })?;
        if response.session_id.trim().is_empty() {
            return Err(BackendInitError::Rejected(
                "start-session response is missing sessionId".to_string(),
            ));
        }

        tracing::info!(
            driver = %self.cli_path.display(),
            browser = %browser,
            headless = settings.headless,
            session_id = %response.session_id,
            "driver session established"
        );
        driver.session_id = Some(response.session_id);
        Ok(driver)
    }
}

/// Real browser backend: one driver session, owned by one run.
#[derive(Debug)]
pub struct PlaywrightCliDriver {
    cli_path: PathBuf,
    config: DriverConfig,
    session_id: Option<String>,
}

impl PlaywrightCliDriver {
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn invoke_command(&self, subcommand: &str, payload: &str) -> Result<String> {
        let mut command = Command::new(&self.cli_path);
        command
            .arg(subcommand)
            .arg(payload)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = command.output().await.with_context(|| {
            format!(
                "failed to launch playwright driver '{}'",
                self.cli_path.display()
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let detail = if !stderr.is_empty() {
                stderr
            } else if !stdout.is_empty() {
                stdout
            } else {
                "no output".to_string()
            };
            bail!("driver subcommand '{subcommand}' failed: {detail}");
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn invoke_bounded(
        &self,
        subcommand: &'static str,
        payload: &str,
        timeout: Duration,
    ) -> Result<String, DriverCommandError> {
        match tokio::time::timeout(timeout, self.invoke_command(subcommand, payload)).await {
            Ok(result) => result.map_err(DriverCommandError::Failed),
            Err(_) => Err(DriverCommandError::TimedOut {
                subcommand,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    fn action_bound(&self, action: ResolvedAction<'_>) -> Duration {
        match action {
            ResolvedAction::WaitForSelector { .. } => {
                self.config.command_timeout()
                    + Duration::from_millis(self.config.wait_for_selector_timeout_ms)
            }
            _ => self.config.command_timeout(),
        }
    }

    async fn capture_screenshot(&self, session_id: &str) -> Option<String> {
        let payload = serde_json::to_string(&SessionHandleRequest {
            session_id: session_id.to_string(),
        })
        .ok()?;
        let output = match self
            .invoke_bounded("capture-screenshot", &payload, self.config.command_timeout())
            .await
        {
            Ok(output) => output,
            Err(error) => {
                tracing::debug!(error = %error, "screenshot capture failed");
                return None;
            }
        };
        match serde_json::from_str::<ScreenshotResponse>(&output) {
            Ok(response) if !response.png_base64.trim().is_empty() => Some(format!(
                "data:image/png;base64,{}",
                response.png_base64.trim()
            )),
            Ok(_) => None,
            Err(error) => {
                tracing::debug!(error = %error, "screenshot response was not valid json");
                None
            }
        }
    }
}

#[async_trait]
impl StepBackend for PlaywrightCliDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::RealDriver
    }

    async fn execute_step(
        &mut self,
        index: usize,
        step: &Step,
    ) -> Result<StepOutcome, StepExecutionError> {
        let action = resolve_step_action(step)?;
        let Some(session_id) = self.session_id.clone() else {
            return Err(StepExecutionError::Execution(
                "driver session is not active".to_string(),
            ));
        };

        let request =
            DriverActionRequest::new(&session_id, action, self.config.wait_for_selector_timeout_ms);
        let payload = serde_json::to_string(&request).map_err(|error| {
            StepExecutionError::Execution(format!("serialize driver action request: {error}"))
        })?;
        tracing::debug!(step = index + 1, action = action.name(), "executing driver action");

        let output = match self
            .invoke_bounded("execute-action", &payload, self.action_bound(action))
            .await
        {
            Ok(output) => output,
            Err(DriverCommandError::TimedOut { .. })
                if matches!(action, ResolvedAction::WaitForSelector { .. }) =>
            {
                return Err(StepExecutionError::Timeout {
                    selector: request.selector.clone(),
                    timeout_ms: request.timeout_ms,
                });
            }
            Err(error) => return Err(StepExecutionError::Execution(error.to_string())),
        };

        let response = serde_json::from_str::<DriverActionResponse>(&output).map_err(|error| {
            StepExecutionError::Execution(format!(
                "failed to parse driver response '{output}': {error}"
            ))
        })?;
        if !response.ok {
            if response.error_code == DRIVER_ERROR_CODE_TIMEOUT {
                return Err(StepExecutionError::Timeout {
                    selector: request.locator().to_string(),
                    timeout_ms: request.timeout_ms,
                });
            }
            let message = if !response.message.trim().is_empty() {
                response.message
            } else if !response.error_code.trim().is_empty() {
                response.error_code
            } else {
                "driver reported failure".to_string()
            };
            return Err(StepExecutionError::Execution(message));
        }

        Ok(StepOutcome {
            screenshot: self.capture_screenshot(&session_id).await,
        })
    }

    /// The session id is only cleared once the driver confirms shutdown, so a
    /// failed or cancelled release is retried from `Drop`.
    async fn release(&mut self) -> Result<()> {
        let Some(session_id) = self.session_id.clone() else {
            return Ok(());
        };
        let payload = serde_json::to_string(&SessionHandleRequest { session_id })
            .context("serialize shutdown-session request")?;
        self.invoke_bounded("shutdown-session", &payload, self.config.command_timeout())
            .await
            .map_err(anyhow::Error::from)?;
        self.session_id = None;
        Ok(())
    }
}

impl Drop for PlaywrightCliDriver {
    fn drop(&mut self) {
        let Some(session_id) = self.session_id.take() else {
            return;
        };
        let Ok(payload) = serde_json::to_string(&SessionHandleRequest { session_id }) else {
            return;
        };
        let spawned = std::process::Command::new(&self.cli_path)
            .arg("shutdown-session")
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                // Reaped off-thread; drop may run outside any runtime.
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(error) => {
                tracing::warn!(
                    cli = %self.cli_path.display(),
                    error = %error,
                    "failed to spawn driver shutdown for dropped session"
                );
            }
        }
    }
}
