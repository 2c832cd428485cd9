use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use stepshot_types::{Step, StepAction};

/// Typed failure of a single step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepExecutionError {
    #[error("Missing {field} for {action}")]
    MissingField { action: String, field: &'static str },
    #[error("Timed out after {timeout_ms}ms waiting for selector '{selector}'")]
    Timeout { selector: String, timeout_ms: u64 },
    #[error("Unsupported action \"{0}\"")]
    UnsupportedAction(String),
    #[error("{0}")]
    Execution(String),
}

impl StepExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "missing_field",
            Self::Timeout { .. } => "timeout",
            Self::UnsupportedAction(_) => "unsupported_action",
            Self::Execution(_) => "step_execution_error",
        }
    }
}

/// Successful step result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    /// Best-effort capture taken after the step, as a data URI.
    pub screenshot: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    RealDriver,
    Simulated,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RealDriver => "real_driver",
            Self::Simulated => "simulated",
        }
    }
}

/// Step-execution contract shared by the real driver and the simulator.
///
/// A backend instance belongs to exactly one run and is driven one step at a
/// time.
#[async_trait]
pub trait StepBackend: Send {
    fn kind(&self) -> BackendKind;
    async fn execute_step(
        &mut self,
        index: usize,
        step: &Step,
    ) -> Result<StepOutcome, StepExecutionError>;
    /// Releases any session held by the backend. Safe to call more than once.
    async fn release(&mut self) -> Result<()>;
}

/// A step whose required fields have been checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedAction<'a> {
    Open { url: &'a str },
    Click { selector: &'a str },
    Type { selector: &'a str, text: &'a str },
    WaitForSelector { selector: &'a str },
}

impl ResolvedAction<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Click { .. } => "click",
            Self::Type { .. } => "type",
            Self::WaitForSelector { .. } => "waitForSelector",
        }
    }
}

/// Checks the fields each action requires.
pub fn resolve_step_action(step: &Step) -> Result<ResolvedAction<'_>, StepExecutionError> {
    match &step.action {
        StepAction::Open => step
            .non_empty_target()
            .map(|url| ResolvedAction::Open { url })
            .ok_or_else(|| StepExecutionError::MissingField {
                action: "open".to_string(),
                field: "target",
            }),
        action @ StepAction::Click => Ok(ResolvedAction::Click {
            selector: require_selector(step, action)?,
        }),
        action @ StepAction::Type => Ok(ResolvedAction::Type {
            selector: require_selector(step, action)?,
            text: step.text.as_deref().unwrap_or_default(),
        }),
        action @ StepAction::WaitForSelector => Ok(ResolvedAction::WaitForSelector {
            selector: require_selector(step, action)?,
        }),
        StepAction::Unrecognized(raw) => Err(StepExecutionError::UnsupportedAction(raw.clone())),
    }
}

fn require_selector<'a>(
    step: &'a Step,
    action: &StepAction,
) -> Result<&'a str, StepExecutionError> {
    step.non_empty_selector()
        .ok_or_else(|| StepExecutionError::MissingField {
            action: action.as_str().to_string(),
            field: "selector",
        })
}
