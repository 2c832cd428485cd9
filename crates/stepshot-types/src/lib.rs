//! Shared data types for StepShot scripts and runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_BROWSER: &str = "chrome";

/// Error returned when a status transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid {kind} transition: {from:?} -> {to:?}")]
    Invalid {
        kind: &'static str,
        from: String,
        to: String,
    },
}

/// Action tag carried by a script step.
///
/// Unknown tags are preserved verbatim so that they can be reported back in
/// the run trace instead of rejecting the whole script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepAction {
    Open,
    Click,
    Type,
    WaitForSelector,
    Unrecognized(String),
}

impl StepAction {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "open" => Self::Open,
            "click" => Self::Click,
            "type" => Self::Type,
            "waitForSelector" => Self::WaitForSelector,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Open => "open",
            Self::Click => "click",
            Self::Type => "type",
            Self::WaitForSelector => "waitForSelector",
            Self::Unrecognized(raw) => raw.as_str(),
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

/// A step without an action tag is carried as an empty unrecognized action.
impl Default for StepAction {
    fn default() -> Self {
        Self::Unrecognized(String::new())
    }
}

impl From<String> for StepAction {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<StepAction> for String {
    fn from(value: StepAction) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One automation action of a script. Never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default)]
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Forces a failure when the step runs on the simulated backend.
    #[serde(
        default,
        deserialize_with = "deserialize_truthy",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub should_fail: bool,
}

/// Reads any JSON value as a flag: null, false, 0 and "" are false.
fn deserialize_truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => false,
        Value::Bool(flag) => flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

impl Step {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            target: None,
            selector: None,
            text: None,
            should_fail: false,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn failing(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Returns the target when present and not blank.
    pub fn non_empty_target(&self) -> Option<&str> {
        non_empty(self.target.as_deref())
    }

    /// Returns the selector when present and not blank.
    pub fn non_empty_selector(&self) -> Option<&str> {
        non_empty(self.selector.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

/// Per-run execution settings resolved from the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunSettings {
    pub browser: String,
    pub headless: bool,
    pub continue_on_error: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            browser: DEFAULT_BROWSER.to_string(),
            headless: true,
            continue_on_error: false,
        }
    }
}

impl RunSettings {
    /// Browser tag trimmed and lowercased; blank tags fall back to the default.
    pub fn normalized_browser(&self) -> String {
        let browser = self.browser.trim().to_ascii_lowercase();
        if browser.is_empty() {
            DEFAULT_BROWSER.to_string()
        } else {
            browser
        }
    }
}

/// Errors raised while parsing script content into a step sequence.
#[derive(Debug, Error)]
pub enum ScriptDocumentError {
    #[error("script content must be valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("script content must contain a steps array")]
    MissingSteps,
    #[error("script steps are malformed: {0}")]
    InvalidSteps(#[source] serde_json::Error),
}

/// Parsed script content: ordered steps plus run settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDocument {
    pub steps: Vec<Step>,
    #[serde(default)]
    pub settings: RunSettings,
}

impl ScriptDocument {
    pub fn new(steps: Vec<Step>, settings: RunSettings) -> Self {
        Self { steps, settings }
    }

    /// Action names in step order, as recorded on a new run.
    pub fn step_actions(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|step| step.action.as_str().to_string())
            .collect()
    }
}

/// Strictly parses script content.
pub fn parse_script_document(raw: &str) -> Result<ScriptDocument, ScriptDocumentError> {
    let value =
        serde_json::from_str::<Value>(raw).map_err(ScriptDocumentError::InvalidJson)?;
    if !value.get("steps").is_some_and(Value::is_array) {
        return Err(ScriptDocumentError::MissingSteps);
    }
    serde_json::from_value::<ScriptDocument>(value).map_err(ScriptDocumentError::InvalidSteps)
}

/// Parses script content, degrading to an empty document on malformed input.
///
/// The diagnostic is returned alongside so callers can record it.
pub fn parse_script_document_lenient(
    raw: &str,
) -> (ScriptDocument, Option<ScriptDocumentError>) {
    match parse_script_document(raw) {
        Ok(document) => (document, None),
        Err(error) => (ScriptDocument::default(), Some(error)),
    }
}

/// The login walkthrough seeded into an empty script catalog.
pub fn example_script_document() -> ScriptDocument {
    ScriptDocument::new(
        vec![
            Step::new(StepAction::Open).with_target("https://example.com"),
            Step::new(StepAction::Click).with_selector("#login"),
            Step::new(StepAction::Type)
                .with_selector("#username")
                .with_text("user@example.com"),
            Step::new(StepAction::Type)
                .with_selector("#password")
                .with_text("hunter2"),
            Step::new(StepAction::Click).with_selector("#submit"),
            Step::new(StepAction::WaitForSelector).with_selector("#dashboard"),
        ],
        RunSettings::default(),
    )
}

/// Stored script definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub id: String,
    pub name: String,
    /// Raw JSON content; parsed on demand.
    pub content: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Script {
    pub fn document(&self) -> (ScriptDocument, Option<ScriptDocumentError>) {
        parse_script_document_lenient(&self.content)
    }
}

/// Lifecycle state for a single step of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Passed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Passed)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Skipped)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "step_status",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Lifecycle state for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Self::Running, Self::Completed) | (Self::Running, Self::Failed)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "run_status",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }

    /// Returns true when no further execution is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Recorded outcome of one step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStepState {
    pub action: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Image reference, usually a data URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RunStepState {
    pub fn pending(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: StepStatus::Pending,
            duration_ms: None,
            screenshot: None,
            error_message: None,
        }
    }

    pub fn passed(action: impl Into<String>, duration_ms: u64, screenshot: Option<String>) -> Self {
        Self {
            action: action.into(),
            status: StepStatus::Passed,
            duration_ms: Some(duration_ms),
            screenshot,
            error_message: None,
        }
    }

    pub fn failed(
        action: impl Into<String>,
        duration_ms: u64,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            status: StepStatus::Failed,
            duration_ms: Some(duration_ms),
            screenshot: None,
            error_message: Some(error_message.into()),
        }
    }

    pub fn skipped(action: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            action: action.into(),
            status: StepStatus::Skipped,
            duration_ms: Some(duration_ms),
            screenshot: None,
            error_message: None,
        }
    }
}

/// Errors raised when mutating a run would break its invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunStateError {
    #[error(transparent)]
    Transition(#[from] StatusTransitionError),
    #[error("run '{run_id}' is no longer running ({status:?})")]
    RunNotActive { run_id: String, status: RunStatus },
    #[error("step index {index} is out of range for {len} steps")]
    StepOutOfRange { index: usize, len: usize },
    #[error("step {index} cannot resolve before step {pending_index}")]
    OutOfOrder { index: usize, pending_index: usize },
    #[error("step {index} resolved without a duration")]
    MissingDuration { index: usize },
}

/// One execution attempt of a script, observable while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub script_id: String,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub steps: Vec<RunStepState>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl Run {
    /// Creates a running run with one pending entry per action.
    pub fn new(
        id: impl Into<String>,
        script_id: impl Into<String>,
        step_actions: &[String],
    ) -> Self {
        Self {
            id: id.into(),
            script_id: script_id.into(),
            started_at: Utc::now(),
            status: RunStatus::Running,
            steps: step_actions
                .iter()
                .map(|action| RunStepState::pending(action.clone()))
                .collect(),
            logs: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Index of the first step still pending, if any.
    pub fn first_pending_index(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.status == StepStatus::Pending)
    }

    pub fn has_started_steps(&self) -> bool {
        self.steps.iter().any(|step| step.status.is_terminal())
    }

    pub fn has_failed_steps(&self) -> bool {
        self.steps
            .iter()
            .any(|step| step.status == StepStatus::Failed)
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    /// Records the outcome of step `index`, enforcing left-to-right order.
    pub fn resolve_step(
        &mut self,
        index: usize,
        resolved: RunStepState,
    ) -> Result<(), RunStateError> {
        if self.status.is_terminal() {
            return Err(RunStateError::RunNotActive {
                run_id: self.id.clone(),
                status: self.status,
            });
        }
        let len = self.steps.len();
        let Some(current) = self.steps.get(index) else {
            return Err(RunStateError::StepOutOfRange { index, len });
        };
        current.status.ensure_transition(resolved.status)?;
        if resolved.duration_ms.is_none() {
            return Err(RunStateError::MissingDuration { index });
        }
        if let Some(pending_index) = self.first_pending_index() {
            if pending_index < index {
                return Err(RunStateError::OutOfOrder {
                    index,
                    pending_index,
                });
            }
        }

        self.steps[index] = resolved;
        Ok(())
    }

    /// Moves the run into a terminal status.
    pub fn finish(&mut self, status: RunStatus) -> Result<(), RunStateError> {
        if self.status.is_terminal() {
            return Err(RunStateError::RunNotActive {
                run_id: self.id.clone(),
                status: self.status,
            });
        }
        self.status.ensure_transition(status)?;
        self.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        example_script_document, parse_script_document, parse_script_document_lenient, Run,
        RunSettings, RunStateError, RunStatus, RunStepState, ScriptDocumentError, StepAction,
        StepStatus,
    };

    fn actions(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn step_transitions_leave_pending_exactly_once() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Passed));
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Failed));
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Passed.can_transition_to(StepStatus::Pending));
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Passed));
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Pending));
    }

    #[test]
    fn run_transitions_enforce_terminal_states() {
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Failed.ensure_transition(RunStatus::Failed).is_err());
    }

    #[test]
    fn unit_parse_applies_setting_defaults_and_keeps_unknown_actions() {
        let document = parse_script_document(
            r##"{"steps":[{"action":"open","target":"https://example.com"},{"action":"hover","selector":"#menu"}]}"##,
        )
        .expect("parse");

        assert_eq!(document.settings, RunSettings::default());
        assert_eq!(document.steps[0].action, StepAction::Open);
        assert_eq!(
            document.steps[1].action,
            StepAction::Unrecognized("hover".to_string())
        );
        assert_eq!(document.step_actions(), actions(&["open", "hover"]));

        let rendered = serde_json::to_value(&document.steps[1]).expect("serialize");
        assert_eq!(rendered["action"], "hover");
    }

    #[test]
    fn unit_parse_reads_camel_case_fields() {
        let document = parse_script_document(
            r##"{"steps":[{"action":"type","selector":"#u","text":"bob","shouldFail":true}],
                "settings":{"browser":" FireFox ","headless":false,"continueOnError":true}}"##,
        )
        .expect("parse");

        assert!(document.steps[0].should_fail);
        assert_eq!(document.steps[0].text.as_deref(), Some("bob"));
        assert!(!document.settings.headless);
        assert!(document.settings.continue_on_error);
        assert_eq!(document.settings.normalized_browser(), "firefox");
    }

    #[test]
    fn regression_lenient_parse_degrades_to_empty_document() {
        let (document, error) = parse_script_document_lenient("{not json");
        assert!(document.steps.is_empty());
        assert!(matches!(error, Some(ScriptDocumentError::InvalidJson(_))));

        let (document, error) = parse_script_document_lenient(r#"{"steps":"nope"}"#);
        assert!(document.steps.is_empty());
        assert!(matches!(error, Some(ScriptDocumentError::MissingSteps)));

        let (_, error) = parse_script_document_lenient(r#"{"steps":[42]}"#);
        assert!(matches!(error, Some(ScriptDocumentError::InvalidSteps(_))));
    }

    #[test]
    fn regression_malformed_step_fields_do_not_empty_the_script() {
        let document = parse_script_document(
            r##"{"steps":[{"selector":"#x"},{"action":"click","selector":"#a","shouldFail":"yes"},{"action":"open","target":"https://example.com","shouldFail":0}]}"##,
        )
        .expect("parse");

        assert_eq!(document.steps.len(), 3);
        assert_eq!(
            document.steps[0].action,
            StepAction::Unrecognized(String::new())
        );
        assert!(!document.steps[0].action.is_recognized());
        assert!(document.steps[1].should_fail);
        assert!(!document.steps[2].should_fail);
        assert_eq!(document.step_actions(), actions(&["", "click", "open"]));
    }

    #[test]
    fn unit_blank_fields_count_as_missing() {
        let document =
            parse_script_document(r#"{"steps":[{"action":"click","selector":"  "}]}"#)
                .expect("parse");
        assert_eq!(document.steps[0].non_empty_selector(), None);
    }

    #[test]
    fn functional_resolve_step_enforces_left_to_right_order() {
        let mut run = Run::new("run-1", "script-1", &actions(&["open", "click"]));

        let error = run
            .resolve_step(1, RunStepState::passed("click", 5, None))
            .expect_err("step 1 before step 0");
        assert_eq!(
            error,
            RunStateError::OutOfOrder {
                index: 1,
                pending_index: 0
            }
        );

        run.resolve_step(0, RunStepState::passed("open", 5, None))
            .expect("step 0");
        run.resolve_step(1, RunStepState::failed("click", 7, "boom"))
            .expect("step 1");
        assert!(run.has_failed_steps());
        assert_eq!(run.first_pending_index(), None);

        let error = run
            .resolve_step(1, RunStepState::passed("click", 1, None))
            .expect_err("cannot resolve twice");
        assert!(matches!(error, RunStateError::Transition(_)));
    }

    #[test]
    fn regression_resolve_step_requires_duration_and_active_run() {
        let mut run = Run::new("run-1", "script-1", &actions(&["open"]));
        let mut state = RunStepState::passed("open", 1, None);
        state.duration_ms = None;
        assert_eq!(
            run.resolve_step(0, state),
            Err(RunStateError::MissingDuration { index: 0 })
        );

        run.finish(RunStatus::Failed).expect("finish");
        assert!(matches!(
            run.resolve_step(0, RunStepState::passed("open", 1, None)),
            Err(RunStateError::RunNotActive { .. })
        ));
        assert!(run.finish(RunStatus::Completed).is_err());
    }

    #[test]
    fn unit_run_snapshot_serializes_with_camel_case_keys() {
        let mut run = Run::new("run-1", "script-1", &actions(&["open"]));
        run.resolve_step(0, RunStepState::passed("open", 12, Some("data:x".to_string())))
            .expect("resolve");
        let value = serde_json::to_value(&run).expect("serialize");
        assert_eq!(value["scriptId"], "script-1");
        assert_eq!(value["status"], "running");
        assert_eq!(value["steps"][0]["durationMs"], 12);
        assert!(value["steps"][0].get("errorMessage").is_none());
    }

    #[test]
    fn unit_example_script_has_six_steps() {
        let document = example_script_document();
        assert_eq!(document.steps.len(), 6);
        assert_eq!(document.steps[5].action, StepAction::WaitForSelector);
    }
}
