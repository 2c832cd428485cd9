//! Run reports rendered from registry snapshots.
//!
//! Rendering is read-only: a report is a pure function of one [`Run`] value.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use stepshot_types::{Run, RunStepState, StepStatus};

const CELL_STYLE: &str = "border:1px solid #ddd;padding:8px;";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Json,
    Html,
}

impl ReportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Html => "html",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportFormat {
    type Err = ReportError;

    /// Blank input selects JSON.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "json" => Ok(Self::Json),
            "html" => Ok(Self::Html),
            other => Err(ReportError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("unknown report format '{0}' (expected json or html)")]
    UnknownFormat(String),
    #[error("failed to serialize run report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Per-status step counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub total_duration_ms: u64,
}

impl RunReportSummary {
    pub fn from_run(run: &Run) -> Self {
        let mut summary = Self {
            total: run.steps.len(),
            ..Self::default()
        };
        for step in &run.steps {
            match step.status {
                StepStatus::Passed => summary.passed += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
                StepStatus::Pending => summary.pending += 1,
            }
            summary.total_duration_ms = summary
                .total_duration_ms
                .saturating_add(step.duration_ms.unwrap_or_default());
        }
        summary
    }
}

pub fn render_run_report(run: &Run, format: ReportFormat) -> Result<String, ReportError> {
    match format {
        ReportFormat::Json => Ok(serde_json::to_string_pretty(run)?),
        ReportFormat::Html => Ok(render_html_report(run)),
    }
}

/// Standalone HTML page with run metadata and a step table.
pub fn render_html_report(run: &Run) -> String {
    let summary = RunReportSummary::from_run(run);
    let mut lines = vec![
        "<!DOCTYPE html>".to_string(),
        "<html>".to_string(),
        "<head><meta charset=\"utf-8\"/><title>StepShot Report</title></head>".to_string(),
        "<body>".to_string(),
        "<h1>StepShot Report</h1>".to_string(),
        format!("<p>Run ID: {}</p>", escape_html(&run.id)),
        format!("<p>Script: {}</p>", escape_html(&run.script_id)),
        format!(
            "<p>Started: {}</p>",
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        "<h2>Summary</h2>".to_string(),
        format!("<p>Status: {}</p>", run.status.as_str()),
        format!(
            "<p>Steps: {} total, {} passed, {} failed, {} skipped, {} pending ({} ms)</p>",
            summary.total,
            summary.passed,
            summary.failed,
            summary.skipped,
            summary.pending,
            summary.total_duration_ms
        ),
        "<h2>Steps</h2>".to_string(),
        "<table style=\"border-collapse:collapse;width:100%;\">".to_string(),
        "<thead><tr>".to_string(),
    ];
    for heading in ["#", "Action", "Status", "Duration", "Error", "Artifact"] {
        lines.push(format!("<th style=\"{CELL_STYLE}\">{heading}</th>"));
    }
    lines.push("</tr></thead>".to_string());
    lines.push("<tbody>".to_string());
    for (index, step) in run.steps.iter().enumerate() {
        lines.push(render_step_row(index + 1, step));
    }
    lines.push("</tbody>".to_string());
    lines.push("</table>".to_string());

    if !run.logs.is_empty() {
        lines.push("<h2>Logs</h2>".to_string());
        lines.push("<pre>".to_string());
        for line in &run.logs {
            lines.push(escape_html(line));
        }
        lines.push("</pre>".to_string());
    }
    lines.push("</body>".to_string());
    lines.push("</html>".to_string());
    lines.join("\n")
}

fn render_step_row(number: usize, step: &RunStepState) -> String {
    let duration = step
        .duration_ms
        .map(|ms| format!("{ms} ms"))
        .unwrap_or_default();
    let error = step
        .error_message
        .as_deref()
        .map(|message| format!("<span style=\"color:#a00\">{}</span>", escape_html(message)))
        .unwrap_or_default();
    let artifact = step
        .screenshot
        .as_deref()
        .filter(|uri| uri.starts_with("data:image/"))
        .map(|uri| {
            format!(
                "<img src=\"{}\" width=\"160\" height=\"90\" alt=\"step {number}\"/>",
                escape_html(uri)
            )
        })
        .unwrap_or_default();

    let cells = [
        number.to_string(),
        escape_html(&step.action),
        step.status.as_str().to_string(),
        duration,
        error,
        artifact,
    ];
    let cells = cells
        .iter()
        .map(|cell| format!("<td style=\"{CELL_STYLE}\">{cell}</td>"))
        .collect::<String>();
    format!("<tr>{cells}</tr>")
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
