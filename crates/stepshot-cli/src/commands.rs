use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use stepshot_browser::resolve_step_action;
use stepshot_report::render_run_report;
use stepshot_runner::RunEngine;
use stepshot_store::{InMemoryRunRegistry, InMemoryScriptCatalog, RunRegistry};
use stepshot_types::{
    example_script_document, parse_script_document, Run, RunStatus, StepStatus,
};

use crate::cli_args::{Cli, CliCommand, RunArgs, ScriptArgs};

/// Finished run plus its rendered report.
#[derive(Debug, Clone)]
pub struct RunCommandOutcome {
    pub run: Run,
    pub report: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptValidationReport {
    pub step_count: usize,
    pub browser: String,
    pub headless: bool,
    pub continue_on_error: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ScriptValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn render(&self) -> String {
        let mut lines = vec![format!(
            "steps={} browser={} headless={} continueOnError={}",
            self.step_count, self.browser, self.headless, self.continue_on_error
        )];
        lines.extend(self.errors.iter().map(|error| format!("error: {error}")));
        lines.extend(self.warnings.iter().map(|warning| format!("warning: {warning}")));
        lines.join("\n")
    }
}

pub async fn execute_cli(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        CliCommand::Run(args) => {
            let outcome = run_script_command(&args).await?;
            if args.output.is_none() {
                println!("{}", outcome.report);
            }
            Ok(exit_code_for(&outcome.run))
        }
        CliCommand::Validate(args) => {
            let report = validate_script_command(&args)?;
            println!("{}", report.render());
            Ok(if report.is_valid() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        CliCommand::Example => {
            let rendered = serde_json::to_string_pretty(&example_script_document())
                .context("failed to render example script")?;
            println!("{rendered}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

pub fn exit_code_for(run: &Run) -> ExitCode {
    if run.status == RunStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Loads the script, runs it to completion and renders the report.
pub async fn run_script_command(args: &RunArgs) -> Result<RunCommandOutcome> {
    let content = read_script(&args.script.script)?;
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| script_name_from_path(&args.script.script));

    let catalog = InMemoryScriptCatalog::new();
    let script = catalog
        .create(&name, &content)
        .with_context(|| format!("invalid script '{}'", args.script.script.display()))?;
    let (mut document, _) = script.document();
    args.apply_setting_overrides(&mut document.settings);

    let registry: Arc<dyn RunRegistry> = Arc::new(InMemoryRunRegistry::new());
    let engine = RunEngine::new(registry, args.engine_config())
        .context("invalid engine configuration")?;
    let run_id = engine.start_run(&script.id, document);
    tracing::info!(run_id = %run_id, script_id = %script.id, "run submitted");
    eprintln!("[stepshot] run {run_id} started for script '{}'", script.name);

    let run = poll_until_finished(
        &engine,
        &run_id,
        Duration::from_millis(args.poll_interval_ms),
        Duration::from_millis(args.run_timeout_ms),
    )
    .await?;
    // The backend is released after the terminal snapshot lands.
    engine
        .join_run(&run_id)
        .await
        .context("run execution did not shut down cleanly")?;
    eprintln!(
        "[stepshot] run {run_id} finished: {}",
        run.status.as_str()
    );

    let report = render_run_report(&run, args.format.into())?;
    if let Some(output) = args.output.as_ref() {
        if let Some(parent) = output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create report directory '{}'", parent.display())
            })?;
        }
        std::fs::write(output, &report)
            .with_context(|| format!("failed to write report '{}'", output.display()))?;
        eprintln!("[stepshot] report written to {}", output.display());
    }
    Ok(RunCommandOutcome { run, report })
}

async fn poll_until_finished(
    engine: &RunEngine,
    run_id: &str,
    poll_interval: Duration,
    run_timeout: Duration,
) -> Result<Run> {
    let deadline = tokio::time::Instant::now() + run_timeout;
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seen: Option<Run> = None;

    loop {
        ticker.tick().await;
        let Some(run) = engine.get_run(run_id) else {
            bail!("run '{run_id}' disappeared from the registry");
        };
        for line in progress_lines(last_seen.as_ref(), &run) {
            eprintln!("[stepshot] {line}");
        }
        if run.is_terminal() {
            return Ok(run);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "run '{run_id}' did not finish within {}ms",
                run_timeout.as_millis()
            );
        }
        last_seen = Some(run);
    }
}

/// One line per step that left `pending` since `previous`, plus new log lines
/// that are not step results.
pub fn progress_lines(previous: Option<&Run>, current: &Run) -> Vec<String> {
    let mut lines = Vec::new();
    let seen_logs = previous.map(|run| run.logs.len()).unwrap_or_default();
    lines.extend(
        current
            .logs
            .iter()
            .skip(seen_logs)
            .filter(|line| !line.starts_with("Step "))
            .cloned(),
    );

    let total = current.steps.len();
    for (index, step) in current.steps.iter().enumerate() {
        let was_pending = previous
            .and_then(|run| run.steps.get(index))
            .map_or(true, |before| before.status == StepStatus::Pending);
        if step.status == StepStatus::Pending || !was_pending {
            continue;
        }
        let mut line = format!(
            "step {}/{} {} -> {} ({} ms)",
            index + 1,
            total,
            step.action,
            step.status.as_str(),
            step.duration_ms.unwrap_or_default()
        );
        if let Some(message) = step.error_message.as_deref() {
            line.push_str(&format!(": {message}"));
        }
        lines.push(line);
    }
    lines
}

/// Strict parse plus per-step field checks, without running anything.
pub fn validate_script_command(args: &ScriptArgs) -> Result<ScriptValidationReport> {
    let content = read_script(&args.script)?;
    let document = parse_script_document(&content)
        .with_context(|| format!("invalid script '{}'", args.script.display()))?;

    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    for (index, step) in document.steps.iter().enumerate() {
        if !step.action.is_recognized() {
            warnings.push(format!(
                "step {}: unknown action \"{}\" will be skipped",
                index + 1,
                step.action
            ));
            continue;
        }
        if let Err(error) = resolve_step_action(step) {
            errors.push(format!("step {}: {error}", index + 1));
        }
    }

    Ok(ScriptValidationReport {
        step_count: document.steps.len(),
        browser: document.settings.normalized_browser(),
        headless: document.settings.headless,
        continue_on_error: document.settings.continue_on_error,
        errors,
        warnings,
    })
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script '{}'", path.display()))
}

fn script_name_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.trim().is_empty())
        .unwrap_or("script")
        .to_string()
}
