//! Run execution engine for StepShot scripts.
//!
//! [`RunEngine::start_run`] records a new run and returns its id at once. A
//! detached task then picks a backend and walks the steps strictly in order,
//! writing a whole snapshot to the registry after every step so pollers never
//! see a half-recorded step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use stepshot_browser::{
    probe_real_driver, BackendAvailability, DriverConfig, SimulatedBackend,
    SimulatedBackendConfig, StepBackend,
};
use stepshot_store::{RegistryResult, RunRegistry};
use stepshot_types::{
    parse_script_document_lenient, Run, RunSettings, RunStatus, RunStepState, Script,
    ScriptDocument, Step,
};
use tokio::task::JoinHandle;

/// Engine-wide backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub driver: DriverConfig,
    pub simulated: SimulatedBackendConfig,
}

impl EngineConfig {
    /// Validates driver timeouts and the simulated latency window.
    pub fn validate(&self) -> Result<()> {
        self.driver.validate()?;
        self.simulated.validate()
    }
}

/// Starts runs and exposes their snapshots.
///
/// A run reaches its terminal status before its backend is released, so hosts
/// that exit after a run should call [`RunEngine::join_run`] or
/// [`RunEngine::shutdown`] first.
#[derive(Clone)]
pub struct RunEngine {
    registry: Arc<dyn RunRegistry>,
    config: Arc<EngineConfig>,
    active_tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl RunEngine {
    pub fn new(registry: Arc<dyn RunRegistry>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            config: Arc::new(config),
            active_tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Creates a run for `document` and spawns its execution.
    ///
    /// Returns before any step runs. Must be called from within a tokio
    /// runtime.
    pub fn start_run(&self, script_id: &str, document: ScriptDocument) -> String {
        self.launch(script_id, document, None)
    }

    /// Like [`RunEngine::start_run`], parsing raw script content first.
    ///
    /// Malformed content becomes a zero-step run whose log records the parse
    /// error.
    pub fn start_run_from_content(&self, script_id: &str, content: &str) -> String {
        let (document, diagnostic) = parse_script_document_lenient(content);
        let diagnostic = diagnostic.map(|error| {
            tracing::warn!(script_id, error = %error, "script content is malformed");
            format!("Script content could not be parsed: {error}")
        });
        self.launch(script_id, document, diagnostic)
    }

    pub fn start_script(&self, script: &Script) -> String {
        self.start_run_from_content(&script.id, &script.content)
    }

    pub fn get_run(&self, run_id: &str) -> Option<Run> {
        self.registry.get(run_id)
    }

    /// Waits for the run to finish, returning the latest snapshot on timeout.
    pub async fn wait_for_run(&self, run_id: &str, timeout: Duration) -> RegistryResult<Run> {
        self.registry.wait_for_terminal(run_id, timeout).await
    }

    /// Waits for the run's execution task, backend release included.
    ///
    /// Unknown or already joined runs return at once.
    pub async fn join_run(&self, run_id: &str) -> Result<()> {
        let handle = self.lock_tasks().remove(run_id);
        match handle {
            Some(handle) => handle
                .await
                .with_context(|| format!("execution task for run '{run_id}' did not finish cleanly")),
            None => Ok(()),
        }
    }

    /// Waits for every execution task started by this engine.
    pub async fn shutdown(&self) {
        let handles = self.lock_tasks().drain().collect::<Vec<_>>();
        for (run_id, handle) in handles {
            if let Err(error) = handle.await {
                tracing::warn!(run_id = %run_id, error = %error, "execution task did not finish cleanly");
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.active_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn launch(&self, script_id: &str, document: ScriptDocument, diagnostic: Option<String>) -> String {
        let mut run = self.registry.create(script_id, &document.step_actions());
        if let Some(line) = diagnostic {
            run.push_log(line);
            persist(self.registry.as_ref(), &run);
        }
        let run_id = run.id;
        tracing::info!(run_id = %run_id, script_id, steps = document.steps.len(), "starting run");

        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);
        let task_run_id = run_id.clone();
        let handle = tokio::spawn(async move {
            execute_run(registry.as_ref(), &config, &task_run_id, &document).await;
        });
        let mut tasks = self.lock_tasks();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(run_id.clone(), handle);
        run_id
    }
}

/// Drives one run to a terminal status, choosing the backend itself.
pub async fn execute_run(
    registry: &dyn RunRegistry,
    config: &EngineConfig,
    run_id: &str,
    document: &ScriptDocument,
) {
    let Some(mut run) = prepare_run(registry, run_id, document) else {
        return;
    };
    if document.steps.is_empty() {
        finish_run(registry, &mut run, RunStatus::Completed);
        return;
    }

    let mut backend = select_backend(registry, config, &mut run, &document.settings).await;
    drive_steps(
        registry,
        &mut run,
        &document.steps,
        document.settings.continue_on_error,
        backend.as_mut(),
    )
    .await;
    release_backend(backend.as_mut(), run_id).await;
}

/// Drives one run on a caller-supplied backend, skipping backend selection.
pub async fn execute_run_with_backend(
    registry: &dyn RunRegistry,
    run_id: &str,
    document: &ScriptDocument,
    backend: &mut dyn StepBackend,
) {
    if let Some(mut run) = prepare_run(registry, run_id, document) {
        drive_steps(
            registry,
            &mut run,
            &document.steps,
            document.settings.continue_on_error,
            backend,
        )
        .await;
    }
    release_backend(backend, run_id).await;
}

fn prepare_run(registry: &dyn RunRegistry, run_id: &str, document: &ScriptDocument) -> Option<Run> {
    let Some(run) = registry.get(run_id) else {
        tracing::error!(run_id, "run is missing from the registry; nothing to execute");
        return None;
    };
    if run.is_terminal() {
        tracing::warn!(run_id, status = run.status.as_str(), "run already finished");
        return None;
    }
    if run.steps.len() != document.steps.len() {
        let reason = format!(
            "script has {} steps but run '{}' was created with {}",
            document.steps.len(),
            run.id,
            run.steps.len()
        );
        abort_run(registry, run, &reason);
        return None;
    }
    Some(run)
}

fn abort_run(registry: &dyn RunRegistry, mut run: Run, reason: &str) {
    tracing::error!(run_id = %run.id, reason, "run aborted before execution");
    run.push_log(format!("Runner error: {reason}"));
    finish_run(registry, &mut run, RunStatus::Failed);
}

async fn select_backend(
    registry: &dyn RunRegistry,
    config: &EngineConfig,
    run: &mut Run,
    settings: &RunSettings,
) -> Box<dyn StepBackend> {
    debug_assert!(
        !run.has_started_steps(),
        "backend selection must happen before any step leaves pending"
    );

    match probe_real_driver(&config.driver) {
        BackendAvailability::Unavailable(reason) => {
            tracing::info!(run_id = %run.id, reason = %reason, "using simulated backend");
        }
        BackendAvailability::Available(handle) => match handle.establish_session(settings).await {
            Ok(driver) => {
                tracing::info!(
                    run_id = %run.id,
                    backend = driver.kind().as_str(),
                    driver = %handle.cli_path().display(),
                    "using real driver"
                );
                return Box::new(driver);
            }
            Err(error) => {
                tracing::warn!(
                    run_id = %run.id,
                    error = %error,
                    "real driver failed to initialize; falling back to simulated backend"
                );
                run.push_log(format!("Real driver failed to initialize: {error}"));
                persist(registry, run);
            }
        },
    }
    Box::new(SimulatedBackend::new(config.simulated.clone()))
}

async fn drive_steps(
    registry: &dyn RunRegistry,
    run: &mut Run,
    steps: &[Step],
    continue_on_error: bool,
    backend: &mut dyn StepBackend,
) {
    let backend_kind = backend.kind().as_str();
    for (index, step) in steps.iter().enumerate() {
        let number = index + 1;
        let action = step.action.as_str().to_string();
        let started = Instant::now();

        if !step.action.is_recognized() {
            tracing::warn!(run_id = %run.id, step = number, action = %action, "unknown action; skipping");
            run.push_log(format!("Step {number}: Unknown action \"{action}\" - skipping"));
            if !record_step(registry, run, index, RunStepState::skipped(&action, elapsed_ms(started))) {
                return;
            }
            continue;
        }

        tracing::debug!(run_id = %run.id, step = number, action = %action, backend = backend_kind, "executing step");
        let result = backend.execute_step(index, step).await;
        let duration_ms = elapsed_ms(started);

        match result {
            Ok(outcome) => {
                run.push_log(format!("Step {number} ({action}) -> passed"));
                let state = RunStepState::passed(&action, duration_ms, outcome.screenshot);
                if !record_step(registry, run, index, state) {
                    return;
                }
            }
            Err(error) => {
                tracing::info!(
                    run_id = %run.id,
                    step = number,
                    action = %action,
                    error_kind = error.kind(),
                    error = %error,
                    "step failed"
                );
                run.push_log(format!("Step {number} ({action}) -> failed: {error}"));
                let state = RunStepState::failed(&action, duration_ms, error.to_string());
                if !record_step(registry, run, index, state) {
                    return;
                }
                if !continue_on_error {
                    finish_run(registry, run, RunStatus::Failed);
                    return;
                }
            }
        }
    }

    let status = if run.has_failed_steps() {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    finish_run(registry, run, status);
}

fn record_step(registry: &dyn RunRegistry, run: &mut Run, index: usize, state: RunStepState) -> bool {
    if let Err(error) = run.resolve_step(index, state) {
        tracing::error!(run_id = %run.id, step = index + 1, error = %error, "step result rejected");
        return false;
    }
    persist(registry, run)
}

fn finish_run(registry: &dyn RunRegistry, run: &mut Run, status: RunStatus) {
    if let Err(error) = run.finish(status) {
        tracing::error!(run_id = %run.id, error = %error, "run could not be finished");
        return;
    }
    tracing::info!(run_id = %run.id, status = status.as_str(), "run finished");
    persist(registry, run);
}

fn persist(registry: &dyn RunRegistry, run: &Run) -> bool {
    match registry.put(run.clone()) {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(run_id = %run.id, error = %error, "failed to persist run snapshot");
            false
        }
    }
}

async fn release_backend(backend: &mut dyn StepBackend, run_id: &str) {
    if let Err(error) = backend.release().await {
        let detail = format!("{error:#}");
        tracing::warn!(
            run_id,
            backend = backend.kind().as_str(),
            error = %detail,
            "failed to release backend session"
        );
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
