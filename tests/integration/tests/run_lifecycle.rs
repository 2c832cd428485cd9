use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stepshot_browser::{DriverConfig, SimulatedBackendConfig, SIMULATED_FAILURE_MESSAGE};
use stepshot_report::{render_run_report, ReportFormat, RunReportSummary};
use stepshot_runner::{EngineConfig, RunEngine};
use stepshot_store::{InMemoryRunRegistry, InMemoryScriptCatalog, RunRegistry};
use stepshot_types::{Run, RunSettings, RunStatus, ScriptDocument, Step, StepAction, StepStatus};

fn simulated_engine(min_latency_ms: u64, max_latency_ms: u64) -> (RunEngine, Arc<InMemoryRunRegistry>) {
    let registry = Arc::new(InMemoryRunRegistry::new());
    let shared: Arc<dyn RunRegistry> = registry.clone();
    let engine = RunEngine::new(
        shared,
        EngineConfig {
            driver: DriverConfig {
                playwright_cli: Some(PathBuf::from("/nonexistent/stepshot-playwright-driver")),
                ..DriverConfig::default()
            },
            simulated: SimulatedBackendConfig {
                min_latency_ms,
                max_latency_ms,
                seed: Some(2024),
            },
        },
    )
    .expect("engine");
    (engine, registry)
}

fn script(steps: Vec<Step>, continue_on_error: bool) -> ScriptDocument {
    ScriptDocument::new(
        steps,
        RunSettings {
            continue_on_error,
            ..RunSettings::default()
        },
    )
}

async fn finish(engine: &RunEngine, run_id: &str) -> Run {
    let run = engine
        .wait_for_run(run_id, Duration::from_secs(15))
        .await
        .expect("run exists");
    assert!(run.is_terminal(), "run {run_id} did not finish: {run:?}");
    run
}

fn assert_monotonic(previous: &Run, current: &Run) {
    assert_eq!(previous.id, current.id);
    assert_eq!(previous.steps.len(), current.steps.len());
    assert!(current.logs.starts_with(&previous.logs));
    for (before, after) in previous.steps.iter().zip(&current.steps) {
        if before.status != StepStatus::Pending {
            assert_eq!(before, after, "resolved step changed");
        }
    }
    if previous.is_terminal() {
        assert_eq!(previous, current);
    }
}

fn assert_left_to_right(run: &Run) {
    if let Some(first_pending) = run.first_pending_index() {
        assert!(run.steps[first_pending..]
            .iter()
            .all(|step| step.status == StepStatus::Pending));
    }
    for step in &run.steps {
        assert_eq!(step.status == StepStatus::Pending, step.duration_ms.is_none());
        assert_eq!(step.status == StepStatus::Failed, step.error_message.is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn integration_polling_observes_whole_monotonic_snapshots() {
    let (engine, _registry) = simulated_engine(5, 15);
    let run_id = engine.start_run(
        "script-poll",
        script(
            vec![
                Step::new(StepAction::Open).with_target("https://example.com"),
                Step::new(StepAction::Click).with_selector("#a"),
                Step::new(StepAction::Type).with_selector("#b").with_text("x").failing(),
                Step::new(StepAction::WaitForSelector).with_selector("#c"),
                Step::new(StepAction::Click).with_selector("#d"),
            ],
            true,
        ),
    );

    let mut previous = engine.get_run(&run_id).expect("created");
    assert_eq!(previous.status, RunStatus::Running);
    let mut observed = 1usize;
    while !previous.is_terminal() {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let current = engine.get_run(&run_id).expect("still present");
        assert_monotonic(&previous, &current);
        assert_left_to_right(&current);
        previous = current;
        observed += 1;
    }

    assert!(observed > 2);
    assert_eq!(previous.status, RunStatus::Failed);
    assert_eq!(
        previous
            .steps
            .iter()
            .map(|step| step.status)
            .collect::<Vec<_>>(),
        vec![
            StepStatus::Passed,
            StepStatus::Passed,
            StepStatus::Failed,
            StepStatus::Passed,
            StepStatus::Passed,
        ]
    );
    assert_eq!(
        previous.steps[2].error_message.as_deref(),
        Some(SIMULATED_FAILURE_MESSAGE)
    );
    assert_eq!(engine.get_run(&run_id), Some(previous.clone()));
    assert_eq!(engine.get_run(&run_id), Some(previous));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_concurrent_runs_are_isolated() {
    let (engine, registry) = simulated_engine(1, 10);
    let mut run_ids = Vec::new();
    for index in 0..8 {
        let should_fail = index % 2 == 1;
        let mut failing = Step::new(StepAction::Click).with_selector("#x");
        if should_fail {
            failing = failing.failing();
        }
        run_ids.push(engine.start_run(
            &format!("script-{index}"),
            script(
                vec![
                    Step::new(StepAction::Open).with_target("https://example.com"),
                    failing,
                    Step::new(StepAction::Click).with_selector("#y"),
                ],
                false,
            ),
        ));
    }

    let unique: HashSet<&String> = run_ids.iter().collect();
    assert_eq!(unique.len(), run_ids.len());

    for (index, run_id) in run_ids.iter().enumerate() {
        let run = finish(&engine, run_id).await;
        assert_eq!(run.script_id, format!("script-{index}"));
        assert_left_to_right(&run);
        if index % 2 == 1 {
            assert_eq!(run.status, RunStatus::Failed);
            assert_eq!(run.steps[2].status, StepStatus::Pending);
        } else {
            assert_eq!(run.status, RunStatus::Completed);
        }
    }
    assert_eq!(registry.len(), run_ids.len());
    assert_eq!(registry.list().len(), run_ids.len());
}

#[tokio::test]
async fn functional_catalog_example_runs_end_to_end_and_reports() {
    let (engine, _registry) = simulated_engine(1, 3);
    let catalog = InMemoryScriptCatalog::new();
    let example = catalog.seed_example().expect("seed").expect("seeded");

    let run_id = engine.start_script(&example);
    let run = finish(&engine, &run_id).await;

    assert_eq!(run.script_id, example.id);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.steps.len(), 6);
    assert_eq!(run.logs.len(), 6);

    let summary = RunReportSummary::from_run(&run);
    assert_eq!(summary.passed, 6);
    assert_eq!(summary.pending, 0);

    let html = render_run_report(&run, ReportFormat::Html).expect("html");
    assert_eq!(html.matches("<img src=\"data:image/svg+xml;base64,").count(), 6);
    let json = render_run_report(&run, ReportFormat::Json).expect("json");
    assert!(json.contains(&run.id));
}

#[tokio::test]
async fn regression_halted_run_leaves_tail_pending_and_does_not_reopen() {
    let (engine, registry) = simulated_engine(1, 3);
    let run_id = engine.start_run(
        "script-halt",
        script(
            vec![
                Step::new(StepAction::Type).with_selector("#u").failing(),
                Step::new(StepAction::Click).with_selector("#login"),
                Step::new(StepAction::WaitForSelector).with_selector("#home"),
            ],
            false,
        ),
    );
    let run = finish(&engine, &run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.first_pending_index(), Some(1));
    assert_eq!(run.logs.len(), 1);

    let mut reopened = run.clone();
    reopened.status = RunStatus::Running;
    assert!(registry.put(reopened).is_err());
    assert_eq!(engine.get_run(&run_id), Some(run));
}

#[tokio::test]
async fn functional_unrecognized_and_empty_scripts() {
    let (engine, _registry) = simulated_engine(1, 3);

    let skipped = finish(
        &engine,
        &engine.start_run_from_content(
            "script-hover",
            r##"{"steps":[{"action":"hover","selector":"#m"},{"action":"click","selector":"#a"}]}"##,
        ),
    )
    .await;
    assert_eq!(skipped.status, RunStatus::Completed);
    assert_eq!(skipped.steps[0].status, StepStatus::Skipped);
    assert_eq!(skipped.steps[1].status, StepStatus::Passed);

    let empty = finish(&engine, &engine.start_run_from_content("script-empty", r#"{"steps":[]}"#)).await;
    assert_eq!(empty.status, RunStatus::Completed);
    assert!(empty.steps.is_empty());
    assert!(empty.logs.is_empty());
}
