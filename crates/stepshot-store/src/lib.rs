//! Run registry abstractions and in-memory backends.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

mod script_catalog;

pub use script_catalog::{InMemoryScriptCatalog, ScriptCatalogError};
pub use stepshot_types::{Run, RunStatus, RunStepState, Script, StepStatus};

/// Result type for run registry operations.
pub type RegistryResult<T> = Result<T, RunRegistryError>;

/// Errors returned by registry implementations.
#[derive(Debug, Error)]
pub enum RunRegistryError {
    #[error("run '{0}' not found")]
    RunNotFound(String),
    #[error("run '{run_id}' is already {status:?} and cannot be replaced")]
    RunAlreadyTerminal { run_id: String, status: RunStatus },
    #[error("run '{run_id}' snapshot has {actual} steps (expected {expected})")]
    StepCountMismatch {
        run_id: String,
        expected: usize,
        actual: usize,
    },
    #[error("run '{run_id}' snapshot would rewrite resolved step {index}")]
    StepRewritten { run_id: String, index: usize },
}

/// Lifecycle store for runs, shared between the engine and readers.
///
/// Every operation is individually atomic and exchanges whole snapshots.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Allocates a running run with one pending step per action.
    fn create(&self, script_id: &str, step_actions: &[String]) -> Run;
    fn get(&self, run_id: &str) -> Option<Run>;
    /// Replaces the stored snapshot for `run.id`.
    fn put(&self, run: Run) -> RegistryResult<()>;
    fn list(&self) -> Vec<Run>;
    /// Waits until the run is terminal or `timeout` elapses, returning the
    /// latest snapshot either way.
    async fn wait_for_terminal(&self, run_id: &str, timeout: Duration) -> RegistryResult<Run>;
}

/// Process-lifetime registry backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryRunRegistry {
    runs: RwLock<HashMap<String, Run>>,
    id_counter: AtomicU64,
    notify: Notify,
}

impl InMemoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_run_id(&self) -> String {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0);
        let suffix = self.id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("run-{now_ms}-{suffix:04}")
    }
}

#[async_trait]
impl RunRegistry for InMemoryRunRegistry {
    fn create(&self, script_id: &str, step_actions: &[String]) -> Run {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let mut run_id = self.next_run_id();
        while runs.contains_key(&run_id) {
            run_id = self.next_run_id();
        }

        let run = Run::new(run_id.clone(), script_id, step_actions);
        runs.insert(run_id.clone(), run.clone());
        let size = runs.len();
        drop(runs);

        tracing::debug!(run_id = %run_id, script_id, steps = step_actions.len(), size, "created run");
        self.notify.notify_waiters();
        run
    }

    fn get(&self, run_id: &str) -> Option<Run> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        runs.get(run_id).cloned()
    }

    fn put(&self, run: Run) -> RegistryResult<()> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let stored = runs
            .get(&run.id)
            .ok_or_else(|| RunRegistryError::RunNotFound(run.id.clone()))?;

        if stored.status.is_terminal() {
            return Err(RunRegistryError::RunAlreadyTerminal {
                run_id: run.id.clone(),
                status: stored.status,
            });
        }
        if stored.steps.len() != run.steps.len() {
            return Err(RunRegistryError::StepCountMismatch {
                run_id: run.id.clone(),
                expected: stored.steps.len(),
                actual: run.steps.len(),
            });
        }
        if let Some(index) = stored
            .steps
            .iter()
            .zip(&run.steps)
            .position(|(before, after)| before.status.is_terminal() && before != after)
        {
            return Err(RunRegistryError::StepRewritten {
                run_id: run.id.clone(),
                index,
            });
        }

        runs.insert(run.id.clone(), run);
        drop(runs);
        self.notify.notify_waiters();
        Ok(())
    }

    fn list(&self) -> Vec<Run> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        let mut rows: Vec<Run> = runs.values().cloned().collect();
        rows.sort_by(|left, right| {
            left.started_at
                .cmp(&right.started_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        rows
    }

    async fn wait_for_terminal(&self, run_id: &str, timeout: Duration) -> RegistryResult<Run> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let run = self
                .get(run_id)
                .ok_or_else(|| RunRegistryError::RunNotFound(run_id.to_string()))?;
            if run.is_terminal() {
                return Ok(run);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(run);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self
                    .get(run_id)
                    .ok_or_else(|| RunRegistryError::RunNotFound(run_id.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryRunRegistry, RunRegistry, RunRegistryError};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use stepshot_types::{RunStatus, RunStepState, StepStatus};

    fn actions(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn creates_running_runs_with_pending_steps() {
        let registry = InMemoryRunRegistry::new();
        let run = registry.create("script-1", &actions(&["open", "click"]));

        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.script_id, "script-1");
        assert_eq!(run.steps.len(), 2);
        assert!(run
            .steps
            .iter()
            .all(|step| step.status == StepStatus::Pending && step.duration_ms.is_none()));
        assert_eq!(registry.get(&run.id), Some(run));
    }

    #[test]
    fn unit_run_ids_are_unique() {
        let registry = InMemoryRunRegistry::new();
        let ids: HashSet<String> = (0..200)
            .map(|_| registry.create("script-1", &[]).id)
            .collect();
        assert_eq!(ids.len(), 200);
        assert_eq!(registry.len(), 200);
    }

    #[test]
    fn put_replaces_whole_snapshot() {
        let registry = InMemoryRunRegistry::new();
        let mut run = registry.create("script-1", &actions(&["open"]));
        run.resolve_step(0, RunStepState::passed("open", 10, None))
            .expect("resolve");
        run.push_log("Step 1 (open) -> passed");
        registry.put(run.clone()).expect("put");

        let stored = registry.get(&run.id).expect("stored");
        assert_eq!(stored, run);
        assert_eq!(stored.steps[0].status, StepStatus::Passed);
    }

    #[test]
    fn regression_put_rejects_unknown_terminal_and_resized_snapshots() {
        let registry = InMemoryRunRegistry::new();
        let mut stray = registry.create("script-1", &actions(&["open"]));
        stray.id = "run-missing".to_string();
        assert!(matches!(
            registry.put(stray),
            Err(RunRegistryError::RunNotFound(_))
        ));

        let mut resized = registry.create("script-1", &actions(&["open"]));
        resized.steps.push(RunStepState::pending("click"));
        assert!(matches!(
            registry.put(resized),
            Err(RunRegistryError::StepCountMismatch { .. })
        ));

        let mut finished = registry.create("script-1", &[]);
        finished.finish(RunStatus::Completed).expect("finish");
        registry.put(finished.clone()).expect("first terminal put");
        assert!(matches!(
            registry.put(finished),
            Err(RunRegistryError::RunAlreadyTerminal { .. })
        ));
    }

    #[test]
    fn regression_put_rejects_rewriting_resolved_steps() {
        let registry = InMemoryRunRegistry::new();
        let mut run = registry.create("script-1", &actions(&["open"]));
        run.resolve_step(0, RunStepState::failed("open", 3, "boom"))
            .expect("resolve");
        registry.put(run.clone()).expect("put");

        run.steps[0] = RunStepState::passed("open", 3, None);
        assert!(matches!(
            registry.put(run),
            Err(RunRegistryError::StepRewritten { index: 0, .. })
        ));
    }

    #[test]
    fn list_orders_runs_by_start_time() {
        let registry = InMemoryRunRegistry::new();
        let first = registry.create("script-a", &[]);
        let second = registry.create("script-b", &[]);
        let ids: Vec<String> = registry.list().into_iter().map(|run| run.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn wait_for_terminal_wakes_after_put() {
        let registry = Arc::new(InMemoryRunRegistry::new());
        let run = registry.create("script-1", &[]);
        let waiting = {
            let registry = registry.clone();
            let run_id = run.id.clone();
            tokio::spawn(async move {
                registry
                    .wait_for_terminal(&run_id, Duration::from_secs(2))
                    .await
                    .expect("wait")
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut finished = run.clone();
        finished.finish(RunStatus::Completed).expect("finish");
        registry.put(finished).expect("put");

        let observed = waiting.await.expect("join");
        assert_eq!(observed.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn wait_for_terminal_returns_latest_snapshot_on_timeout() {
        let registry = InMemoryRunRegistry::new();
        let run = registry.create("script-1", &actions(&["open"]));
        let observed = registry
            .wait_for_terminal(&run.id, Duration::from_millis(20))
            .await
            .expect("wait");
        assert_eq!(observed.status, RunStatus::Running);

        assert!(matches!(
            registry
                .wait_for_terminal("run-unknown", Duration::from_millis(5))
                .await,
            Err(RunRegistryError::RunNotFound(_))
        ));
    }
}
