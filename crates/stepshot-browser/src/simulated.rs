use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::backend::{
    resolve_step_action, BackendKind, StepBackend, StepExecutionError, StepOutcome,
};
use stepshot_types::Step;

pub const SIMULATED_FAILURE_MESSAGE: &str = "Simulated failure for MVP";
pub const DEFAULT_SIMULATED_MIN_LATENCY_MS: u64 = 350;
pub const DEFAULT_SIMULATED_MAX_LATENCY_MS: u64 = 1_250;

/// Latency window and seed for the simulated backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedBackendConfig {
    /// Inclusive lower bound of the per-step delay.
    pub min_latency_ms: u64,
    /// Exclusive upper bound of the per-step delay.
    pub max_latency_ms: u64,
    /// Fixed PRNG seed; `None` seeds from the clock.
    pub seed: Option<u64>,
}

impl Default for SimulatedBackendConfig {
    fn default() -> Self {
        Self {
            min_latency_ms: DEFAULT_SIMULATED_MIN_LATENCY_MS,
            max_latency_ms: DEFAULT_SIMULATED_MAX_LATENCY_MS,
            seed: None,
        }
    }
}

impl SimulatedBackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_latency_ms <= self.min_latency_ms {
            bail!(
                "simulated max_latency_ms ({}) must be greater than min_latency_ms ({})",
                self.max_latency_ms,
                self.min_latency_ms
            );
        }
        Ok(())
    }
}

/// Deterministic stand-in for a browser: sleeps, then passes unless the step
/// asks to fail.
#[derive(Debug)]
pub struct SimulatedBackend {
    config: SimulatedBackendConfig,
    rng_state: u64,
}

impl SimulatedBackend {
    pub fn new(config: SimulatedBackendConfig) -> Self {
        let rng_state = config.seed.unwrap_or_else(clock_seed);
        Self { config, rng_state }
    }

    /// Next delay in `[min_latency_ms, max_latency_ms)`.
    pub fn next_latency(&mut self) -> Duration {
        let span = self
            .config
            .max_latency_ms
            .saturating_sub(self.config.min_latency_ms)
            .max(1);
        let offset = splitmix64(&mut self.rng_state) % span;
        Duration::from_millis(self.config.min_latency_ms.saturating_add(offset))
    }
}

#[async_trait]
impl StepBackend for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    async fn execute_step(
        &mut self,
        index: usize,
        step: &Step,
    ) -> Result<StepOutcome, StepExecutionError> {
        let action = resolve_step_action(step)?;
        let latency = self.next_latency();
        tracing::debug!(
            step = index + 1,
            action = action.name(),
            latency_ms = latency.as_millis() as u64,
            "simulating step"
        );
        tokio::time::sleep(latency).await;

        if step.should_fail {
            return Err(StepExecutionError::Execution(
                SIMULATED_FAILURE_MESSAGE.to_string(),
            ));
        }
        Ok(StepOutcome {
            screenshot: Some(placeholder_screenshot(index + 1, step.action.as_str())),
        })
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// SVG placeholder naming the 1-based step number and action, as a data URI.
pub fn placeholder_screenshot(step_number: usize, action: &str) -> String {
    let svg = format!(
        concat!(
            "<svg width=\"320\" height=\"180\" xmlns=\"http://www.w3.org/2000/svg\">",
            "<rect width=\"320\" height=\"180\" fill=\"#f3f4f6\"/>",
            "<text x=\"160\" y=\"80\" font-family=\"Arial\" font-size=\"16\" fill=\"#6b7280\" text-anchor=\"middle\">Simulated Screenshot</text>",
            "<text x=\"160\" y=\"105\" font-family=\"Arial\" font-size=\"14\" fill=\"#9ca3af\" text-anchor=\"middle\">Step {}: {}</text>",
            "</svg>"
        ),
        step_number,
        escape_xml(action)
    );
    format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg))
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn clock_seed() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    now_ns ^ COUNTER.fetch_add(1, Ordering::Relaxed).rotate_left(32)
}
