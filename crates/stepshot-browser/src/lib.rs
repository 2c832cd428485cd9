//! Step backends for StepShot runs.
//!
//! A run drives exactly one [`StepBackend`]: either a session on the external
//! Playwright driver ([`PlaywrightCliDriver`]) or the latency-only
//! [`SimulatedBackend`]. [`probe_real_driver`] decides which one is worth
//! trying.

pub mod availability;
pub mod backend;
pub mod playwright_cli;
pub mod simulated;

pub use availability::{probe_real_driver, BackendAvailability};
pub use backend::{
    resolve_step_action, BackendKind, ResolvedAction, StepBackend, StepExecutionError,
    StepOutcome,
};
pub use playwright_cli::{
    BackendInitError, DriverActionRequest, DriverActionResponse, DriverConfig,
    PlaywrightCliDriver, RealDriverHandle, DEFAULT_DRIVER_COMMAND_TIMEOUT_MS,
    DEFAULT_WAIT_FOR_SELECTOR_TIMEOUT_MS, SUPPORTED_BROWSERS,
};
pub use simulated::{
    placeholder_screenshot, SimulatedBackend, SimulatedBackendConfig,
    DEFAULT_SIMULATED_MAX_LATENCY_MS, DEFAULT_SIMULATED_MIN_LATENCY_MS, SIMULATED_FAILURE_MESSAGE,
};
