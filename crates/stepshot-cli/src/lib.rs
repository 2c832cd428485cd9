//! Command-line host for the StepShot run engine.
//!
//! Exposes the clap argument model plus the `run`, `validate` and `example`
//! command implementations used by the `stepshot` binary.

pub mod bootstrap_helpers;
pub mod cli_args;
pub mod commands;

pub use bootstrap_helpers::init_tracing;
pub use cli_args::{
    Cli, CliCommand, CliReportFormat, DriverArgs, RunArgs, ScriptArgs, SimulationArgs,
};
pub use commands::{
    execute_cli, exit_code_for, progress_lines, run_script_command, validate_script_command,
    RunCommandOutcome, ScriptValidationReport,
};
