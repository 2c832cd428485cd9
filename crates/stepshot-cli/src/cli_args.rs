use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use stepshot_browser::{
    DriverConfig, SimulatedBackendConfig, DEFAULT_DRIVER_COMMAND_TIMEOUT_MS,
    DEFAULT_SIMULATED_MAX_LATENCY_MS, DEFAULT_SIMULATED_MIN_LATENCY_MS,
    DEFAULT_WAIT_FOR_SELECTOR_TIMEOUT_MS,
};
use stepshot_report::ReportFormat;
use stepshot_runner::EngineConfig;
use stepshot_types::RunSettings;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "stepshot",
    about = "Run browser automation scripts and record a step-by-step trace",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Execute a script and write its run report
    Run(RunArgs),
    /// Parse a script strictly and list step problems
    Validate(ScriptArgs),
    /// Print the example login script
    Example,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliReportFormat {
    Json,
    Html,
}

impl From<CliReportFormat> for ReportFormat {
    fn from(value: CliReportFormat) -> Self {
        match value {
            CliReportFormat::Json => ReportFormat::Json,
            CliReportFormat::Html => ReportFormat::Html,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ScriptArgs {
    #[arg(long, help = "Path to a script JSON file with a steps array")]
    pub script: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub script: ScriptArgs,

    #[arg(long, help = "Catalog name for the script. Defaults to the file stem.")]
    pub name: Option<String>,

    #[arg(long, value_enum, default_value_t = CliReportFormat::Json)]
    pub format: CliReportFormat,

    #[arg(long, help = "Write the report here instead of stdout")]
    pub output: Option<PathBuf>,

    #[arg(
        long = "poll-interval-ms",
        default_value_t = 250,
        value_parser = parse_positive_u64,
        help = "How often the registry is polled for progress"
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long = "run-timeout-ms",
        default_value_t = 600_000,
        value_parser = parse_positive_u64,
        help = "Give up waiting for the run after this long"
    )]
    pub run_timeout_ms: u64,

    #[arg(long, help = "Override the script's browser tag")]
    pub browser: Option<String>,

    #[arg(long, action = ArgAction::Set, help = "Override the script's headless flag")]
    pub headless: Option<bool>,

    #[arg(
        long = "continue-on-error",
        action = ArgAction::Set,
        help = "Override the script's continueOnError flag"
    )]
    pub continue_on_error: Option<bool>,

    #[command(flatten)]
    pub driver: DriverArgs,

    #[command(flatten)]
    pub simulation: SimulationArgs,
}

impl RunArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            driver: self.driver.driver_config(),
            simulated: self.simulation.simulated_config(),
        }
    }

    /// Applies command-line overrides on top of script settings.
    pub fn apply_setting_overrides(&self, settings: &mut RunSettings) {
        if let Some(browser) = self.browser.as_ref() {
            settings.browser = browser.clone();
        }
        if let Some(headless) = self.headless {
            settings.headless = headless;
        }
        if let Some(continue_on_error) = self.continue_on_error {
            settings.continue_on_error = continue_on_error;
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct DriverArgs {
    #[arg(
        long = "playwright-cli",
        env = "STEPSHOT_PLAYWRIGHT_CLI",
        help = "Playwright driver executable. Without it every run is simulated."
    )]
    pub playwright_cli: Option<PathBuf>,

    #[arg(
        long = "driver-timeout-ms",
        env = "STEPSHOT_DRIVER_TIMEOUT_MS",
        default_value_t = DEFAULT_DRIVER_COMMAND_TIMEOUT_MS,
        value_parser = parse_positive_u64
    )]
    pub driver_timeout_ms: u64,

    #[arg(
        long = "wait-timeout-ms",
        env = "STEPSHOT_WAIT_TIMEOUT_MS",
        default_value_t = DEFAULT_WAIT_FOR_SELECTOR_TIMEOUT_MS,
        value_parser = parse_positive_u64
    )]
    pub wait_timeout_ms: u64,
}

impl DriverArgs {
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            playwright_cli: self.playwright_cli.clone(),
            command_timeout_ms: self.driver_timeout_ms,
            wait_for_selector_timeout_ms: self.wait_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct SimulationArgs {
    #[arg(
        long = "sim-min-latency-ms",
        env = "STEPSHOT_SIM_MIN_LATENCY_MS",
        default_value_t = DEFAULT_SIMULATED_MIN_LATENCY_MS
    )]
    pub sim_min_latency_ms: u64,

    #[arg(
        long = "sim-max-latency-ms",
        env = "STEPSHOT_SIM_MAX_LATENCY_MS",
        default_value_t = DEFAULT_SIMULATED_MAX_LATENCY_MS
    )]
    pub sim_max_latency_ms: u64,

    #[arg(long = "sim-seed", env = "STEPSHOT_SIM_SEED")]
    pub sim_seed: Option<u64>,
}

impl SimulationArgs {
    pub fn simulated_config(&self) -> SimulatedBackendConfig {
        SimulatedBackendConfig {
            min_latency_ms: self.sim_min_latency_ms,
            max_latency_ms: self.sim_max_latency_ms,
            seed: self.sim_seed,
        }
    }
}
