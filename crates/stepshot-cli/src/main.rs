use std::process::ExitCode;

use clap::Parser;
use stepshot_cli::{execute_cli, init_tracing, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match execute_cli(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("[stepshot] {error:#}");
            ExitCode::FAILURE
        }
    }
}
