mod args;
mod output;
mod runner;
mod worker;

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use args::{Cli, Commands};
use flagrun_storage::StateStores;
use flagrun_telemetry::{describe_metrics, init_logging, LogTarget};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json, log_target(&cli.command))?;
    describe_metrics();

    match cli.command {
        Commands::Run(args) => runner::run(args).await,
        Commands::Worker(args) => worker::run_worker(args).await,
        Commands::Status { state_dir, output: format } => {
            let stores = StateStores::new(&state_dir);
            output::print_status(&stores.failures.load(), &stores.processed.load(), &format)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Workers keep stdout for their result line; JSON output keeps it for the
/// report.
fn log_target(command: &Commands) -> LogTarget {
    match command {
        Commands::Worker(_) => LogTarget::Stderr,
        Commands::Run(args) if args.output == "json" => LogTarget::Stderr,
        Commands::Status { output, .. } if output == "json" => LogTarget::Stderr,
        _ => LogTarget::Stdout,
    }
}
