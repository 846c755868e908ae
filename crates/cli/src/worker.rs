// worker.rs
use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use flagrun_common::{ChallengeTask, TaskResult};
use flagrun_runner::MemoryInitGuard;

use crate::args::WorkerArgs;
use crate::runner::{build_platform, build_runner};

/// Read one task from stdin, run it, print the result as a single JSON line.
pub async fn run_worker(args: WorkerArgs) -> Result<ExitCode> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read task from stdin")?;
    let task = parse_task(&input)?;
    debug!(url = %task.url, endpoint = %task.cdp_endpoint, "worker received task");

    let guard = match &args.init_dir {
        Some(dir) => MemoryInitGuard::shared(dir)
            .with_context(|| format!("failed to open marker dir {}", dir.display()))?,
        None => MemoryInitGuard::in_process(),
    };
    let platform = build_platform(&args.agent)?;
    let runner = build_runner(
        &args.agent,
        &args.memory_dir,
        args.transcript_dir.as_deref(),
        Arc::new(guard),
        platform,
    )?;

    let result = runner.run(&task).await;
    write_result(&result).await?;
    Ok(ExitCode::SUCCESS)
}

fn parse_task(input: &str) -> Result<ChallengeTask> {
    serde_json::from_str(input.trim()).context("invalid task payload")
}

async fn write_result(result: &TaskResult) -> Result<()> {
    let mut line = serde_json::to_vec(result).context("failed to encode result")?;
    line.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}
