//! Telemetry - logging setup and task metrics
//!
//! Metrics are recorded through the `metrics` facade; without an installed
//! recorder every call is a no-op.

use anyhow::{anyhow, Result};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

pub const TASKS_TOTAL: &str = "flagrun_tasks_total";
pub const TASKS_SUCCEEDED: &str = "flagrun_tasks_succeeded_total";
pub const TASKS_TIMED_OUT: &str = "flagrun_tasks_timed_out_total";
pub const TASKS_CRASHED: &str = "flagrun_tasks_crashed_total";
pub const TASK_DURATION: &str = "flagrun_task_duration_seconds";

/// Where log lines go. Workers keep stdout free for their result line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the verbosity level derived from `-v` flags.
pub fn init_logging(verbose: u8, json: bool, target: LogTarget) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbose)));

    let builder = fmt().with_env_filter(filter);
    let installed = match (json, target) {
        (true, LogTarget::Stdout) => builder.json().try_init(),
        (true, LogTarget::Stderr) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, LogTarget::Stdout) => builder.compact().try_init(),
        (false, LogTarget::Stderr) => builder.compact().with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}

fn level_for(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// How a task ended, for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Solved,
    Unsolved,
    TimedOut,
    Crashed,
}

pub fn describe_metrics() {
    metrics::describe_counter!(TASKS_TOTAL, "Challenge tasks finished");
    metrics::describe_counter!(TASKS_SUCCEEDED, "Challenge tasks that produced a flag");
    metrics::describe_counter!(TASKS_TIMED_OUT, "Challenge tasks killed by the timeout");
    metrics::describe_counter!(TASKS_CRASHED, "Challenge tasks whose worker crashed");
    metrics::describe_histogram!(TASK_DURATION, "Wall time of one challenge task");
}

pub fn record_task(outcome: TaskOutcome, elapsed: Duration) {
    metrics::counter!(TASKS_TOTAL).increment(1);
    match outcome {
        TaskOutcome::Solved => metrics::counter!(TASKS_SUCCEEDED).increment(1),
        TaskOutcome::TimedOut => metrics::counter!(TASKS_TIMED_OUT).increment(1),
        TaskOutcome::Crashed => metrics::counter!(TASKS_CRASHED).increment(1),
        TaskOutcome::Unsolved => {}
    }
    metrics::histogram!(TASK_DURATION).record(elapsed.as_secs_f64());
}
