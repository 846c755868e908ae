//! Progress tracking and batch summaries

use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use flagrun_common::{format_duration, TaskResult};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub timed_out: usize,
}

impl ProgressSnapshot {
    pub fn outstanding(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }
}

pub struct ProgressTracker {
    total: Mutex<usize>,
    completed: Mutex<usize>,
    succeeded: Mutex<usize>,
    timed_out: Mutex<usize>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            total: Mutex::new(0),
            completed: Mutex::new(0),
            succeeded: Mutex::new(0),
            timed_out: Mutex::new(0),
        }
    }

    /// Start a new batch, clearing the previous counts.
    pub async fn set_total(&self, total: usize) {
        *self.total.lock().await = total;
        *self.completed.lock().await = 0;
        *self.succeeded.lock().await = 0;
        *self.timed_out.lock().await = 0;
    }

    pub async fn record(&self, result: &TaskResult) {
        *self.completed.lock().await += 1;
        if result.flag_found {
            *self.succeeded.lock().await += 1;
        } else if result.is_timeout() {
            *self.timed_out.lock().await += 1;
        }
    }

    pub async fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: *self.total.lock().await,
            completed: *self.completed.lock().await,
            succeeded: *self.succeeded.lock().await,
            timed_out: *self.timed_out.lock().await,
        }
    }

    pub async fn log_progress(&self) {
        let snap = self.snapshot().await;
        info!(
            "Progress: {}/{} done, {} solved, {} timed out, {} outstanding",
            snap.completed,
            snap.total,
            snap.succeeded,
            snap.timed_out,
            snap.outstanding()
        );
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub elapsed: Duration,
    /// `(url, flag)` for every solved task, in task order.
    pub flags: Vec<(String, String)>,
}

impl RunSummary {
    pub fn from_results(results: &[TaskResult], elapsed: Duration) -> Self {
        let flags: Vec<(String, String)> = results
            .iter()
            .filter(|r| r.flag_found)
            .map(|r| (r.url.clone(), r.flag_content.clone()))
            .collect();
        Self {
            total: results.len(),
            succeeded: flags.len(),
            elapsed,
            flags,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64 * 100.0
    }

    pub fn log(&self) {
        info!("Batch Summary:");
        info!("  Total challenges: {}", self.total);
        info!("  Solved: {}", self.succeeded);
        info!("  Success rate: {:.1}%", self.success_rate());
        info!("  Elapsed: {}", format_duration(self.elapsed));
        for (url, flag) in &self.flags {
            info!("  {} -> {}", url, flag);
        }
    }
}
