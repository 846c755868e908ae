// crates/orchestrator/src/scheduler.rs
//! Batch scheduler - fixed worker pool over a shared task queue

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use flagrun_common::{ChallengeItem, ChallengeTask, TaskResult};
use flagrun_telemetry::{record_task, TaskOutcome};

use crate::launcher::TaskLauncher;
use crate::progress::{ProgressTracker, RunSummary};
use crate::rate_limiter::RateLimiter;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on parallel workers; the endpoint count is the other.
    pub max_concurrent: usize,
    pub task_timeout: Duration,
    /// Minimum spacing between worker launches. Zero disables it.
    pub stagger: Duration,
    /// How long in-flight tasks may keep running after `close()`.
    pub grace_period: Duration,
    pub progress_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            task_timeout: Duration::from_secs(1700),
            stagger: Duration::from_secs(1),
            grace_period: Duration::from_millis(100),
            progress_interval: Duration::from_secs(5),
        }
    }
}

/// Runs batches of challenge tasks with bounded parallelism. Results always
/// line up with the input tasks, one per task.
pub struct BatchScheduler {
    launcher: Arc<dyn TaskLauncher>,
    endpoints: Vec<String>,
    config: SchedulerConfig,
    stagger: Arc<RateLimiter>,
    progress: Arc<ProgressTracker>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl BatchScheduler {
    pub fn new(
        launcher: Arc<dyn TaskLauncher>,
        endpoints: Vec<String>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let mut unique: Vec<String> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let endpoint = endpoint.trim();
            if !endpoint.is_empty() && !unique.iter().any(|e| e == endpoint) {
                unique.push(endpoint.to_string());
            }
        }
        if unique.is_empty() {
            return Err(anyhow!("no browser endpoints configured"));
        }
        let endpoints = unique;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            launcher,
            endpoints,
            stagger: Arc::new(RateLimiter::per_period(config.stagger)),
            config,
            progress: Arc::new(ProgressTracker::new()),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn worker_count(&self) -> usize {
        self.endpoints.len().min(self.config.max_concurrent).max(1)
    }

    /// Turn source items into tasks, assigning endpoints round-robin.
    pub fn build_tasks(&self, items: &[ChallengeItem], hint_last_hour: bool) -> Vec<ChallengeTask> {
        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let endpoint = &self.endpoints[i % self.endpoints.len()];
                ChallengeTask::from_item(item, endpoint, hint_last_hour)
            })
            .collect()
    }

    /// Flips to `true` once `close()` runs.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the pool. In-flight tasks get the grace period, then their
    /// workers are killed; queued tasks never start. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing worker pool");
        self.shutdown.send_replace(true);
    }

    #[instrument(skip(self, tasks), fields(batch = %Uuid::new_v4(), tasks = tasks.len()))]
    pub async fn run_batch(&self, tasks: Vec<ChallengeTask>) -> Vec<TaskResult> {
        let start = Instant::now();
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }
        let urls: Vec<String> = tasks.iter().map(|t| t.url.clone()).collect();
        let slots = Arc::new(Mutex::new(vec![None; total]));

        if self.is_closed() {
            warn!("Worker pool is closed, {} tasks not started", total);
        } else {
            let workers = self.worker_count().min(total);
            info!(
                "Starting batch of {} tasks on {} workers ({} launcher)",
                total,
                workers,
                self.launcher.name()
            );
            self.progress.set_total(total).await;

            let queue = Arc::new(Mutex::new(tasks.into_iter().enumerate().collect::<VecDeque<_>>()));
            let mut pool = JoinSet::new();
            for id in 0..workers {
                let worker = Worker {
                    id,
                    queue: queue.clone(),
                    slots: slots.clone(),
                    launcher: self.launcher.clone(),
                    stagger: self.stagger.clone(),
                    progress: self.progress.clone(),
                    shutdown: self.shutdown.subscribe(),
                    timeout: self.config.task_timeout,
                    grace: self.config.grace_period,
                };
                pool.spawn(worker.run());
            }
            self.monitor(&mut pool).await;
        }

        let filled = std::mem::take(&mut *slots.lock().await);
        let results: Vec<TaskResult> = filled
            .into_iter()
            .zip(urls)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| {
                    warn!("Task for {} did not complete", url);
                    TaskResult::incomplete(url)
                })
            })
            .collect();

        RunSummary::from_results(&results, start.elapsed()).log();
        results
    }

    /// Wait for every worker, logging progress while tasks are outstanding.
    async fn monitor(&self, pool: &mut JoinSet<()>) {
        let period = self.config.progress_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = pool.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => error!("Worker task failed: {}", e),
                    None => break,
                },
                _ = ticker.tick() => self.progress.log_progress().await,
            }
        }
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolves once the shutdown flag is set. Never resolves if the sender is
/// gone without having signalled.
pub(crate) async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

enum Outcome {
    Finished(Result<TaskResult>),
    TimedOut,
    Cancelled,
}

struct Worker {
    id: usize,
    queue: Arc<Mutex<VecDeque<(usize, ChallengeTask)>>>,
    slots: Arc<Mutex<Vec<Option<TaskResult>>>>,
    launcher: Arc<dyn TaskLauncher>,
    stagger: Arc<RateLimiter>,
    progress: Arc<ProgressTracker>,
    shutdown: watch::Receiver<bool>,
    timeout: Duration,
    grace: Duration,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let next = {
                let mut q = self.queue.lock().await;
                q.pop_front()
            };
            let (index, task) = match next {
                Some(t) => t,
                None => break,
            };

            tokio::select! {
                _ = self.stagger.acquire() => {}
                _ = wait_closed(&mut self.shutdown) => break,
            }

            info!(
                "Worker {} starting task {}: {} - {}",
                self.id,
                index,
                task.display_code(),
                task.url
            );
            let started = Instant::now();
            let result = match self.execute(&task).await {
                Outcome::Finished(Ok(result)) => result,
                Outcome::Finished(Err(e)) => {
                    warn!("Task {} crashed: {:#}", task.url, e);
                    TaskResult::exception(&task.url, format!("{:#}", e))
                }
                Outcome::TimedOut => {
                    warn!("Task {} timed out after {:?}", task.url, self.timeout);
                    TaskResult::timeout(&task.url)
                }
                Outcome::Cancelled => {
                    warn!("Task {} cancelled by shutdown", task.url);
                    break;
                }
            };

            record_task(outcome_of(&result), started.elapsed());
            self.progress.record(&result).await;
            self.slots.lock().await[index] = Some(result);
        }
    }

    async fn execute(&mut self, task: &ChallengeTask) -> Outcome {
        let launcher = self.launcher.clone();
        let launch = launcher.launch(task);
        tokio::pin!(launch);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        tokio::select! {
            res = &mut launch => Outcome::Finished(res),
            _ = &mut deadline => Outcome::TimedOut,
            _ = wait_closed(&mut self.shutdown) => {
                match tokio::time::timeout(self.grace, &mut launch).await {
                    Ok(res) => Outcome::Finished(res),
                    Err(_) => Outcome::Cancelled,
                }
            }
        }
    }
}

fn outcome_of(result: &TaskResult) -> TaskOutcome {
    if result.flag_found {
        TaskOutcome::Solved
    } else if result.is_timeout() {
        TaskOutcome::TimedOut
    } else if result.is_exception() {
        TaskOutcome::Crashed
    } else {
        TaskOutcome::Unsolved
    }
}
