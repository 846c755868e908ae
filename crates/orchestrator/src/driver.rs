// crates/orchestrator/src/driver.rs
//! Polling driver - filter, execute, persist

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use flagrun_common::{
    format_duration, ChallengeItem, ChallengeSource, FailureCounters, FilterMode, ProcessedSet,
    TaskResult,
};
use flagrun_storage::StateStores;

use crate::scheduler::{wait_closed, BatchScheduler};

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Items whose failure metric reaches this are skipped.
    pub threshold: u32,
    pub poll_interval: Duration,
    pub hint_last_hour: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            poll_interval: Duration::from_secs(30),
            hint_last_hour: true,
        }
    }
}

/// Result of a single one-shot pass.
#[derive(Debug, Clone, PartialEq)]
pub enum OneShot {
    NoTargets,
    Exhausted,
    Ran {
        items: Vec<ChallengeItem>,
        results: Vec<TaskResult>,
    },
}

impl OneShot {
    pub fn exit_code(&self) -> i32 {
        match self {
            OneShot::Ran { .. } => 0,
            OneShot::NoTargets | OneShot::Exhausted => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    NoTargets,
    Exhausted,
    Executed(usize),
    Interrupted,
}

/// Drop items at or over the failure threshold. In watch mode every
/// surviving item carries its per-code failure count to the agent.
pub fn filter_items(
    items: Vec<ChallengeItem>,
    counters: &FailureCounters,
    mode: FilterMode,
    threshold: u32,
) -> Vec<ChallengeItem> {
    items
        .into_iter()
        .filter_map(|mut item| {
            let metric = counters.metric(item.code.as_deref(), &item.url, mode);
            if metric >= threshold {
                info!("Skipping {} (failed {} times)", item, metric);
                return None;
            }
            if mode == FilterMode::Watch {
                item.failure_counts = counters.code_count(item.code.as_deref());
            }
            Some(item)
        })
        .collect()
}

pub fn record_results(items: &[ChallengeItem], results: &[TaskResult], counters: &mut FailureCounters) {
    for (item, result) in items.iter().zip(results) {
        counters.record(item.code.as_deref(), &item.url, result.flag_found);
    }
}

/// With `only_solved` unset every attempted item is marked.
pub fn mark_processed(
    items: &[ChallengeItem],
    results: &[TaskResult],
    processed: &mut ProcessedSet,
    only_solved: bool,
) {
    for (item, result) in items.iter().zip(results) {
        if result.flag_found || !only_solved {
            processed.mark(item.code.as_deref(), &item.url);
        }
    }
}

pub struct PollingDriver {
    scheduler: Arc<BatchScheduler>,
    stores: StateStores,
    config: DriverConfig,
}

impl PollingDriver {
    pub fn new(scheduler: Arc<BatchScheduler>, stores: StateStores, config: DriverConfig) -> Self {
        Self {
            scheduler,
            stores,
            config,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// One batch over `items`; 0 when a batch ran, 1 when nothing could.
    pub async fn run_once(&self, items: Vec<ChallengeItem>) -> i32 {
        self.execute_once(items).await.exit_code()
    }

    pub async fn execute_once(&self, items: Vec<ChallengeItem>) -> OneShot {
        if items.is_empty() {
            warn!("No targets to run");
            return OneShot::NoTargets;
        }

        let mut counters = self.stores.failures.load();
        let items = filter_items(items, &counters, FilterMode::OneShot, self.config.threshold);
        if items.is_empty() {
            warn!(
                "Every target has failed at least {} times, nothing to run",
                self.config.threshold
            );
            return OneShot::Exhausted;
        }

        let results = self.dispatch(&items).await;
        if self.scheduler.is_closed() {
            warn!("Batch interrupted, failure counters left unchanged");
        } else {
            record_results(&items, &results, &mut counters);
            if let Err(e) = self.stores.failures.save(&counters) {
                error!("Failed to save failure counters: {}", e);
            }
        }
        OneShot::Ran { items, results }
    }

    /// Poll `source` until `shutdown` flips. Cycle errors are logged and the
    /// loop carries on.
    pub async fn watch(&self, source: &dyn ChallengeSource, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Watching {} every {}",
            source.name(),
            format_duration(self.config.poll_interval)
        );
        let mut counters = self.stores.failures.load();
        let mut processed = self.stores.processed.load();

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_cycle(source, &mut counters, &mut processed).await {
                Ok(Cycle::NoTargets) => info!("No challenges available, waiting for next poll"),
                Ok(Cycle::Exhausted) => info!(
                    "Every open challenge has failed at least {} times, waiting for next poll",
                    self.config.threshold
                ),
                Ok(Cycle::Executed(n)) => info!("Poll cycle finished ({} challenges)", n),
                Ok(Cycle::Interrupted) => break,
                Err(e) => error!("Poll cycle failed: {:#}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = wait_closed(&mut shutdown) => break,
            }
        }
        info!("Watch loop stopped");
    }

    async fn poll_cycle(
        &self,
        source: &dyn ChallengeSource,
        counters: &mut FailureCounters,
        processed: &mut ProcessedSet,
    ) -> Result<Cycle> {
        let items = match source.fetch().await {
            Ok(items) => items,
            Err(e) => {
                warn!("Fetching challenges from {} failed: {}", source.name(), e);
                Vec::new()
            }
        };
        if items.is_empty() {
            return Ok(Cycle::NoTargets);
        }

        let items = filter_items(items, counters, FilterMode::Watch, self.config.threshold);
        if items.is_empty() {
            return Ok(Cycle::Exhausted);
        }

        info!("Found {} challenges, executing", items.len());
        let results = self.dispatch(&items).await;
        if self.scheduler.is_closed() {
            return Ok(Cycle::Interrupted);
        }

        record_results(&items, &results, counters);
        mark_processed(&items, &results, processed, false);
        self.stores
            .failures
            .save(counters)
            .context("failed to save failure counters")?;
        self.stores
            .processed
            .save(processed)
            .context("failed to save processed challenges")?;
        Ok(Cycle::Executed(items.len()))
    }

    async fn dispatch(&self, items: &[ChallengeItem]) -> Vec<TaskResult> {
        let tasks = self.scheduler.build_tasks(items, self.config.hint_last_hour);
        self.scheduler.run_batch(tasks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::TaskLauncher;
    use crate::scheduler::SchedulerConfig;
    use async_trait::async_trait;
    use flagrun_common::{ChallengeTask, FlagrunError, FlagrunResult};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Solves urls containing "solve", times out urls containing "slow",
    /// fails the rest. Records the failure count each task carried.
    #[derive(Default)]
    struct FakeLauncher {
        seen: Mutex<Vec<ChallengeTask>>,
    }

    #[async_trait]
    impl TaskLauncher for FakeLauncher {
        async fn launch(&self, task: &ChallengeTask) -> anyhow::Result<TaskResult> {
            self.seen.lock().push(task.clone());
            if task.url.contains("slow") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if task.url.contains("solve") {
                return Ok(TaskResult::found(&task.url, "flag{x}"));
            }
            Ok(TaskResult::failed(&task.url, "no flag"))
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn driver(dir: &std::path::Path) -> (PollingDriver, Arc<FakeLauncher>, Arc<BatchScheduler>) {
        let launcher = Arc::new(FakeLauncher::default());
        let config = SchedulerConfig {
            max_concurrent: 2,
            task_timeout: Duration::from_millis(150),
            stagger: Duration::ZERO,
            grace_period: Duration::from_millis(20),
            progress_interval: Duration::from_secs(5),
        };
        let scheduler = Arc::new(
            BatchScheduler::new(launcher.clone(), vec!["ws://a".into(), "ws://b".into()], config).unwrap(),
        );
        let driver = PollingDriver::new(
            scheduler.clone(),
            StateStores::new(dir),
            DriverConfig {
                threshold: 3,
                poll_interval: Duration::from_millis(20),
                hint_last_hour: false,
            },
        );
        (driver, launcher, scheduler)
    }

    #[test]
    fn filter_respects_threshold_and_mode() {
        let mut counters = FailureCounters::new();
        counters.by_code.insert("1".into(), 3);
        counters.by_code.insert("2".into(), 1);
        counters.by_url.insert("http://b".into(), 5);

        let items = vec![
            ChallengeItem::new("http://a").with_code("1"),
            ChallengeItem::new("http://b").with_code("2"),
            ChallengeItem::new("http://c"),
        ];

        let one_shot = filter_items(items.clone(), &counters, FilterMode::OneShot, 3);
        let urls: Vec<&str> = one_shot.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["http://c"]);
        assert_eq!(one_shot[0].failure_counts, 0);

        // the url counter is ignored while watching
        let watched = filter_items(items, &counters, FilterMode::Watch, 3);
        let urls: Vec<&str> = watched.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["http://b", "http://c"]);
        assert_eq!(watched[0].failure_counts, 1);
    }

    #[test]
    fn repeated_failures_accumulate_and_success_clears() {
        let items = vec![ChallengeItem::new("http://a").with_code("1")];
        let mut counters = FailureCounters::new();
        for _ in 0..4 {
            record_results(&items, &[TaskResult::failed("http://a", "x")], &mut counters);
        }
        assert_eq!(counters.code_count(Some("1")), 4);
        assert_eq!(counters.url_count("http://a"), 4);

        record_results(&items, &[TaskResult::found("http://a", "flag{a}")], &mut counters);
        assert!(counters.is_empty());
    }

    #[test]
    fn mark_on_attempt_or_solve() {
        let items = vec![
            ChallengeItem::new("http://a").with_code("1"),
            ChallengeItem::new("http://b"),
        ];
        let results = vec![
            TaskResult::failed("http://a", "x"),
            TaskResult::found("http://b", "flag{b}"),
        ];

        let mut attempted = ProcessedSet::new();
        mark_processed(&items, &results, &mut attempted, false);
        assert_eq!(attempted.len(), 2);
        assert!(attempted.processed_codes.contains("1"));

        let mut solved = ProcessedSet::new();
        mark_processed(&items, &results, &mut solved, true);
        assert!(solved.contains_url("http://b"));
        assert!(!solved.contains_url("http://a"));
    }

    #[tokio::test]
    async fn one_shot_runs_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, _, _) = driver(dir.path());
        let items = vec![
            ChallengeItem::new("http://solve").with_code("1"),
            ChallengeItem::new("http://slow").with_code("2"),
        ];

        let started = Instant::now();
        let outcome = driver.execute_once(items).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.exit_code(), 0);
        match outcome {
            OneShot::Ran { results, .. } => {
                assert_eq!(results[0], TaskResult::found("http://solve", "flag{x}"));
                assert_eq!(results[1], TaskResult::timeout("http://slow"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let counters = StateStores::new(dir.path()).failures.load();
        assert_eq!(counters.code_count(Some("2")), 1);
        assert_eq!(counters.url_count("http://slow"), 1);
        assert_eq!(counters.code_count(Some("1")), 0);
    }

    #[tokio::test]
    async fn one_shot_without_targets_exits_one() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, launcher, _) = driver(dir.path());
        assert_eq!(driver.run_once(Vec::new()).await, 1);

        let mut counters = FailureCounters::new();
        counters.by_url.insert("http://a".into(), 3);
        StateStores::new(dir.path()).failures.save(&counters).unwrap();
        assert_eq!(driver.run_once(vec![ChallengeItem::new("http://a")]).await, 1);
        assert!(launcher.seen.lock().is_empty());
    }

    struct FlakySource {
        calls: AtomicUsize,
        items: Vec<ChallengeItem>,
    }

    #[async_trait]
    impl ChallengeSource for FlakySource {
        async fn fetch(&self) -> FlagrunResult<Vec<ChallengeItem>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(FlagrunError::Platform("platform down".into()));
            }
            Ok(self.items.clone())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn watch_survives_errors_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, launcher, scheduler) = driver(dir.path());
        let driver = Arc::new(driver);
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
            items: vec![
                ChallengeItem::new("http://solve").with_code("1"),
                ChallengeItem::new("http://fail").with_code("2"),
            ],
        });

        let handle = {
            let driver = driver.clone();
            let source = source.clone();
            let shutdown = scheduler.shutdown_signal();
            tokio::spawn(async move { driver.watch(source.as_ref(), shutdown).await })
        };

        let stores = StateStores::new(dir.path());
        let deadline = Instant::now() + Duration::from_secs(5);
        while stores.failures.load().code_count(Some("2")) < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        // code 2 reached the threshold and stopped being attempted
        let counters = stores.failures.load();
        assert_eq!(counters.code_count(Some("2")), 3);
        let processed = stores.processed.load();
        assert!(processed.processed_codes.contains("1"));
        assert!(processed.processed_codes.contains("2"));

        let seen = launcher.seen.lock();
        let carried: Vec<u32> = seen
            .iter()
            .filter(|t| t.url == "http://fail")
            .map(|t| t.failure_counts)
            .collect();
        assert_eq!(carried, vec![0, 1, 2]);
        assert!(source.calls.load(Ordering::SeqCst) >= 2);
    }
}
