// crates/runner/src/runner.rs
//! Single-task runner: one challenge, end to end

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use flagrun_common::{
    format_duration, AttackRequest, AttackWorkflow, ChallengeTask, CompetitionWindow,
    FlagSubmitter, FlagValidator, FlagrunResult, HintProvider, TaskResult,
};

use crate::guard::MemoryInitGuard;

/// Runner behaviour switches.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Debug mode: hints are fetched regardless of the competition window.
    pub debug: bool,
    /// Submit found flags to the platform.
    pub auto_submit: bool,
    pub window: CompetitionWindow,
    /// Max characters of raw output kept in a failed result.
    pub diagnostic_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            auto_submit: false,
            window: CompetitionWindow::default(),
            diagnostic_limit: 4096,
        }
    }
}

/// Executes one challenge: hint, memory init, workflow, flag extraction and
/// optional submission. [`SingleTaskRunner::run`] never fails; every error is
/// folded into the returned [`TaskResult`].
pub struct SingleTaskRunner {
    workflow: Arc<dyn AttackWorkflow>,
    guard: Arc<MemoryInitGuard>,
    hints: Option<Arc<dyn HintProvider>>,
    submitter: Option<Arc<dyn FlagSubmitter>>,
    validator: FlagValidator,
    config: RunnerConfig,
}

impl SingleTaskRunner {
    pub fn new(
        workflow: Arc<dyn AttackWorkflow>,
        guard: Arc<MemoryInitGuard>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            workflow,
            guard,
            hints: None,
            submitter: None,
            validator: FlagValidator::new(),
            config,
        }
    }

    pub fn with_hints(mut self, hints: Arc<dyn HintProvider>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn with_submitter(mut self, submitter: Arc<dyn FlagSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    #[instrument(skip(self, task), fields(code = %task.display_code(), url = %task.url))]
    pub async fn run(&self, task: &ChallengeTask) -> TaskResult {
        let start = Instant::now();
        info!(
            "Starting challenge via {} (previous failures: {})",
            self.workflow.name(),
            task.failure_counts
        );

        let result = match self.attempt(task).await {
            Ok(result) => result,
            Err(e) => {
                error!("Challenge execution failed: {}", e);
                TaskResult::exception(&task.url, e)
            }
        };

        info!(
            "Challenge finished in {} ({})",
            format_duration(start.elapsed()),
            if result.flag_found { "flag found" } else { "no flag" }
        );
        result
    }

    async fn attempt(&self, task: &ChallengeTask) -> FlagrunResult<TaskResult> {
        let hint = self.hint_for(task).await;
        let key = task.key();
        self.prepare_memory(&key).await;

        let request = AttackRequest {
            key,
            url: task.url.clone(),
            code: task.code.clone(),
            hint,
            failure_counts: task.failure_counts,
            cdp_endpoint: task.cdp_endpoint.clone(),
        };
        let output = self.workflow.execute(&request).await?;

        match self.validator.find_flag(&output) {
            Some(flag) => {
                info!("Flag found: {}", flag);
                self.submit(task, &flag).await;
                Ok(TaskResult::found(&task.url, flag))
            }
            None => Ok(TaskResult::failed(
                &task.url,
                truncate(&output, self.config.diagnostic_limit),
            )),
        }
    }

    /// Hints are time-gated and best effort.
    async fn hint_for(&self, task: &ChallengeTask) -> Option<String> {
        if !task.hint_last_hour {
            return None;
        }
        let code = task.code.as_deref()?;
        let provider = self.hints.as_ref()?;
        if !(self.config.debug || self.config.window.is_hint_time_now()) {
            return None;
        }

        match provider.hint(code).await {
            Ok(Some(hint)) => {
                info!("Hint received ({} chars)", hint.len());
                Some(hint)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Hint retrieval failed: {}", e);
                None
            }
        }
    }

    async fn prepare_memory(&self, key: &str) {
        if !self.guard.try_claim(key) {
            debug!(key, "memory namespace already initialized");
            return;
        }
        if let Err(e) = self.workflow.reset_memory(key).await {
            warn!(key, "Memory reset failed: {}", e);
        }
    }

    async fn submit(&self, task: &ChallengeTask, flag: &str) {
        if !self.config.auto_submit {
            return;
        }
        let Some(submitter) = &self.submitter else {
            debug!("auto-submit enabled but no submitter configured");
            return;
        };
        let Some(code) = task.code.as_deref() else {
            warn!("Cannot submit flag without a challenge code");
            return;
        };

        match submitter.submit(code, flag).await {
            Ok(ack) => info!("Flag submitted for {}: {}", code, ack),
            Err(e) => error!("Flag submission failed for {}: {}", code, e),
        }
    }
}

fn truncate(output: &str, limit: usize) -> String {
    match output.char_indices().nth(limit) {
        Some((end, _)) => format!("{}...", &output[..end]),
        None => output.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flagrun_common::FlagrunError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedWorkflow {
        output: Option<String>,
        resets: AtomicUsize,
        requests: Mutex<Vec<AttackRequest>>,
        delay: Duration,
    }

    impl ScriptedWorkflow {
        fn returning(output: &str) -> Self {
            Self {
                output: Some(output.to_string()),
                ..Self::default()
            }
        }

        fn failing() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl AttackWorkflow for ScriptedWorkflow {
        async fn execute(&self, request: &AttackRequest) -> FlagrunResult<String> {
            self.requests.lock().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.output
                .clone()
                .ok_or_else(|| FlagrunError::Workflow("agent crashed".into()))
        }

        async fn reset_memory(&self, _key: &str) -> FlagrunResult<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct FixedHint(Option<&'static str>);

    #[async_trait]
    impl HintProvider for FixedHint {
        async fn hint(&self, _code: &str) -> FlagrunResult<Option<String>> {
            match self.0 {
                Some(h) => Ok(Some(h.to_string())),
                None => Err(FlagrunError::Platform("hint service down".into())),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSubmitter {
        fail: bool,
        submitted: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl FlagSubmitter for RecordingSubmitter {
        async fn submit(&self, code: &str, flag: &str) -> FlagrunResult<String> {
            self.submitted.lock().push((code.to_string(), flag.to_string()));
            if self.fail {
                Err(FlagrunError::Platform("rejected".into()))
            } else {
                Ok("accepted".into())
            }
        }
    }

    fn task() -> ChallengeTask {
        ChallengeTask::new("http://a", "ws://127.0.0.1:13001").with_code("1")
    }

    fn runner(workflow: Arc<ScriptedWorkflow>, config: RunnerConfig) -> SingleTaskRunner {
        SingleTaskRunner::new(workflow, Arc::new(MemoryInitGuard::in_process()), config)
    }

    #[tokio::test]
    async fn flag_is_extracted_from_output() {
        let workflow = Arc::new(ScriptedWorkflow::returning("dumped table users... flag{x} done"));
        let result = runner(workflow.clone(), RunnerConfig::default()).run(&task()).await;

        assert_eq!(result, TaskResult::found("http://a", "flag{x}"));
        let requests = workflow.requests.lock();
        assert_eq!(requests[0].key, "ctf_1_http_a");
        assert_eq!(requests[0].cdp_endpoint, "ws://127.0.0.1:13001");
    }

    #[tokio::test]
    async fn output_without_flag_is_kept_for_diagnostics() {
        let workflow = Arc::new(ScriptedWorkflow::returning("no injection point found"));
        let result = runner(workflow, RunnerConfig::default()).run(&task()).await;
        assert!(!result.flag_found);
        assert_eq!(result.flag_content, "no injection point found");
    }

    #[tokio::test]
    async fn long_diagnostics_are_truncated() {
        let workflow = Arc::new(ScriptedWorkflow::returning(&"x".repeat(100)));
        let config = RunnerConfig {
            diagnostic_limit: 10,
            ..RunnerConfig::default()
        };
        let result = runner(workflow, config).run(&task()).await;
        assert_eq!(result.flag_content, format!("{}...", "x".repeat(10)));
    }

    #[tokio::test]
    async fn workflow_error_becomes_exception_result() {
        let workflow = Arc::new(ScriptedWorkflow::failing());
        let result = runner(workflow, RunnerConfig::default()).run(&task()).await;
        assert!(result.is_exception());
        assert!(result.flag_content.contains("agent crashed"));
    }

    #[tokio::test]
    async fn hint_passed_in_debug_mode() {
        let workflow = Arc::new(ScriptedWorkflow::returning("nothing"));
        let config = RunnerConfig {
            debug: true,
            ..RunnerConfig::default()
        };
        let runner = runner(workflow.clone(), config).with_hints(Arc::new(FixedHint(Some("check /admin"))));

        runner.run(&task().with_hint_last_hour(true)).await;
        runner.run(&task()).await;

        let requests = workflow.requests.lock();
        assert_eq!(requests[0].hint.as_deref(), Some("check /admin"));
        assert_eq!(requests[1].hint, None);
    }

    #[tokio::test]
    async fn hint_respects_window() {
        let workflow = Arc::new(ScriptedWorkflow::returning("nothing"));
        let config = RunnerConfig {
            window: CompetitionWindow::new(Vec::new()),
            ..RunnerConfig::default()
        };
        let runner = runner(workflow.clone(), config).with_hints(Arc::new(FixedHint(Some("h"))));
        runner.run(&task().with_hint_last_hour(true)).await;
        assert_eq!(workflow.requests.lock()[0].hint, None);
    }

    #[tokio::test]
    async fn hint_failure_is_swallowed() {
        let workflow = Arc::new(ScriptedWorkflow::returning("flag{ok}"));
        let config = RunnerConfig {
            window: CompetitionWindow::always(),
            ..RunnerConfig::default()
        };
        let runner = runner(workflow.clone(), config).with_hints(Arc::new(FixedHint(None)));
        let result = runner.run(&task().with_hint_last_hour(true)).await;
        assert!(result.flag_found);
        assert_eq!(workflow.requests.lock()[0].hint, None);
    }

    #[tokio::test]
    async fn auto_submit_sends_flag() {
        let workflow = Arc::new(ScriptedWorkflow::returning("flag{x}"));
        let submitter = Arc::new(RecordingSubmitter::default());
        let config = RunnerConfig {
            auto_submit: true,
            ..RunnerConfig::default()
        };
        runner(workflow, config)
            .with_submitter(submitter.clone())
            .run(&task())
            .await;
        assert_eq!(
            submitter.submitted.lock().as_slice(),
            &[("1".to_string(), "flag{x}".to_string())]
        );
    }

    #[tokio::test]
    async fn submit_failure_keeps_flag() {
        let workflow = Arc::new(ScriptedWorkflow::returning("flag{x}"));
        let submitter = Arc::new(RecordingSubmitter {
            fail: true,
            ..RecordingSubmitter::default()
        });
        let config = RunnerConfig {
            auto_submit: true,
            ..RunnerConfig::default()
        };
        let result = runner(workflow, config)
            .with_submitter(submitter.clone())
            .run(&task())
            .await;
        assert_eq!(result, TaskResult::found("http://a", "flag{x}"));
        assert_eq!(submitter.submitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn no_submit_without_auto_submit() {
        let workflow = Arc::new(ScriptedWorkflow::returning("flag{x}"));
        let submitter = Arc::new(RecordingSubmitter::default());
        runner(workflow, RunnerConfig::default())
            .with_submitter(submitter.clone())
            .run(&task())
            .await;
        assert!(submitter.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn concurrent_runs_reset_memory_once() {
        let workflow = Arc::new(ScriptedWorkflow {
            output: Some("nothing".into()),
            delay: Duration::from_millis(20),
            ..ScriptedWorkflow::default()
        });
        let runner = Arc::new(runner(workflow.clone(), RunnerConfig::default()));

        let a = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(&task()).await }
        });
        let b = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(&task()).await }
        });
        a.await.unwrap();
        b.await.unwrap();
        runner.run(&task()).await;

        assert_eq!(workflow.resets.load(Ordering::SeqCst), 1);
        assert_eq!(workflow.requests.lock().len(), 3);

        // a different challenge gets its own reset
        runner.run(&task().with_code("2")).await;
        assert_eq!(workflow.resets.load(Ordering::SeqCst), 2);
    }
}
