// crates/orchestrator/src/launcher.rs
//! Task launchers - how one challenge task gets executed

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

use flagrun_common::{ChallengeTask, TaskResult};
use flagrun_runner::SingleTaskRunner;

use crate::pool::EndpointPool;

/// Runs one task to completion. Dropping the returned future must stop the
/// work; the scheduler relies on that for timeouts and shutdown.
#[async_trait]
pub trait TaskLauncher: Send + Sync {
    async fn launch(&self, task: &ChallengeTask) -> Result<TaskResult>;

    fn name(&self) -> &str;
}

/// Runs every task in a fresh worker process. The task goes in as JSON on
/// stdin and the worker prints one JSON result line on stdout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// This executable's hidden `worker` subcommand.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("cannot locate the current executable")?;
        Ok(Self::new(exe).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut std_cmd = std::process::Command::new(&self.program);
        std_cmd.args(&self.args).envs(self.envs.iter().map(|(k, v)| (k, v)));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TaskLauncher for ProcessLauncher {
    async fn launch(&self, task: &ChallengeTask) -> Result<TaskResult> {
        let payload = serde_json::to_vec(task).context("failed to encode task")?;

        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("failed to spawn worker {}", self.program.display()))?;
        let _group = ProcessGroup(child.id());
        debug!(pid = ?child.id(), url = %task.url, "worker started");

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .context("failed to send task to worker")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed waiting for worker")?;
        if !output.status.success() {
            bail!("worker exited with {}", output.status);
        }
        parse_worker_output(&output.stdout)
    }

    fn name(&self) -> &str {
        "process"
    }
}

/// The last non-empty stdout line is the result.
pub fn parse_worker_output(stdout: &[u8]) -> Result<TaskResult> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .context("worker produced no result")?;
    serde_json::from_str(line).with_context(|| format!("unparseable worker result: {}", line))
}

/// Kills the worker's whole process group on drop, agent children included.
struct ProcessGroup(Option<u32>);

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pid) = self.0 {
            kill_group(pid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    // SAFETY: plain signal delivery; ESRCH for an already reaped group is ignored.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Runs tasks on this runtime, leasing an endpoint from the pool for each.
pub struct InProcessLauncher {
    runner: Arc<SingleTaskRunner>,
    pool: EndpointPool,
}

impl InProcessLauncher {
    pub fn new(runner: Arc<SingleTaskRunner>, pool: EndpointPool) -> Self {
        Self { runner, pool }
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }
}

#[async_trait]
impl TaskLauncher for InProcessLauncher {
    async fn launch(&self, task: &ChallengeTask) -> Result<TaskResult> {
        let lease = self.pool.acquire().await?;
        let mut task = task.clone();
        task.cdp_endpoint = lease.endpoint().to_string();

        let runner = self.runner.clone();
        let mut handle = AbortOnDrop(tokio::spawn(async move {
            let _lease = lease;
            runner.run(&task).await
        }));
        (&mut handle.0).await.context("in-process task panicked")
    }

    fn name(&self) -> &str {
        "in-process"
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flagrun_common::{AttackRequest, AttackWorkflow, FlagrunError, FlagrunResult};
    use flagrun_runner::{MemoryInitGuard, RunnerConfig};
    use std::time::Duration;

    #[test]
    fn parses_last_result_line() {
        let out = b"noise\n{\"url\":\"http://a\",\"flag_found\":true,\"flag_content\":\"flag{x}\"}\n\n";
        let result = parse_worker_output(out).unwrap();
        assert_eq!(result, TaskResult::found("http://a", "flag{x}"));

        assert!(parse_worker_output(b"").is_err());
        assert!(parse_worker_output(b"not json\n").is_err());
    }

    #[cfg(unix)]
    fn sh(script: &str) -> ProcessLauncher {
        ProcessLauncher::new("sh").args(["-c", script])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_round_trip() {
        let launcher = sh(
            r#"cat >/dev/null; echo '{"url":"http://a","flag_found":true,"flag_content":"flag{p}"}'"#,
        );
        let result = launcher
            .launch(&ChallengeTask::new("http://a", "ws://e"))
            .await
            .unwrap();
        assert_eq!(result.flag_content, "flag{p}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_receives_task_on_stdin() {
        let launcher = sh(
            r#"read line; case "$line" in *ws://e9*) echo '{"url":"http://a","flag_found":false,"flag_content":"seen"}';; *) exit 4;; esac"#,
        );
        let result = launcher
            .launch(&ChallengeTask::new("http://a", "ws://e9"))
            .await
            .unwrap();
        assert_eq!(result.flag_content, "seen");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn env_reaches_worker() {
        let launcher = sh(r#"cat >/dev/null; printf '{"url":"http://a","flag_found":false,"flag_content":"%s"}\n' "$FLAGRUN_API_TOKEN""#)
            .env("FLAGRUN_API_TOKEN", "secret");
        let result = launcher
            .launch(&ChallengeTask::new("http://a", "ws://e"))
            .await
            .unwrap();
        assert_eq!(result.flag_content, "secret");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let err = sh("cat >/dev/null; exit 3")
            .launch(&ChallengeTask::new("http://a", "ws://e"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("worker exited"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let launcher = ProcessLauncher::new("/nonexistent/flagrun-worker");
        assert!(launcher
            .launch(&ChallengeTask::new("http://a", "ws://e"))
            .await
            .is_err());
    }

    /// Running, i.e. signalable and not a zombie waiting to be reaped.
    #[cfg(target_os = "linux")]
    fn alive(pid: i32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH);
        }
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat.rsplit(')').next().unwrap_or("").trim_start().starts_with('Z'),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_launch_kills_worker_and_children() {
        let dir = tempfile::tempdir().unwrap();
        let pids = dir.path().join("pids");
        let script = format!(
            "sleep 30 & echo \"$$ $!\" > {}.tmp; mv {}.tmp {}; wait",
            pids.display(),
            pids.display(),
            pids.display()
        );
        let launcher = sh(&script);

        let started = std::time::Instant::now();
        let res = tokio::time::timeout(
            Duration::from_millis(500),
            launcher.launch(&ChallengeTask::new("http://a", "ws://e")),
        )
        .await;
        assert!(res.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));

        let recorded = std::fs::read_to_string(&pids).unwrap();
        let recorded: Vec<i32> = recorded.split_whitespace().map(|p| p.parse().unwrap()).collect();
        assert_eq!(recorded.len(), 2);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while recorded.iter().any(|&pid| alive(pid)) && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for pid in recorded {
            assert!(!alive(pid), "process {} survived the timeout", pid);
        }
    }

    struct EndpointEcho;

    #[async_trait]
    impl AttackWorkflow for EndpointEcho {
        async fn execute(&self, request: &AttackRequest) -> FlagrunResult<String> {
            if request.url.contains("boom") {
                return Err(FlagrunError::Workflow("boom".into()));
            }
            Ok(format!("flag{{{}}}", request.cdp_endpoint))
        }

        fn name(&self) -> &str {
            "endpoint-echo"
        }
    }

    fn in_process(endpoints: Vec<&str>) -> InProcessLauncher {
        let runner = SingleTaskRunner::new(
            Arc::new(EndpointEcho),
            Arc::new(MemoryInitGuard::in_process()),
            RunnerConfig::default(),
        );
        InProcessLauncher::new(Arc::new(runner), EndpointPool::new(endpoints).unwrap())
    }

    #[tokio::test]
    async fn in_process_uses_leased_endpoint() {
        let launcher = in_process(vec!["ws://leased"]);
        let result = launcher
            .launch(&ChallengeTask::new("http://a", "ws://preassigned"))
            .await
            .unwrap();
        assert_eq!(result.flag_content, "flag{ws://leased}");
        assert_eq!(launcher.pool().status().available, 1);
    }

    #[tokio::test]
    async fn in_process_failure_releases_endpoint() {
        let launcher = in_process(vec!["ws://leased"]);
        let result = launcher
            .launch(&ChallengeTask::new("http://boom", "ws://e"))
            .await
            .unwrap();
        assert!(result.is_exception());
        assert_eq!(launcher.pool().status().available, 1);
    }
}
