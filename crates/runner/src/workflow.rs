// crates/runner/src/workflow.rs
//! Attack workflow backed by an external agent command

use async_trait::async_trait;
use chrono::Local;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use flagrun_common::{AttackRequest, AttackWorkflow, FlagrunError, FlagrunResult};

const STDERR_TAIL: usize = 512;

/// Runs the agent as a child process. The request is passed through
/// `FLAGRUN_*` environment variables and the agent's stdout is the workflow
/// output. Each challenge gets its own memory directory under
/// `memory_root`.
pub struct CommandWorkflow {
    program: PathBuf,
    args: Vec<String>,
    memory_root: PathBuf,
    transcript_root: Option<PathBuf>,
}

impl CommandWorkflow {
    pub fn new(program: impl Into<PathBuf>, memory_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            memory_root: memory_root.into(),
            transcript_root: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Keep every agent run's stdout and stderr under
    /// `<dir>/<YYYY-MM-DD>/<key>.log`.
    pub fn with_transcripts(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transcript_root = Some(dir.into());
        self
    }

    /// Memory directory for a challenge key.
    pub fn memory_dir(&self, key: &str) -> PathBuf {
        self.memory_root.join(safe_name(key))
    }

    /// Today's transcript file for a challenge key, if transcripts are on.
    pub fn transcript_path(&self, key: &str) -> Option<PathBuf> {
        let day = Local::now().format("%Y-%m-%d").to_string();
        self.transcript_root
            .as_ref()
            .map(|root| root.join(day).join(format!("{}.log", safe_name(key))))
    }

    /// Appends one run to the transcript. Failures only cost the log.
    async fn save_transcript(&self, request: &AttackRequest, output: &Output) {
        let Some(path) = self.transcript_path(&request.key) else {
            return;
        };
        let mut entry = format!(
            "=== {} url={} endpoint={} {}\n--- stdout ---\n",
            Local::now().to_rfc3339(),
            request.url,
            request.cdp_endpoint,
            output.status
        )
        .into_bytes();
        entry.extend_from_slice(&output.stdout);
        entry.extend_from_slice(b"\n--- stderr ---\n");
        entry.extend_from_slice(&output.stderr);
        entry.push(b'\n');

        let written = async {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(&entry).await
        };
        if let Err(e) = written.await {
            warn!(path = %path.display(), "Could not write agent transcript: {}", e);
        }
    }
}

fn safe_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl AttackWorkflow for CommandWorkflow {
    #[instrument(skip(self, request), fields(key = %request.key))]
    async fn execute(&self, request: &AttackRequest) -> FlagrunResult<String> {
        let memory_dir = self.memory_dir(&request.key);
        tokio::fs::create_dir_all(&memory_dir).await?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("FLAGRUN_URL", &request.url)
            .env("FLAGRUN_CODE", request.code.as_deref().unwrap_or(""))
            .env("FLAGRUN_HINT", request.hint.as_deref().unwrap_or(""))
            .env("FLAGRUN_FAILURE_COUNTS", request.failure_counts.to_string())
            .env("FLAGRUN_CDP_ENDPOINT", &request.cdp_endpoint)
            .env("FLAGRUN_MEMORY_DIR", &memory_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program.display(), "spawning agent");
        let output = cmd.output().await.map_err(|e| {
            FlagrunError::Workflow(format!("failed to spawn {}: {}", self.program.display(), e))
        })?;
        self.save_transcript(request, &output).await;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let tail_start = stderr
                .char_indices()
                .rev()
                .nth(STDERR_TAIL - 1)
                .map(|(i, _)| i)
                .unwrap_or(0);
            return Err(FlagrunError::Workflow(format!(
                "agent exited with {}: {}",
                output.status,
                &stderr[tail_start..]
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn reset_memory(&self, key: &str) -> FlagrunResult<()> {
        match tokio::fs::remove_dir_all(self.memory_dir(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        "command"
    }
}
