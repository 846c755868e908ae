use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:13001";

#[derive(Parser)]
#[command(name = "flagrun")]
#[command(version)]
#[command(about = "Batch runner for automated CTF challenge solving", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run challenges once, or keep polling the platform with --watch
    Run(RunArgs),

    /// Execute one task read from stdin and print its result
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Show persisted failure counters and processed challenges
    Status {
        /// Directory holding the state files
        #[arg(long, default_value = "logs")]
        state_dir: PathBuf,

        /// Output format: text, json
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        output: String,
    },
}

/// Agent and platform settings shared by the parent and its workers.
#[derive(Args, Clone)]
pub struct AgentArgs {
    /// Agent program
    #[arg(long, env = "FLAGRUN_AGENT", default_value = "flagrun-agent")]
    pub agent_command: String,

    /// Argument passed to the agent program (repeatable)
    #[arg(long = "agent-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub agent_args: Vec<String>,

    /// Debug mode: keep solved challenges, fetch hints at any time
    #[arg(long)]
    pub debug: bool,

    /// Submit found flags to the platform
    #[arg(long)]
    pub auto_submit: bool,

    /// Platform API base URL
    #[arg(long, env = "FLAGRUN_API_BASE")]
    pub api_base: Option<String>,

    /// Platform API bearer token
    #[arg(long, env = "FLAGRUN_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Single challenge URL
    #[arg(long, conflicts_with = "use_api")]
    pub url: Option<String>,

    /// Challenge code for --url (defaults to the md5 of the URL)
    #[arg(long, requires = "url")]
    pub code: Option<String>,

    /// File with one challenge URL per line
    #[arg(long, default_value = "targets.txt")]
    pub targets: PathBuf,

    /// Fetch challenges from the platform API
    #[arg(long)]
    pub use_api: bool,

    /// Keep polling the platform for new challenges
    #[arg(long, requires = "use_api")]
    pub watch: bool,

    /// Seconds between platform polls
    #[arg(long, default_value = "30")]
    pub poll_interval: u64,

    /// Max concurrent workers
    #[arg(short = 'c', long, default_value = "1")]
    pub max_concurrent: usize,

    /// Fetch hints during the competition's last hour (default)
    #[arg(long, overrides_with = "no_hint")]
    pub hint_last_hour: bool,

    /// Never fetch hints
    #[arg(long, overrides_with = "hint_last_hour")]
    pub no_hint: bool,

    /// Per-task timeout in seconds
    #[arg(long, default_value = "1700")]
    pub task_timeout: u64,

    /// Milliseconds between worker launches (0 disables)
    #[arg(long, default_value = "1000")]
    pub stagger_ms: u64,

    /// Skip challenges that failed this many times
    #[arg(long, default_value = "100")]
    pub threshold: u32,

    /// Browser CDP endpoints, comma separated
    #[arg(long, env = "CDP_URLS")]
    pub endpoints: Option<String>,

    /// Directory for failure counters and processed challenges
    #[arg(long, default_value = "logs")]
    pub state_dir: PathBuf,

    /// Root of the per-challenge memory directories (default <state-dir>/memory)
    #[arg(long)]
    pub memory_dir: Option<PathBuf>,

    /// Run tasks on this process instead of worker processes
    #[arg(long)]
    pub in_process: bool,

    /// Output format: text, json
    #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    #[command(flatten)]
    pub agent: AgentArgs,
}

impl RunArgs {
    /// Hints are on unless `--no-hint` was the last word.
    pub fn hints_enabled(&self) -> bool {
        self.hint_last_hour || !self.no_hint
    }

    pub fn transcript_root(&self) -> PathBuf {
        self.state_dir.join("transcripts")
    }

    pub fn memory_root(&self) -> PathBuf {
        self.memory_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("memory"))
    }
}

#[derive(Args, Clone)]
pub struct WorkerArgs {
    /// Root of the per-challenge memory directories
    #[arg(long)]
    pub memory_dir: PathBuf,

    /// Marker directory shared by the workers of one pool
    #[arg(long)]
    pub init_dir: Option<PathBuf>,

    /// Where agent transcripts are kept
    #[arg(long)]
    pub transcript_dir: Option<PathBuf>,

    #[command(flatten)]
    pub agent: AgentArgs,
}

/// Comma separated list, falling back to `fallback` and then the local default.
/// Repeated endpoints are kept once, first occurrence wins.
pub fn resolve_endpoints(explicit: Option<&str>, fallback: Option<&str>) -> Vec<String> {
    let split = |raw: &str| -> Vec<String> {
        let mut endpoints: Vec<String> = Vec::new();
        for endpoint in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if !endpoints.iter().any(|seen| seen == endpoint) {
                endpoints.push(endpoint.to_string());
            }
        }
        endpoints
    };
    for candidate in [explicit, fallback].into_iter().flatten() {
        let endpoints = split(candidate);
        if !endpoints.is_empty() {
            return endpoints;
        }
    }
    vec![DEFAULT_ENDPOINT.to_string()]
}
