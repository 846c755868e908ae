// runner.rs
use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use flagrun_common::{ChallengeItem, ChallengeSource};
use flagrun_orchestrator::{
    BatchScheduler, DriverConfig, EndpointPool, InProcessLauncher, OneShot, PollingDriver,
    ProcessLauncher, SchedulerConfig, TaskLauncher,
};
use flagrun_runner::{CommandWorkflow, MemoryInitGuard, RunnerConfig, SingleTaskRunner};
use flagrun_source::{code_for_url, PlatformClient, PlatformConfig, StaticSource, TargetsFile};
use flagrun_storage::StateStores;

use crate::args::{resolve_endpoints, AgentArgs, RunArgs};
use crate::output::print_results;

pub async fn run(args: RunArgs) -> Result<ExitCode> {
    let steel = std::env::var("STEEL_CONNECT_URL").ok();
    let endpoints = resolve_endpoints(args.endpoints.as_deref(), steel.as_deref());
    let memory_root = args.memory_root();
    let transcript_dir = args.transcript_root();

    info!("Starting flagrun...");
    info!("Endpoints: {}", endpoints.join(", "));
    info!("Max concurrent: {}", args.max_concurrent);
    info!("Task timeout: {}s", args.task_timeout);
    info!("State dir: {}", args.state_dir.display());

    let platform = build_platform(&args.agent)?;
    if args.use_api && platform.is_none() {
        bail!("--use-api needs --api-base or FLAGRUN_API_BASE");
    }

    let init_dir = std::env::temp_dir().join(format!("flagrun-init-{}", Uuid::new_v4()));
    let guard = MemoryInitGuard::shared(&init_dir)
        .with_context(|| format!("failed to create {}", init_dir.display()))?;

    let pool = EndpointPool::new(endpoints)?;
    let launcher: Arc<dyn TaskLauncher> = if args.in_process {
        let runner = build_runner(
            &args.agent,
            &memory_root,
            Some(&transcript_dir),
            Arc::new(guard),
            platform.clone(),
        )?;
        Arc::new(InProcessLauncher::new(Arc::new(runner), pool.clone()))
    } else {
        Arc::new(worker_launcher(&args, &memory_root, &transcript_dir, &init_dir)?)
    };

    let scheduler = Arc::new(BatchScheduler::new(
        launcher,
        pool.endpoints().to_vec(),
        SchedulerConfig {
            max_concurrent: args.max_concurrent,
            task_timeout: Duration::from_secs(args.task_timeout),
            stagger: Duration::from_millis(args.stagger_ms),
            ..SchedulerConfig::default()
        },
    )?);
    install_signal_handlers(&scheduler);

    let driver = PollingDriver::new(
        scheduler.clone(),
        StateStores::new(&args.state_dir),
        DriverConfig {
            threshold: args.threshold,
            poll_interval: Duration::from_secs(args.poll_interval),
            hint_last_hour: args.hints_enabled(),
        },
    );

    let code = if args.watch {
        let source: Arc<dyn ChallengeSource> = platform
            .clone()
            .ok_or_else(|| anyhow!("watch mode needs the platform API"))?;
        driver.watch(source.as_ref(), scheduler.shutdown_signal()).await;
        ExitCode::SUCCESS
    } else {
        let source = build_source(&args, platform)?;
        let items = match source.fetch().await {
            Ok(items) => items,
            Err(e) => {
                warn!("Loading targets from {} failed: {}", source.name(), e);
                Vec::new()
            }
        };
        info!("Loaded {} targets from {}", items.len(), source.name());

        let started = Instant::now();
        let outcome = driver.execute_once(items).await;
        if let OneShot::Ran { results, .. } = &outcome {
            print_results(results, &args.output, started.elapsed())?;
        }
        if scheduler.is_closed() {
            ExitCode::from(130)
        } else {
            ExitCode::from(outcome.exit_code() as u8)
        }
    };

    scheduler.close();
    if let Err(e) = std::fs::remove_dir_all(&init_dir) {
        warn!("Could not remove {}: {}", init_dir.display(), e);
    }
    Ok(code)
}

/// Ctrl-C and SIGTERM both close the pool.
fn install_signal_handlers(scheduler: &Arc<BatchScheduler>) {
    let on_interrupt = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, shutting down");
            on_interrupt.close();
        }
    });

    #[cfg(unix)]
    {
        let on_terminate = scheduler.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut term) = signal(SignalKind::terminate()) else {
                return;
            };
            if term.recv().await.is_some() {
                warn!("SIGTERM received, shutting down");
                on_terminate.close();
            }
        });
    }
}

/// Where one-shot targets come from: the platform, a single URL, or the
/// targets file.
fn build_source(
    args: &RunArgs,
    platform: Option<Arc<PlatformClient>>,
) -> Result<Arc<dyn ChallengeSource>> {
    if args.use_api {
        return platform
            .map(|p| p as Arc<dyn ChallengeSource>)
            .ok_or_else(|| anyhow!("platform API is not configured"));
    }
    if let Some(url) = &args.url {
        let code = args.code.clone().unwrap_or_else(|| code_for_url(url));
        let item = ChallengeItem::new(url.as_str()).with_code(code);
        return Ok(Arc::new(StaticSource::new(vec![item])));
    }
    Ok(Arc::new(TargetsFile::new(&args.targets)))
}

pub(crate) fn build_platform(agent: &AgentArgs) -> Result<Option<Arc<PlatformClient>>> {
    let Some(base) = agent.api_base.as_deref().filter(|b| !b.trim().is_empty()) else {
        return Ok(None);
    };
    let config = PlatformConfig {
        token: agent.api_token.clone(),
        debug: agent.debug,
        ..PlatformConfig::new(base)
    };
    let client = PlatformClient::new(config).context("failed to set up platform client")?;
    Ok(Some(Arc::new(client)))
}

pub(crate) fn build_runner(
    agent: &AgentArgs,
    memory_root: &Path,
    transcript_dir: Option<&Path>,
    guard: Arc<MemoryInitGuard>,
    platform: Option<Arc<PlatformClient>>,
) -> Result<SingleTaskRunner> {
    if agent.agent_command.trim().is_empty() {
        bail!("agent command is empty");
    }
    let mut workflow =
        CommandWorkflow::new(&agent.agent_command, memory_root).with_args(agent.agent_args.clone());
    if let Some(dir) = transcript_dir {
        workflow = workflow.with_transcripts(dir);
    }

    let config = RunnerConfig {
        debug: agent.debug,
        auto_submit: agent.auto_submit,
        ..RunnerConfig::default()
    };
    let mut runner = SingleTaskRunner::new(Arc::new(workflow), guard, config);
    if let Some(platform) = platform {
        runner = runner.with_hints(platform.clone()).with_submitter(platform);
    }
    Ok(runner)
}

/// Worker processes re-run this binary; everything they need goes on the
/// command line except the API token.
fn worker_launcher(
    args: &RunArgs,
    memory_root: &Path,
    transcript_dir: &Path,
    init_dir: &Path,
) -> Result<ProcessLauncher> {
    let mut launcher =
        ProcessLauncher::current_exe()?.args(worker_args(args, memory_root, transcript_dir, init_dir));
    if let Some(token) = &args.agent.api_token {
        launcher = launcher.env("FLAGRUN_API_TOKEN", token.as_str());
    }
    Ok(launcher)
}

fn worker_args(args: &RunArgs, memory_root: &Path, transcript_dir: &Path, init_dir: &Path) -> Vec<String> {
    let mut out = vec![
        "--memory-dir".to_string(),
        memory_root.display().to_string(),
        "--transcript-dir".to_string(),
        transcript_dir.display().to_string(),
        "--init-dir".to_string(),
        init_dir.display().to_string(),
        "--agent-command".to_string(),
        args.agent.agent_command.clone(),
    ];
    out.extend(args.agent.agent_args.iter().map(|a| format!("--agent-arg={}", a)));
    if let Some(base) = &args.agent.api_base {
        out.push("--api-base".to_string());
        out.push(base.clone());
    }
    if args.agent.debug {
        out.push("--debug".to_string());
    }
    if args.agent.auto_submit {
        out.push("--auto-submit".to_string());
    }
    out
}
