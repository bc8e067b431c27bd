//! `patcher`: reproduce crashes, run a patching agent, submit its patches.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use submit_watch::WatchConfig;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};

use patcher::agents::{AGENT_KEYS, build_agent};
use patcher::controller::{Controller, RunSummary, ThreadSleeper, preflight};
use patcher::exit_codes;
use patcher::io::config::{PatcherConfig, load_config};
use patcher::io::framework::{DataKind, FrameworkSink, LibCrs};
use patcher::io::git::Git;
use patcher::io::process::GroupTracker;
use patcher::io::prompt::INSTRUCTIONS_FILE;
use patcher::io::workspace::{GitWorkspace, reset_tree};
use patcher::logging;

#[derive(Parser)]
#[command(
    name = "patcher",
    version,
    about = "Reproduce fuzzer crashes and supervise an autonomous patching agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full patching session (default).
    Run {
        /// TOML file with base settings; environment variables override it.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List the registered agent keys accepted by `CRS_AGENT`.
    Agents,
    /// Reset a workspace to its committed baseline.
    Reset {
        /// Repository root.
        dir: PathBuf,
        /// Per git command timeout.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command.unwrap_or(Command::Run { config: None }) {
        Command::Run { config } => cmd_run(config.as_deref()).await,
        Command::Agents => {
            for key in AGENT_KEYS {
                println!("{key}");
            }
            exit_codes::OK
        }
        Command::Reset { dir, timeout_secs } => cmd_reset(&dir, timeout_secs),
    };
    std::process::exit(code);
}

/// How `patcher run` ended.
enum RunEnd {
    Completed(RunSummary),
    /// Stopped by the named signal; agent groups were terminated.
    Interrupted(&'static str),
}

async fn cmd_run(config_path: Option<&Path>) -> i32 {
    match run(config_path).await {
        Ok(RunEnd::Interrupted(signal)) => {
            warn!(signal, "patcher interrupted");
            exit_codes::INTERRUPTED
        }
        Ok(RunEnd::Completed(summary)) => {
            match &summary.session {
                Some(session) => info!(
                    povs = summary.pov_count,
                    outcome = session.outcome.as_str(),
                    "patcher finished"
                ),
                None => info!("patcher finished without POVs"),
            }
            exit_codes::OK
        }
        Err(err) => {
            error!(err = %format!("{err:#}"), "patcher run failed");
            exit_codes::FATAL
        }
    }
}

async fn run(config_path: Option<&Path>) -> Result<RunEnd> {
    let config = load_config(config_path, |key| std::env::var(key).ok())?;
    debug!(?config, "configuration loaded");
    info!(
        target = %config.target,
        harness = %config.harness,
        agent = %config.agent,
        snapshot = %config.snapshot_image,
        "starting patcher"
    );
    preflight(&config)?;

    let framework = Arc::new(LibCrs::new(
        config.framework_bin.clone(),
        config.reproduce_timeout(),
    ));

    let mut watch = WatchConfig::new(config.patches_dir.clone());
    watch.debounce = config.submit_debounce();
    watch.policy = config.submit_policy;
    watch.ledger_path = Some(config.ledger_path());
    let sink = Arc::new(FrameworkSink::new(Arc::clone(&framework), DataKind::Patch));
    let watcher = submit_watch::spawn(watch, sink).context("start submission watcher")?;
    info!(dir = %config.patches_dir.display(), "submission watcher started");

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;

    let groups = GroupTracker::default();
    let kill_grace = config.kill_grace();
    let tracker = groups.clone();
    let mut controller =
        tokio::task::spawn_blocking(move || run_controller(&config, framework, &tracker));

    let stopped_by = tokio::select! {
        joined = &mut controller => {
            let result = joined.context("join controller")?;
            if let Err(err) = watcher.shutdown().await {
                warn!(err = %format!("{err:#}"), "submission watcher stopped with an error");
            }
            return result.map(RunEnd::Completed);
        }
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };

    warn!(signal = stopped_by, "signal received, stopping the agent");
    let terminated = tokio::task::spawn_blocking(move || groups.terminate_all(kill_grace))
        .await
        .context("join group termination")?;
    info!(groups = ?terminated, "agent process groups terminated");
    if let Err(err) = watcher.shutdown().await {
        warn!(err = %format!("{err:#}"), "submission watcher stopped with an error");
    }
    Ok(RunEnd::Interrupted(stopped_by))
}

fn run_controller(
    config: &PatcherConfig,
    framework: Arc<LibCrs>,
    tracker: &GroupTracker,
) -> Result<RunSummary> {
    let workspace = GitWorkspace::new(
        Arc::clone(&framework),
        config.source_dir(),
        config.reset_timeout(),
    )
    .with_exclude(INSTRUCTIONS_FILE);
    let agent = build_agent(config, tracker)?;
    let sleeper = ThreadSleeper;
    let mut controller = Controller::new(config, framework, &workspace, agent.as_ref(), &sleeper);
    controller.run()
}

fn cmd_reset(dir: &Path, timeout_secs: u64) -> i32 {
    let git = Git::new(dir, Duration::from_secs(timeout_secs.max(1)));
    let result = reset_tree(&git).and_then(|()| git.status_porcelain());
    match result {
        Ok(entries) if entries.is_empty() => {
            info!(dir = %dir.display(), "workspace at baseline");
            exit_codes::OK
        }
        Ok(entries) => {
            warn!(dir = %dir.display(), remaining = entries.len(), "workspace still has changes");
            exit_codes::FATAL
        }
        Err(err) => {
            error!(err = %format!("{err:#}"), "reset failed");
            exit_codes::FATAL
        }
    }
}
