//! Bounded agent process supervision.
//!
//! The agent runs in its own process group with stdout/stderr going to log
//! files. On timeout the whole group is terminated, so helpers the agent
//! spawned (compilers, test runs, shells) do not outlive the session.

use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::AgentExit;
use crate::io::config::PatcherConfig;
use crate::io::process::{GroupTracker, group_has_members, terminate_group};

/// Launches one agent process and waits for it under the session budget.
#[derive(Debug, Clone)]
pub struct AgentSupervisor {
    budget: Option<Duration>,
    grace: Duration,
    tracker: GroupTracker,
}

impl AgentSupervisor {
    /// `budget: None` waits indefinitely.
    pub fn new(budget: Option<Duration>, grace: Duration) -> Self {
        Self {
            budget,
            grace,
            tracker: GroupTracker::default(),
        }
    }

    pub fn from_config(config: &PatcherConfig) -> Self {
        Self::new(config.session_budget(), config.kill_grace())
    }

    /// Register running agent groups in `tracker` so a shutdown can kill them.
    pub fn tracking(mut self, tracker: GroupTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Spawn `cmd` and wait for it. Never fails: launch errors become
    /// [`AgentExit::LaunchFailed`].
    #[instrument(skip_all, fields(timeout_secs = self.budget.map(|b| b.as_secs()).unwrap_or(0)))]
    pub fn run(&self, mut cmd: Command, stdout_log: &Path, stderr_log: &Path) -> AgentExit {
        let mut child = match spawn_logged(&mut cmd, stdout_log, stderr_log) {
            Ok(child) => child,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "agent launch failed");
                return AgentExit::LaunchFailed(format!("{err:#}"));
            }
        };
        info!(pid = child.id(), "agent started");
        if let Err(err) = self.tracker.track(&child) {
            warn!(err = %format!("{err:#}"), "cannot track agent process group");
        }
        let started = Instant::now();

        let waited = self.wait(&mut child);
        let exit = match waited {
            Ok(exit) => exit,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "waiting on agent failed");
                if let Err(kill_err) = terminate_group(&mut child, self.grace) {
                    warn!(err = %format!("{kill_err:#}"), "terminating agent group failed");
                }
                self.tracker.untrack(&child);
                return AgentExit::LaunchFailed(format!("{err:#}"));
            }
        };
        self.tracker.untrack(&child);

        let elapsed_secs = started.elapsed().as_secs();
        match &exit {
            AgentExit::Exited(Some(0)) => info!(elapsed_secs, "agent exited cleanly"),
            AgentExit::Exited(code) => {
                warn!(
                    exit_code = ?code,
                    elapsed_secs,
                    stderr_log = %stderr_log.display(),
                    "agent exited with failure"
                );
            }
            AgentExit::TimedOut => warn!(elapsed_secs, "agent timed out, process group terminated"),
            AgentExit::LaunchFailed(_) => {}
        }
        exit
    }

    fn wait(&self, child: &mut Child) -> Result<AgentExit> {
        let Some(budget) = self.budget else {
            let status = child.wait().context("wait for agent")?;
            self.sweep_group(child);
            return Ok(AgentExit::Exited(status.code()));
        };

        match child.wait_timeout(budget).context("wait for agent")? {
            Some(status) => {
                self.sweep_group(child);
                Ok(AgentExit::Exited(status.code()))
            }
            None => {
                warn!(timeout_secs = budget.as_secs(), "agent exceeded session budget");
                terminate_group(child, self.grace)?;
                Ok(AgentExit::TimedOut)
            }
        }
    }

    /// Terminate background processes the agent left behind after exiting.
    fn sweep_group(&self, child: &mut Child) {
        match group_has_members(child) {
            Ok(false) => {}
            Ok(true) => {
                warn!("agent left processes running, terminating group");
                if let Err(err) = terminate_group(child, self.grace) {
                    warn!(err = %format!("{err:#}"), "terminating leftover processes failed");
                }
            }
            Err(err) => warn!(err = %format!("{err:#}"), "probing agent group failed"),
        }
    }
}

fn spawn_logged(cmd: &mut Command, stdout_log: &Path, stderr_log: &Path) -> Result<Child> {
    for log in [stdout_log, stderr_log] {
        if let Some(parent) = log.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
    }
    let stdout = File::create(stdout_log)
        .with_context(|| format!("create {}", stdout_log.display()))?;
    let stderr = File::create(stderr_log)
        .with_context(|| format!("create {}", stderr_log.display()))?;
    cmd.stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0);
    cmd.spawn()
        .with_context(|| format!("spawn {}", cmd.get_program().to_string_lossy()))
}
