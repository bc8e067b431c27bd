//! Orchestration controller: one run, one agent session for the whole POV group.
//!
//! The controller is strictly sequential. It owns the workspace for the whole
//! run; the submission watcher runs elsewhere and only shares the patch
//! directory with it.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::agents::{Agent, SessionRequest, SharedDir};
use crate::core::outcome::classify_session;
use crate::core::phase::Phase;
use crate::core::types::{AgentExit, CrashReport, ReferenceDiff, SessionOutcome};
use crate::io::config::PatcherConfig;
use crate::io::crash::CrashReproducer;
use crate::io::framework::{DataKind, Framework};
use crate::io::inputs::{
    PatchSnapshot, discover_povs, new_patches, read_reference_diff, snapshot_patches,
};
use crate::io::session_log::{SessionPaths, SessionRecord, rfc3339, write_session_record};
use crate::io::workspace::{Workspace, WorkspaceManager};

/// Blocking sleep, abstracted so tests can observe the flush wait.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Result of the agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub outcome: SessionOutcome,
    pub exit: AgentExit,
    /// Patch files that appeared during the session.
    pub patches: Vec<PathBuf>,
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub pov_count: usize,
    /// `None` when there was nothing to work on.
    pub session: Option<SessionSummary>,
}

impl RunSummary {
    pub fn patch_produced(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.outcome == SessionOutcome::PatchProduced)
    }
}

/// Checks that must pass before anything else starts, including the watcher.
pub fn preflight(config: &PatcherConfig) -> Result<()> {
    if config.snapshot_image.trim().is_empty() {
        return Err(anyhow!(
            "OSS_CRS_SNAPSHOT_IMAGE is not set; the target build must be snapshotted for the builder sidecar"
        ));
    }
    Ok(())
}

pub struct Controller<'a, F, W, S> {
    config: &'a PatcherConfig,
    framework: Arc<F>,
    workspace: &'a W,
    agent: &'a dyn Agent,
    sleeper: &'a S,
    phase: Phase,
}

impl<'a, F, W, S> Controller<'a, F, W, S>
where
    F: Framework,
    W: WorkspaceManager,
    S: Sleeper,
{
    pub fn new(
        config: &'a PatcherConfig,
        framework: Arc<F>,
        workspace: &'a W,
        agent: &'a dyn Agent,
        sleeper: &'a S,
    ) -> Self {
        Self {
            config,
            framework,
            workspace,
            agent,
            sleeper,
            phase: Phase::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drive the run to `Done`, or to `Fatal` on any setup failure.
    #[instrument(skip_all, fields(target = %self.config.target, harness = %self.config.harness, agent = self.agent.name()))]
    pub fn run(&mut self) -> Result<RunSummary> {
        match self.drive() {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.advance(Phase::Fatal);
                Err(err)
            }
        }
    }

    fn advance(&mut self, next: Phase) {
        if !self.phase.can_advance_to(next) {
            warn!(from = %self.phase, to = %next, "unexpected state transition");
        }
        info!(from = %self.phase, state = %next, "state transition");
        self.phase = next;
    }

    fn drive(&mut self) -> Result<RunSummary> {
        let config = self.config;
        fs::create_dir_all(&config.patches_dir)
            .with_context(|| format!("create directory {}", config.patches_dir.display()))?;

        let fetched = self
            .framework
            .fetch(DataKind::Pov, &config.povs_dir())
            .context("fetch POVs")?;
        info!(count = fetched.len(), dir = %config.povs_dir().display(), "POVs fetched");

        match self.framework.fetch(DataKind::Diff, &config.diffs_dir()) {
            Ok(files) if !files.is_empty() => info!(count = files.len(), "diffs fetched"),
            Ok(_) => {}
            Err(err) => {
                warn!(err = %format!("{err:#}"), "diff fetch failed, delta mode unavailable");
            }
        }

        for shared in self.agent.shared_dirs() {
            self.register_shared_dir(&shared);
        }

        let workspace = self.workspace.acquire().context("acquire workspace")?;
        info!(root = %workspace.root.display(), "source ready");
        self.advance(Phase::SourceReady);

        self.agent
            .setup(&workspace)
            .with_context(|| format!("set up agent '{}'", self.agent.name()))?;

        let povs = discover_povs(&config.povs_dir())?;
        if povs.is_empty() {
            warn!(dir = %config.povs_dir().display(), "no POV files found, nothing to do");
            self.advance(Phase::Done);
            return Ok(RunSummary {
                pov_count: 0,
                session: None,
            });
        }
        info!(count = povs.len(), "POVs discovered");

        let reference_diff = read_reference_diff(&config.reference_diff_path());

        let address = self
            .framework
            .resolve_service(&config.builder_module)
            .with_context(|| format!("resolve builder sidecar '{}'", config.builder_module))?;
        info!(builder = %config.builder_module, %address, "builder sidecar resolved");

        let reproducer = CrashReproducer::new(
            Arc::clone(&self.framework),
            config.harness.clone(),
            config.builder_module.clone(),
            config.reproduce_dir(),
            config.max_crash_log_chars,
            config.reproduce_timeout(),
        );
        let reports = reproducer.reproduce_all(&povs);
        self.advance(Phase::PovsReproduced);

        self.workspace
            .reset(&workspace)
            .context("reset workspace before session")?;
        self.advance(Phase::AgentRunning);

        let session = self.run_session(&workspace, &reports, reference_diff.as_ref());

        if let Err(err) = self.workspace.reset(&workspace) {
            warn!(err = %format!("{err:#}"), "reset after session failed");
        }
        self.advance(Phase::PatchCheck);

        if session.patches.is_empty() {
            info!(outcome = session.outcome.as_str(), "no patch produced");
        } else {
            let names = patch_names(&session.patches);
            let message = if names.len() > 1 {
                "multiple patches produced, each one is submitted and cannot be withdrawn"
            } else {
                "patch produced, submission cannot be withdrawn"
            };
            warn!(patches = ?names, policy = %config.submit_policy, "{message}");
            info!(
                wait_secs = config.flush_wait_secs,
                "waiting for submission watcher to flush"
            );
            self.sleeper.sleep(config.flush_wait());
        }
        self.advance(Phase::Done);

        Ok(RunSummary {
            pov_count: povs.len(),
            session: Some(session),
        })
    }

    /// Register a shared directory. The framework creates it as a link, so
    /// whatever sits at the path is removed first. Failure is not fatal.
    fn register_shared_dir(&self, shared: &SharedDir) {
        let path = &shared.path;
        let removed = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(_) => Ok(()),
        };
        if let Err(err) = removed {
            warn!(path = %path.display(), err = %err, "cannot clear shared dir path");
        }

        match self.framework.register_shared_dir(path, &shared.label) {
            Ok(()) => {
                info!(path = %path.display(), label = %shared.label, "shared dir registered");
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    label = %shared.label,
                    err = %format!("{err:#}"),
                    "shared dir registration failed, using a local directory"
                );
                if let Err(err) = fs::create_dir_all(path) {
                    warn!(path = %path.display(), err = %err, "cannot create shared dir");
                }
            }
        }
    }

    fn run_session(
        &self,
        workspace: &Workspace,
        reports: &[CrashReport],
        reference_diff: Option<&ReferenceDiff>,
    ) -> SessionSummary {
        let config = self.config;
        let paths = SessionPaths::new(&config.session_dir());
        let before = snapshot_patches(&config.patches_dir).unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "cannot list patches before session");
            PatchSnapshot::new()
        });

        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            povs = reports.len(),
            timeout_secs = config.agent_timeout_secs,
            "agent session starting"
        );
        let exit = self.agent.run(&SessionRequest {
            workspace,
            reports,
            harness: &config.harness,
            patches_dir: &config.patches_dir,
            session: &paths,
            language: &config.language,
            sanitizer: &config.sanitizer,
            builder: &config.builder_module,
            framework_bin: &config.framework_bin,
            reference_diff,
        });
        let duration = started.elapsed();
        let ended_at = Utc::now();

        let after = snapshot_patches(&config.patches_dir).unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "cannot list patches after session");
            PatchSnapshot::new()
        });
        let patches = new_patches(&before, after);
        let outcome = classify_session(&exit, patches.len());
        info!(
            outcome = outcome.as_str(),
            exit_code = ?exit.exit_code(),
            patches = patches.len(),
            duration_secs = duration.as_secs(),
            "agent session finished"
        );

        let record = SessionRecord {
            agent: self.agent.name().to_string(),
            pov_count: reports.len(),
            started_at: rfc3339(started_at),
            ended_at: rfc3339(ended_at),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            exit_code: exit.exit_code(),
            timed_out: exit == AgentExit::TimedOut,
            outcome,
            patches: patch_names(&patches),
        };
        if let Err(err) = write_session_record(&paths, &record) {
            warn!(err = %format!("{err:#}"), "cannot write session record");
        }

        SessionSummary {
            outcome,
            exit,
            patches,
        }
    }
}

fn patch_names(patches: &[PathBuf]) -> Vec<String> {
    patches
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect()
}
