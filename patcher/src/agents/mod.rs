//! Patching agents and the registry that selects one by configuration key.
//!
//! An agent gets one session per run: it is handed the workspace, the crash
//! evidence and the patch directory, and is expected to leave zero or more
//! `*.diff` files behind. Agents never decide the session outcome themselves;
//! the controller does that by looking at the patch directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::core::types::{AgentExit, CrashReport, ReferenceDiff};
use crate::io::config::PatcherConfig;
use crate::io::process::GroupTracker;
use crate::io::prompt::{INSTRUCTIONS_FILE, InstructionInputs, render_instructions, render_prompt};
use crate::io::session_log::SessionPaths;
use crate::io::workspace::Workspace;

pub mod command;
pub mod copilot;
pub mod supervisor;

pub use command::CommandAgent;
pub use copilot::CopilotCli;
pub use supervisor::AgentSupervisor;

/// Registry keys accepted in `CRS_AGENT`.
pub const AGENT_KEYS: &[&str] = &[copilot::KEY, command::KEY];

/// A directory the agent wants shared with other containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedDir {
    pub path: PathBuf,
    pub label: String,
}

/// Inputs for one agent session.
#[derive(Debug, Clone)]
pub struct SessionRequest<'a> {
    pub workspace: &'a Workspace,
    /// Crash evidence in POV order.
    pub reports: &'a [CrashReport],
    pub harness: &'a str,
    pub patches_dir: &'a Path,
    pub session: &'a SessionPaths,
    pub language: &'a str,
    pub sanitizer: &'a str,
    pub builder: &'a str,
    pub framework_bin: &'a str,
    pub reference_diff: Option<&'a ReferenceDiff>,
}

/// An external patching agent.
pub trait Agent {
    /// Registry key, also used as the log file prefix.
    fn name(&self) -> &str;

    /// Directories to register with the framework before setup.
    fn shared_dirs(&self) -> Vec<SharedDir> {
        Vec::new()
    }

    /// One-time configuration before any session.
    fn setup(&self, workspace: &Workspace) -> Result<()>;

    /// Run one session to completion. Failures are reported through the exit value.
    fn run(&self, request: &SessionRequest<'_>) -> AgentExit;
}

/// Context files written before launch.
#[derive(Debug, Clone)]
pub struct PreparedSession {
    pub crash_logs: Vec<PathBuf>,
    pub instructions_path: PathBuf,
    /// Short prompt for the command line.
    pub prompt: String,
}

/// Write crash logs into the session dir and the instruction file into the workspace.
pub fn prepare_session(request: &SessionRequest<'_>) -> Result<PreparedSession> {
    let session_dir = &request.session.dir;
    fs::create_dir_all(session_dir)
        .with_context(|| format!("create session dir {}", session_dir.display()))?;

    let mut crash_logs = Vec::with_capacity(request.reports.len());
    let mut povs = Vec::with_capacity(request.reports.len());
    for (index, report) in request.reports.iter().enumerate() {
        let path = request.session.crash_log(index);
        fs::write(&path, &report.text).with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), "crash log written");
        povs.push((report.pov.clone(), path.clone()));
        crash_logs.push(path);
    }

    let instructions = render_instructions(&InstructionInputs {
        povs: &povs,
        harness: request.harness,
        patches_dir: request.patches_dir,
        session_dir,
        language: request.language,
        sanitizer: request.sanitizer,
        builder: request.builder,
        framework_bin: request.framework_bin,
        reference_diff: request.reference_diff,
    })?;
    let instructions_path = request.workspace.root.join(INSTRUCTIONS_FILE);
    fs::write(&instructions_path, instructions)
        .with_context(|| format!("write {}", instructions_path.display()))?;

    let prompt = render_prompt(request.reports.len(), session_dir)?;
    info!(
        povs = request.reports.len(),
        delta_mode = request.reference_diff.is_some(),
        "session context written"
    );
    Ok(PreparedSession {
        crash_logs,
        instructions_path,
        prompt,
    })
}

/// Build the agent named by `config.agent`. Its process groups are registered in `tracker`.
pub fn build_agent(config: &PatcherConfig, tracker: &GroupTracker) -> Result<Box<dyn Agent>> {
    match config.agent.as_str() {
        copilot::KEY => Ok(Box::new(
            CopilotCli::from_config(config).tracking(tracker.clone()),
        )),
        command::KEY => Ok(Box::new(
            CommandAgent::from_config(config)?.tracking(tracker.clone()),
        )),
        other => Err(anyhow!(
            "unknown agent '{other}' (expected one of: {})",
            AGENT_KEYS.join(", ")
        )),
    }
}
