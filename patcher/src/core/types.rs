//! Shared deterministic types for patcher core logic.
//!
//! These types define stable contracts between the controller, the crash
//! reproducer and the agent supervisor. They carry no I/O.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Terminal outcome of one agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionOutcome {
    /// At least one patch file appeared, whatever the exit status.
    PatchProduced,
    /// The agent finished but wrote nothing.
    NoPatch,
    /// The agent could not be launched or waited on.
    ProcessError,
    /// The session budget elapsed and the process group was terminated.
    TimedOut,
}

impl SessionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionOutcome::PatchProduced => "patch-produced",
            SessionOutcome::NoPatch => "no-patch",
            SessionOutcome::ProcessError => "process-error",
            SessionOutcome::TimedOut => "timed-out",
        }
    }
}

/// How the agent process ended, before looking at the patch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    /// Process exited on its own. `None` means it was killed by a signal.
    Exited(Option<i32>),
    /// Budget elapsed; the group was terminated.
    TimedOut,
    /// Spawn or wait failed.
    LaunchFailed(String),
}

impl AgentExit {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            AgentExit::Exited(code) => *code,
            _ => None,
        }
    }
}

/// Evidence for one POV, ready to embed into agent instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub pov: PathBuf,
    /// Exit code returned by the sidecar, when it ran at all.
    pub exit_code: Option<i32>,
    /// Rendered, size-bounded report text.
    pub text: String,
}

/// The change suspected of introducing the bug (delta mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDiff {
    pub text: String,
    /// Files touched by the diff, in header order.
    pub changed_files: Vec<String>,
}

impl ReferenceDiff {
    pub fn parse(text: impl Into<String>) -> Self {
        let text = text.into();
        let changed_files = crate::core::ref_diff::changed_files(&text);
        Self {
            text,
            changed_files,
        }
    }
}
