//! Session outcome classification.

use crate::core::types::{AgentExit, SessionOutcome};

/// Classify a finished session.
///
/// Patch presence is the only success signal: an agent may exit non-zero and
/// still have written a valid patch, or exit zero having written nothing.
pub fn classify_session(exit: &AgentExit, patches_found: usize) -> SessionOutcome {
    if patches_found > 0 {
        return SessionOutcome::PatchProduced;
    }
    match exit {
        AgentExit::TimedOut => SessionOutcome::TimedOut,
        AgentExit::LaunchFailed(_) => SessionOutcome::ProcessError,
        AgentExit::Exited(_) => SessionOutcome::NoPatch,
    }
}
