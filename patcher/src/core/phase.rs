//! Controller state machine.

use std::fmt;

use serde::Serialize;

/// Run states, in the order a successful run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    SourceReady,
    PovsReproduced,
    AgentRunning,
    PatchCheck,
    Done,
    Fatal,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::SourceReady => "source_ready",
            Phase::PovsReproduced => "povs_reproduced",
            Phase::AgentRunning => "agent_running",
            Phase::PatchCheck => "patch_check",
            Phase::Done => "done",
            Phase::Fatal => "fatal",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Fatal)
    }

    /// Whether `self -> next` is an allowed edge.
    ///
    /// Every non-terminal state may fail into `Fatal`. `SourceReady` may jump
    /// straight to `Done` when there are no POVs to work on.
    pub fn can_advance_to(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Phase::Fatal {
            return true;
        }
        matches!(
            (self, next),
            (Phase::Init, Phase::SourceReady)
                | (Phase::SourceReady, Phase::PovsReproduced)
                | (Phase::SourceReady, Phase::Done)
                | (Phase::PovsReproduced, Phase::AgentRunning)
                | (Phase::AgentRunning, Phase::PatchCheck)
                | (Phase::PatchCheck, Phase::Done)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_edges_are_allowed() {
        let path = [
            Phase::Init,
            Phase::SourceReady,
            Phase::PovsReproduced,
            Phase::AgentRunning,
            Phase::PatchCheck,
            Phase::Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn no_pov_shortcut_is_allowed() {
        assert!(Phase::SourceReady.can_advance_to(Phase::Done));
        assert!(!Phase::Init.can_advance_to(Phase::Done));
    }

    #[test]
    fn terminal_states_absorb() {
        assert!(!Phase::Done.can_advance_to(Phase::Fatal));
        assert!(!Phase::Fatal.can_advance_to(Phase::Init));
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(!Phase::SourceReady.can_advance_to(Phase::AgentRunning));
        assert!(!Phase::PovsReproduced.can_advance_to(Phase::PatchCheck));
    }
}
