//! Agent that runs an operator-supplied shell command.
//!
//! Session context reaches the command through `PATCHER_*` environment
//! variables (`PATCHER_CRASH_LOGS` is a `:`-separated path list); the
//! instruction file and crash logs are written as for any
//! other agent.

use std::process::Command;

use anyhow::{Result, anyhow};
use tracing::{instrument, warn};

use crate::agents::{Agent, AgentSupervisor, PreparedSession, SessionRequest, prepare_session};
use crate::core::types::AgentExit;
use crate::io::config::PatcherConfig;
use crate::io::process::GroupTracker;
use crate::io::workspace::Workspace;

pub const KEY: &str = "command";

#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
    model: String,
    llm_api_url: String,
    llm_api_key: String,
    supervisor: AgentSupervisor,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>, supervisor: AgentSupervisor) -> Self {
        Self {
            command: command.into(),
            model: String::new(),
            llm_api_url: String::new(),
            llm_api_key: String::new(),
            supervisor,
        }
    }

    pub fn from_config(config: &PatcherConfig) -> Result<Self> {
        let command = config
            .agent_command
            .clone()
            .ok_or_else(|| anyhow!("agent '{KEY}' requires PATCHER_AGENT_COMMAND"))?;
        Ok(Self {
            command,
            model: config.model.clone(),
            llm_api_url: config.llm_api_url.clone(),
            llm_api_key: config.llm_api_key.clone(),
            supervisor: AgentSupervisor::from_config(config),
        })
    }

    pub fn tracking(mut self, tracker: GroupTracker) -> Self {
        self.supervisor = self.supervisor.tracking(tracker);
        self
    }

    fn build_command(&self, request: &SessionRequest<'_>, prepared: &PreparedSession) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&request.workspace.root)
            .env("IS_SANDBOX", "1")
            .env("PATCHER_PROMPT", &prepared.prompt)
            .env("PATCHER_INSTRUCTIONS", &prepared.instructions_path)
            .env("PATCHER_WORKSPACE", &request.workspace.root)
            .env("PATCHER_PATCHES_DIR", request.patches_dir)
            .env("PATCHER_SESSION_DIR", &request.session.dir)
            .env("PATCHER_POV_COUNT", request.reports.len().to_string())
            .env("PATCHER_HARNESS", request.harness)
            .env("PATCHER_LANGUAGE", request.language)
            .env("PATCHER_SANITIZER", request.sanitizer)
            .env("PATCHER_BUILDER", request.builder)
            .env("PATCHER_MODEL", &self.model)
            .env("OSS_CRS_LLM_API_URL", &self.llm_api_url)
            .env("OSS_CRS_LLM_API_KEY", &self.llm_api_key);
        match std::env::join_paths(&prepared.crash_logs) {
            Ok(joined) => {
                cmd.env("PATCHER_CRASH_LOGS", joined);
            }
            Err(err) => {
                warn!(err = %err, "crash log paths cannot be joined, PATCHER_CRASH_LOGS unset");
            }
        }
        cmd
    }
}

impl Agent for CommandAgent {
    fn name(&self) -> &str {
        KEY
    }

    fn setup(&self, _workspace: &Workspace) -> Result<()> {
        Ok(())
    }

    #[instrument(skip_all, fields(agent = KEY, povs = request.reports.len()))]
    fn run(&self, request: &SessionRequest<'_>) -> AgentExit {
        let prepared = match prepare_session(request) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "writing session context failed");
                return AgentExit::LaunchFailed(format!("{err:#}"));
            }
        };
        let cmd = self.build_command(request, &prepared);
        self.supervisor.run(
            cmd,
            &request.session.stdout_log(KEY),
            &request.session.stderr_log(KEY),
        )
    }
}
