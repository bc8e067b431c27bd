//! GitHub Copilot CLI in non-interactive mode.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::agents::{Agent, AgentSupervisor, SessionRequest, SharedDir, prepare_session};
use crate::core::types::AgentExit;
use crate::io::config::PatcherConfig;
use crate::io::process::GroupTracker;
use crate::io::workspace::Workspace;

pub const KEY: &str = "copilot_cli";

const BINARY: &str = "copilot";
const HOME_LABEL: &str = "copilot-home";
const TOKEN_VARS: &[&str] = &["COPILOT_GITHUB_TOKEN", "GH_TOKEN", "GITHUB_TOKEN"];

#[derive(Debug, Serialize)]
struct CopilotSettings<'a> {
    model: &'a str,
    #[serde(rename = "baseUrl")]
    base_url: &'a str,
}

/// Runs `copilot -p <prompt> --model <model> --yolo` in the workspace.
#[derive(Debug, Clone)]
pub struct CopilotCli {
    binary: String,
    model: String,
    llm_api_url: String,
    llm_api_key: String,
    home: PathBuf,
    supervisor: AgentSupervisor,
}

impl CopilotCli {
    pub fn from_config(config: &PatcherConfig) -> Self {
        Self {
            binary: BINARY.to_string(),
            model: config.model.clone(),
            llm_api_url: config.llm_api_url.clone(),
            llm_api_key: config.llm_api_key.clone(),
            home: config.home_dir.join(".copilot"),
            supervisor: AgentSupervisor::from_config(config),
        }
    }

    pub fn tracking(mut self, tracker: GroupTracker) -> Self {
        self.supervisor = self.supervisor.tracking(tracker);
        self
    }

    /// Use a different executable (tests, pinned installs).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command(&self, request: &SessionRequest<'_>, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(prompt)
            .arg("--model")
            .arg(&self.model)
            .arg("--yolo")
            .current_dir(&request.workspace.root)
            .env("IS_SANDBOX", "1");
        if !self.llm_api_key.is_empty() {
            for var in TOKEN_VARS {
                cmd.env(var, &self.llm_api_key);
            }
        }
        cmd
    }
}

impl Agent for CopilotCli {
    fn name(&self) -> &str {
        KEY
    }

    fn shared_dirs(&self) -> Vec<SharedDir> {
        vec![SharedDir {
            path: self.home.clone(),
            label: HOME_LABEL.to_string(),
        }]
    }

    #[instrument(skip_all, fields(agent = KEY, model = %self.model))]
    fn setup(&self, _workspace: &Workspace) -> Result<()> {
        fs::create_dir_all(&self.home)
            .with_context(|| format!("create directory {}", self.home.display()))?;

        if self.llm_api_url.is_empty() || self.llm_api_key.is_empty() {
            info!("no LLM endpoint configured, copilot uses its own subscription");
            return Ok(());
        }

        warn!(
            url = %self.llm_api_url,
            "copilot may ignore custom LLM endpoints; written to config.json anyway"
        );
        let settings = CopilotSettings {
            model: &self.model,
            base_url: &self.llm_api_url,
        };
        let path = self.home.join("config.json");
        let mut buf =
            serde_json::to_string_pretty(&settings).context("serialize copilot config")?;
        buf.push('\n');
        fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod {}", path.display()))?;
        info!(path = %path.display(), "copilot config written");
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
        let cmd = self.command(request, &prepared.prompt);
        self.supervisor.run(
            cmd,
            &request.session.stdout_log(BINARY),
            &request.session.stderr_log(BINARY),
        )
    }
}
