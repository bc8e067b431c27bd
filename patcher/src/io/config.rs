//! Patcher configuration.
//!
//! Read once at startup from the process environment, optionally on top of a
//! TOML file, then passed down explicitly. Nothing below `main` reads the
//! environment.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use submit_watch::SubmitPolicy;
use tracing::warn;

use crate::core::budget::session_budget;
use crate::core::crash_log::TRUNCATION_MARKER;

/// Immutable run configuration.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatcherConfig {
    /// Snapshot image the sidecar builds from. Required at run time.
    pub snapshot_image: String,
    pub target: String,
    /// Fuzzing harness name. Empty means crashes cannot be reproduced.
    pub harness: String,
    pub language: String,
    pub sanitizer: String,
    pub llm_api_url: String,
    pub llm_api_key: String,
    /// Builder sidecar service name.
    pub builder_module: String,
    /// Agent registry key.
    pub agent: String,
    /// Session budget in seconds; zero waits indefinitely.
    pub agent_timeout_secs: u64,
    pub model: String,
    /// Shell command run by the `command` agent.
    pub agent_command: Option<String>,
    /// How long to keep the process alive after a patch appears.
    pub flush_wait_secs: u64,
    pub submit_debounce_ms: u64,
    pub submit_policy: SubmitPolicy,
    pub work_dir: PathBuf,
    pub patches_dir: PathBuf,
    pub home_dir: PathBuf,

    /// Crash report budget in characters.
    pub max_crash_log_chars: usize,
    pub reset_timeout_secs: u64,
    pub reproduce_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL for a timed-out session.
    pub kill_grace_ms: u64,
    /// Framework CLI binary.
    pub framework_bin: String,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            snapshot_image: String::new(),
            target: String::new(),
            harness: String::new(),
            language: "c".to_string(),
            sanitizer: "address".to_string(),
            llm_api_url: String::new(),
            llm_api_key: String::new(),
            builder_module: "inc-builder-asan".to_string(),
            agent: "copilot_cli".to_string(),
            agent_timeout_secs: 0,
            model: "claude-sonnet-4.5".to_string(),
            agent_command: None,
            flush_wait_secs: 30,
            submit_debounce_ms: 10_000,
            submit_policy: SubmitPolicy::All,
            work_dir: PathBuf::from("/work"),
            patches_dir: PathBuf::from("/patches"),
            home_dir: PathBuf::from("/root"),
            max_crash_log_chars: 16_384,
            reset_timeout_secs: 60,
            reproduce_timeout_secs: 600,
            kill_grace_ms: 2_000,
            framework_bin: "libCRS".to_string(),
        }
    }
}

impl fmt::Debug for PatcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatcherConfig")
            .field("snapshot_image", &self.snapshot_image)
            .field("target", &self.target)
            .field("harness", &self.harness)
            .field("language", &self.language)
            .field("sanitizer", &self.sanitizer)
            .field("llm_api_url", &self.llm_api_url)
            .field("llm_api_key", &redact(&self.llm_api_key))
            .field("builder_module", &self.builder_module)
            .field("agent", &self.agent)
            .field("agent_timeout_secs", &self.agent_timeout_secs)
            .field("model", &self.model)
            .field("agent_command", &self.agent_command)
            .field("flush_wait_secs", &self.flush_wait_secs)
            .field("submit_debounce_ms", &self.submit_debounce_ms)
            .field("submit_policy", &self.submit_policy)
            .field("work_dir", &self.work_dir)
            .field("patches_dir", &self.patches_dir)
            .field("home_dir", &self.home_dir)
            .field("max_crash_log_chars", &self.max_crash_log_chars)
            .field("reset_timeout_secs", &self.reset_timeout_secs)
            .field("reproduce_timeout_secs", &self.reproduce_timeout_secs)
            .field("kill_grace_ms", &self.kill_grace_ms)
            .field("framework_bin", &self.framework_bin)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "<redacted>" }
}

impl PatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.trim().is_empty() {
            return Err(anyhow!("agent must be non-empty"));
        }
        if self.max_crash_log_chars <= TRUNCATION_MARKER.len() {
            return Err(anyhow!(
                "max_crash_log_chars must be > {}",
                TRUNCATION_MARKER.len()
            ));
        }
        if self.reset_timeout_secs == 0 {
            return Err(anyhow!("reset_timeout_secs must be > 0"));
        }
        if self.reproduce_timeout_secs == 0 {
            return Err(anyhow!("reproduce_timeout_secs must be > 0"));
        }
        if self.submit_debounce_ms == 0 {
            return Err(anyhow!("submit_debounce_ms must be > 0"));
        }
        if self.kill_grace_ms == 0 {
            return Err(anyhow!("kill_grace_ms must be > 0"));
        }
        if self.framework_bin.trim().is_empty() {
            return Err(anyhow!("framework_bin must be non-empty"));
        }
        if let Some(command) = &self.agent_command
            && command.trim().is_empty()
        {
            return Err(anyhow!("agent_command must be non-empty when set"));
        }
        Ok(())
    }

    /// Apply environment overrides on top of `self`.
    ///
    /// `lookup` abstracts the environment so tests can supply a map. Empty
    /// values count as unset.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OSS_CRS_SNAPSHOT_IMAGE") {
            self.snapshot_image = v;
        }
        if let Some(v) = get("OSS_CRS_TARGET") {
            self.target = v;
        }
        if let Some(v) = get("OSS_CRS_TARGET_HARNESS") {
            self.harness = v;
        }
        if let Some(v) = get("FUZZING_LANGUAGE") {
            self.language = v;
        }
        if let Some(v) = get("SANITIZER") {
            self.sanitizer = v;
        }
        if let Some(v) = get("OSS_CRS_LLM_API_URL") {
            self.llm_api_url = v;
        }
        if let Some(v) = get("OSS_CRS_LLM_API_KEY") {
            self.llm_api_key = v;
        }
        if let Some(v) = get("BUILDER_MODULE") {
            self.builder_module = v;
        }
        if let Some(v) = get("CRS_AGENT") {
            self.agent = v;
        }
        if let Some(v) = get("AGENT_TIMEOUT") {
            self.agent_timeout_secs = v.trim().parse().unwrap_or_else(|_| {
                warn!(value = %v, "invalid AGENT_TIMEOUT, running without a session budget");
                0
            });
        }
        if let Some(v) = get("COPILOT_MODEL") {
            self.model = v;
        }
        if let Some(v) = get("PATCHER_AGENT_COMMAND") {
            self.agent_command = Some(v);
        }
        if let Some(v) = get("PATCHER_FLUSH_WAIT_SECS") {
            self.flush_wait_secs = parse_number("PATCHER_FLUSH_WAIT_SECS", &v)?;
        }
        if let Some(v) = get("PATCHER_SUBMIT_DEBOUNCE_MS") {
            self.submit_debounce_ms = parse_number("PATCHER_SUBMIT_DEBOUNCE_MS", &v)?;
        }
        if let Some(v) = get("PATCHER_SUBMIT_POLICY") {
            self.submit_policy = v
                .parse()
                .with_context(|| format!("parse PATCHER_SUBMIT_POLICY '{v}'"))?;
        }
        if let Some(v) = get("PATCHER_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PATCHER_PATCHES_DIR") {
            self.patches_dir = PathBuf::from(v);
        }
        if let Some(v) = get("HOME") {
            self.home_dir = PathBuf::from(v);
        }
        Ok(self)
    }

    pub fn source_dir(&self) -> PathBuf {
        self.work_dir.join("src")
    }

    pub fn povs_dir(&self) -> PathBuf {
        self.work_dir.join("povs")
    }

    pub fn diffs_dir(&self) -> PathBuf {
        self.work_dir.join("diffs")
    }

    pub fn reference_diff_path(&self) -> PathBuf {
        self.diffs_dir().join("ref.diff")
    }

    pub fn reproduce_dir(&self) -> PathBuf {
        self.work_dir.join("reproduce")
    }

    /// Session directory: crash logs, agent logs and `session.json`.
    pub fn session_dir(&self) -> PathBuf {
        self.work_dir.join("agent")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.work_dir.join("submitted.json")
    }

    pub fn session_budget(&self) -> Option<Duration> {
        session_budget(self.agent_timeout_secs)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    pub fn reproduce_timeout(&self) -> Duration {
        Duration::from_secs(self.reproduce_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn flush_wait(&self) -> Duration {
        Duration::from_secs(self.flush_wait_secs)
    }

    pub fn submit_debounce(&self) -> Duration {
        Duration::from_millis(self.submit_debounce_ms)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer, got '{value}'"))
}

/// Load config from an optional TOML file, then apply the environment.
pub fn load_config(
    path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PatcherConfig> {
    let base = match path {
        Some(path) => {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
        }
        None => PatcherConfig::default(),
    };
    let cfg = base.with_env(lookup)?;
    cfg.validate()?;
    Ok(cfg)
}
