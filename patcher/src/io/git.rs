//! Git adapter for the source workspace.
//!
//! Every invocation is bounded by a timeout and runs with
//! `safe.directory=*`, since the downloaded tree is often owned by another uid.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::io::process::{CommandOutput, run_command_with_timeout};

const GIT_OUTPUT_LIMIT: usize = 1024 * 1024;
const BASELINE_AUTHOR_NAME: &str = "patcher";
const BASELINE_AUTHOR_EMAIL: &str = "patcher@localhost";

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn git_dir(&self) -> PathBuf {
        self.workdir.join(".git")
    }

    /// True if the workdir has its own `.git` entry.
    pub fn has_git_dir(&self) -> bool {
        self.git_dir().exists()
    }

    /// True if HEAD resolves to a commit.
    pub fn has_head(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        Ok(out.status.success())
    }

    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn init(&self) -> Result<()> {
        debug!("initialising repository");
        self.run_checked(&["init", "--quiet"])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit whatever is staged, even if nothing is.
    #[instrument(skip_all)]
    pub fn commit_baseline(&self, message: &str) -> Result<()> {
        let name = format!("user.name={BASELINE_AUTHOR_NAME}");
        let email = format!("user.email={BASELINE_AUTHOR_EMAIL}");
        self.run_checked(&[
            "-c",
            &name,
            "-c",
            &email,
            "commit",
            "--quiet",
            "--allow-empty",
            "--no-verify",
            "-m",
            message,
        ])?;
        Ok(())
    }

    #[instrument(skip_all)]
    pub fn reset_hard(&self) -> Result<()> {
        self.run_checked(&["reset", "--hard", "--quiet", "HEAD"])?;
        Ok(())
    }

    #[instrument(skip_all)]
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-fd", "--quiet"])?;
        Ok(())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_checked(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.stdout_lossy().lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Delete `*.lock` files anywhere under `.git/`, returning what was removed.
    #[instrument(skip_all)]
    pub fn remove_stale_locks(&self) -> Result<Vec<PathBuf>> {
        let git_dir = self.git_dir();
        if !git_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut removed = Vec::new();
        for entry in WalkDir::new(&git_dir) {
            let entry = entry.with_context(|| format!("walk {}", git_dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            warn!(path = %entry.path().display(), "removing stale git lock file");
            fs::remove_file(entry.path())
                .with_context(|| format!("remove {}", entry.path().display()))?;
            removed.push(entry.into_path());
        }
        Ok(removed)
    }

    /// Add `pattern` to `.git/info/exclude` unless it is already listed.
    pub fn exclude(&self, pattern: &str) -> Result<()> {
        let path = self.git_dir().join("info").join("exclude");
        let existing = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        if existing.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(pattern);
        updated.push('\n');
        fs::write(&path, updated).with_context(|| format!("write {}", path.display()))?;
        debug!(pattern, "pattern added to git exclude");
        Ok(())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.arg("-c")
            .arg("safe.directory=*")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0");
        let output = run_command_with_timeout(cmd, self.timeout, GIT_OUTPUT_LIMIT)
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        Ok(output)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
