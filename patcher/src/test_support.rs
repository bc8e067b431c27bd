//! Test doubles for the framework, agents, workspaces and sleeping.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::agents::{Agent, SessionRequest, SharedDir};
use crate::controller::Sleeper;
use crate::core::types::{AgentExit, CrashReport, ReferenceDiff};
use crate::io::framework::{DataKind, Framework, PovRun};
use crate::io::git::{Git, StatusEntry};
use crate::io::workspace::{Workspace, WorkspaceManager, ensure_baseline};

const TEST_GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// What a scripted `run_pov` call does.
#[derive(Debug, Clone)]
pub struct PovScript {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// When set, `run_pov` fails with this message instead.
    pub error: Option<String>,
}

impl PovScript {
    pub fn crash(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
            error: None,
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(message.to_string()),
        }
    }
}

/// A recorded `run_pov` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPovRun {
    pub pov: PathBuf,
    pub harness: String,
    pub build_variant: String,
    pub response_dir: PathBuf,
    pub builder: String,
}

/// In-memory [`Framework`] that materialises configured files on fetch/download.
pub struct FakeFramework {
    source_files: Vec<(String, String)>,
    povs: Vec<(String, Vec<u8>)>,
    diffs: Vec<(String, String)>,
    diff_fetch_fails: bool,
    shared_dir_fails: bool,
    service: Option<String>,
    pov_script: Option<PovScript>,
    calls: Mutex<Vec<String>>,
    pov_runs: Mutex<Vec<RecordedPovRun>>,
    submissions: Mutex<Vec<(DataKind, Vec<PathBuf>)>>,
}

impl Default for FakeFramework {
    fn default() -> Self {
        Self {
            source_files: Vec::new(),
            povs: Vec::new(),
            diffs: Vec::new(),
            diff_fetch_fails: false,
            shared_dir_fails: false,
            service: Some("builder.local:8080".to_string()),
            pov_script: None,
            calls: Mutex::new(Vec::new()),
            pov_runs: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
        }
    }
}

impl FakeFramework {
    /// Add a file to the downloaded `src` build output, relative to its root.
    pub fn with_source_file(mut self, rel: &str, contents: &str) -> Self {
        self.source_files.push((rel.to_string(), contents.to_string()));
        self
    }

    pub fn with_pov(mut self, rel: &str, contents: &[u8]) -> Self {
        self.povs.push((rel.to_string(), contents.to_vec()));
        self
    }

    pub fn with_diff(mut self, rel: &str, contents: &str) -> Self {
        self.diffs.push((rel.to_string(), contents.to_string()));
        self
    }

    pub fn with_failing_diff_fetch(mut self) -> Self {
        self.diff_fetch_fails = true;
        self
    }

    pub fn with_failing_shared_dirs(mut self) -> Self {
        self.shared_dir_fails = true;
        self
    }

    pub fn without_service(mut self) -> Self {
        self.service = None;
        self
    }

    /// Script applied to every `run_pov` call.
    pub fn with_pov_script(mut self, script: PovScript) -> Self {
        self.pov_script = Some(script);
        self
    }

    /// Operation names in call order (`fetch:pov`, `run_pov`, ...).
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn pov_runs(&self) -> Vec<RecordedPovRun> {
        lock(&self.pov_runs).clone()
    }

    pub fn submissions(&self) -> Vec<(DataKind, Vec<PathBuf>)> {
        lock(&self.submissions).clone()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn materialise<C: AsRef<[u8]>>(dest: &Path, files: &[(String, C)]) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for (rel, contents) in files {
        let path = dest.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        written.push(path);
    }
    Ok(written)
}

impl Framework for FakeFramework {
    fn fetch(&self, kind: DataKind, dest: &Path) -> Result<Vec<PathBuf>> {
        self.record(format!("fetch:{kind}"));
        fs::create_dir_all(dest)?;
        match kind {
            DataKind::Pov => materialise(dest, &self.povs),
            DataKind::Diff if self.diff_fetch_fails => Err(anyhow!("diff service unavailable")),
            DataKind::Diff => materialise(dest, &self.diffs),
            DataKind::Patch => Ok(Vec::new()),
        }
    }

    fn download_build_output(&self, tag: &str, dest: &Path) -> Result<()> {
        self.record(format!("download:{tag}"));
        materialise(dest, &self.source_files)?;
        Ok(())
    }

    fn resolve_service(&self, name: &str) -> Result<String> {
        self.record(format!("resolve:{name}"));
        self.service
            .clone()
            .ok_or_else(|| anyhow!("cannot resolve service '{name}'"))
    }

    fn run_pov(&self, run: &PovRun<'_>) -> Result<i32> {
        self.record("run_pov".to_string());
        lock(&self.pov_runs).push(RecordedPovRun {
            pov: run.pov.to_path_buf(),
            harness: run.harness.to_string(),
            build_variant: run.build_variant.to_string(),
            response_dir: run.response_dir.to_path_buf(),
            builder: run.builder.to_string(),
        });
        let Some(script) = &self.pov_script else {
            return Ok(0);
        };
        if let Some(message) = &script.error {
            return Err(anyhow!("{message}"));
        }
        if !script.stdout.is_empty() {
            fs::write(run.response_dir.join("pov_stdout.log"), &script.stdout)?;
        }
        if !script.stderr.is_empty() {
            fs::write(run.response_dir.join("pov_stderr.log"), &script.stderr)?;
        }
        Ok(script.exit_code)
    }

    fn register_shared_dir(&self, path: &Path, label: &str) -> Result<()> {
        self.record(format!("register_shared_dir:{label}"));
        if self.shared_dir_fails {
            return Err(anyhow!("shared dirs unsupported"));
        }
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn submit(&self, kind: DataKind, files: &[PathBuf]) -> Result<()> {
        self.record(format!("submit:{kind}"));
        lock(&self.submissions).push((kind, files.to_vec()));
        Ok(())
    }
}

/// What a [`ScriptedAgent`] saw when it ran.
#[derive(Debug, Clone)]
pub struct RecordedSession {
    pub workspace: PathBuf,
    pub reports: Vec<CrashReport>,
    pub harness: String,
    pub reference_diff: Option<ReferenceDiff>,
    /// Workspace status entries at launch.
    pub status_at_start: Vec<StatusEntry>,
}

/// [`Agent`] that writes scripted patches and returns a scripted exit.
pub struct ScriptedAgent {
    exit: AgentExit,
    patches: Vec<(String, String)>,
    scribble: bool,
    setup_fails: bool,
    shared: Vec<SharedDir>,
    setups: AtomicUsize,
    sessions: Mutex<Vec<RecordedSession>>,
}

impl ScriptedAgent {
    pub fn new(exit: AgentExit) -> Self {
        Self {
            exit,
            patches: Vec::new(),
            scribble: false,
            setup_fails: false,
            shared: Vec::new(),
            setups: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Write `name` into the patch directory during the session.
    pub fn writing_patch(mut self, name: &str, contents: &str) -> Self {
        self.patches.push((name.to_string(), contents.to_string()));
        self
    }

    /// Leave an edited file, an untracked file and an index lock in the workspace.
    pub fn scribbling(mut self) -> Self {
        self.scribble = true;
        self
    }

    pub fn failing_setup(mut self) -> Self {
        self.setup_fails = true;
        self
    }

    pub fn sharing(mut self, path: PathBuf, label: &str) -> Self {
        self.shared.push(SharedDir {
            path,
            label: label.to_string(),
        });
        self
    }

    pub fn setup_count(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<RecordedSession> {
        lock(&self.sessions).clone()
    }

    fn scribble_in(root: &Path) -> Result<()> {
        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            if path.is_file() {
                fs::write(&path, "/* agent edit */\n")?;
                break;
            }
        }
        fs::write(root.join("scratch.o"), "junk")?;
        let git_dir = root.join(".git");
        if git_dir.is_dir() {
            fs::write(git_dir.join("index.lock"), "")?;
        }
        Ok(())
    }
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn shared_dirs(&self) -> Vec<SharedDir> {
        self.shared.clone()
    }

    fn setup(&self, _workspace: &Workspace) -> Result<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        if self.setup_fails {
            return Err(anyhow!("scripted setup failure"));
        }
        Ok(())
    }

    fn run(&self, request: &SessionRequest<'_>) -> AgentExit {
        let status_at_start = Git::new(&request.workspace.root, TEST_GIT_TIMEOUT)
            .status_porcelain()
            .unwrap_or_default();
        lock(&self.sessions).push(RecordedSession {
            workspace: request.workspace.root.clone(),
            reports: request.reports.to_vec(),
            harness: request.harness.to_string(),
            reference_diff: request.reference_diff.cloned(),
            status_at_start,
        });

        if self.scribble
            && let Err(err) = Self::scribble_in(&request.workspace.root)
        {
            return AgentExit::LaunchFailed(format!("scribble: {err:#}"));
        }
        for (name, contents) in &self.patches {
            if let Err(err) = fs::write(request.patches_dir.join(name), contents) {
                return AgentExit::LaunchFailed(format!("write patch: {err:#}"));
            }
        }
        self.exit.clone()
    }
}

/// Wraps a [`WorkspaceManager`] and counts resets.
pub struct CountingWorkspace<W> {
    inner: W,
    resets: AtomicUsize,
}

impl<W> CountingWorkspace<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            resets: AtomicUsize::new(0),
        }
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl<W: WorkspaceManager> WorkspaceManager for CountingWorkspace<W> {
    fn acquire(&self) -> Result<Workspace> {
        self.inner.acquire()
    }

    fn reset(&self, workspace: &Workspace) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.inner.reset(workspace)
    }

    fn status(&self, workspace: &Workspace) -> Result<Vec<StatusEntry>> {
        self.inner.status(workspace)
    }
}

/// [`Sleeper`] that records requested durations instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        lock(&self.slept).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        lock(&self.slept).push(duration);
    }
}

/// A temporary git repository with one committed baseline.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("main.c"), "int main(void) { return 0; }\n")?;
        fs::write(dir.path().join("util.c"), "int util(void) { return 1; }\n")?;
        let repo = Self { dir };
        ensure_baseline(&repo.git())?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.dir.path(), TEST_GIT_TIMEOUT)
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::new(self.dir.path())
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }
}

/// Pids in process group `pgid` that are not zombies, read from `/proc/<pid>/stat`.
pub fn live_group_members(pgid: i32) -> Vec<i32> {
    let mut members = Vec::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return members;
    };
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // Fields after the parenthesised command name: state, ppid, pgrp, ...
        let Some((_, rest)) = stat.rsplit_once(')') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() > 2 && fields[2] == pgid.to_string() && fields[0] != "Z" {
            members.push(pid);
        }
    }
    members
}
