//! Source workspace lifecycle: acquire once, reset around every session.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::framework::Framework;
use crate::io::git::{Git, StatusEntry};

/// Build output tag holding the target source tree.
pub const SOURCE_TAG: &str = "src";

/// Preferred project root name inside the downloaded source.
const PREFERRED_ROOT: &str = "repo";

const BASELINE_MESSAGE: &str = "patcher: baseline";

/// Returned by [`WorkspaceManager::acquire`] when no project root exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceNotFound {
    pub searched: PathBuf,
}

impl fmt::Display for WorkspaceNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no project directory found in {}", self.searched.display())
    }
}

impl std::error::Error for WorkspaceNotFound {}

/// A git-controlled source tree owned by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Acquire and reset the source workspace.
pub trait WorkspaceManager {
    /// Obtain the source tree and make sure it has a committed baseline.
    fn acquire(&self) -> Result<Workspace>;

    /// Return the tree to its baseline: no lock files, no changes, no untracked files.
    fn reset(&self, workspace: &Workspace) -> Result<()>;

    /// Porcelain status entries; empty means the tree is at baseline.
    fn status(&self, workspace: &Workspace) -> Result<Vec<StatusEntry>>;
}

/// [`WorkspaceManager`] that downloads the tree through the framework and uses git.
pub struct GitWorkspace<F> {
    framework: Arc<F>,
    source_dir: PathBuf,
    git_timeout: Duration,
    excludes: Vec<String>,
}

impl<F: Framework> GitWorkspace<F> {
    pub fn new(framework: Arc<F>, source_dir: impl Into<PathBuf>, git_timeout: Duration) -> Self {
        Self {
            framework,
            source_dir: source_dir.into(),
            git_timeout,
            excludes: Vec::new(),
        }
    }

    /// Keep `pattern` out of the tree's status (written to `.git/info/exclude`).
    pub fn with_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    fn git(&self, root: &Path) -> Git {
        Git::new(root, self.git_timeout)
    }
}

impl<F: Framework> WorkspaceManager for GitWorkspace<F> {
    #[instrument(skip_all, fields(source_dir = %self.source_dir.display()))]
    fn acquire(&self) -> Result<Workspace> {
        fs::create_dir_all(&self.source_dir)
            .with_context(|| format!("create directory {}", self.source_dir.display()))?;
        self.framework
            .download_build_output(SOURCE_TAG, &self.source_dir)
            .context("download source")?;

        let root = locate_project_root(&self.source_dir)?.ok_or_else(|| WorkspaceNotFound {
            searched: self.source_dir.clone(),
        })?;
        info!(root = %root.display(), "project root located");

        let workspace = Workspace::new(root);
        ensure_baseline(&self.git(&workspace.root))?;
        for pattern in &self.excludes {
            self.git(&workspace.root).exclude(pattern)?;
        }
        Ok(workspace)
    }

    #[instrument(skip_all, fields(root = %workspace.root.display()))]
    fn reset(&self, workspace: &Workspace) -> Result<()> {
        reset_tree(&self.git(&workspace.root))
    }

    fn status(&self, workspace: &Workspace) -> Result<Vec<StatusEntry>> {
        self.git(&workspace.root).status_porcelain()
    }
}

/// Pick the project root inside `source_dir`.
///
/// `repo/` wins; otherwise the first directory (by name) holding `.git`;
/// otherwise the first directory at all.
pub fn locate_project_root(source_dir: &Path) -> Result<Option<PathBuf>> {
    let preferred = source_dir.join(PREFERRED_ROOT);
    if preferred.is_dir() {
        return Ok(Some(preferred));
    }

    let mut dirs = Vec::new();
    for entry in
        fs::read_dir(source_dir).with_context(|| format!("read {}", source_dir.display()))?
    {
        let entry = entry.with_context(|| format!("read {}", source_dir.display()))?;
        let path = entry.path();
        if path.is_dir() && !entry.file_name().to_string_lossy().starts_with('.') {
            dirs.push(path);
        }
    }
    dirs.sort();

    if let Some(with_git) = dirs.iter().find(|d| d.join(".git").exists()) {
        return Ok(Some(with_git.clone()));
    }
    if let Some(first) = dirs.into_iter().next() {
        warn!(root = %first.display(), "no directory with git metadata, using first directory");
        return Ok(Some(first));
    }
    Ok(None)
}

/// Initialise a repository and commit the whole tree if no baseline commit exists.
pub fn ensure_baseline(git: &Git) -> Result<()> {
    if !git.has_git_dir() {
        info!(root = %git.workdir().display(), "no git metadata, initialising baseline");
        git.init()?;
    }
    if git.has_head()? {
        debug!("baseline commit present");
        return Ok(());
    }
    info!("repository has no commit, recording baseline");
    git.add_all()?;
    git.commit_baseline(BASELINE_MESSAGE)?;
    Ok(())
}

/// Remove stale locks, then `reset --hard HEAD` and `clean -fd`.
pub fn reset_tree(git: &Git) -> Result<()> {
    let removed = git.remove_stale_locks()?;
    if !removed.is_empty() {
        warn!(count = removed.len(), "stale git locks removed");
    }
    git.reset_hard().context("reset workspace")?;
    git.clean_untracked().context("clean workspace")?;
    debug!("workspace reset to baseline");
    Ok(())
}
