//! Framework client: fetch inputs, download build outputs, run POVs, submit.
//!
//! The controller only talks to the [`Framework`] trait. [`LibCrs`] is the
//! production implementation, which shells out to the framework CLI.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use submit_watch::SubmitSink;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::io::process::{CommandOutput, run_command_with_timeout};

const FRAMEWORK_OUTPUT_LIMIT: usize = 256 * 1024;

/// Kinds of data exchanged with the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Pov,
    Diff,
    Patch,
}

impl DataKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Pov => "pov",
            DataKind::Diff => "diff",
            DataKind::Patch => "patch",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One POV execution against the builder sidecar.
#[derive(Debug, Clone)]
pub struct PovRun<'a> {
    pub pov: &'a Path,
    pub harness: &'a str,
    /// Build variant; reproduction always uses `base`.
    pub build_variant: &'a str,
    /// Directory the sidecar writes `pov_stdout.log` / `pov_stderr.log` into.
    pub response_dir: &'a Path,
    pub builder: &'a str,
    pub timeout: Duration,
}

/// Operations the patcher consumes from the surrounding framework.
pub trait Framework: Send + Sync {
    /// Fetch all data of `kind` into `dest`, returning the files now present.
    fn fetch(&self, kind: DataKind, dest: &Path) -> Result<Vec<PathBuf>>;

    /// Download the build output tagged `tag` into `dest`.
    fn download_build_output(&self, tag: &str, dest: &Path) -> Result<()>;

    /// Resolve a sidecar service name to an address.
    fn resolve_service(&self, name: &str) -> Result<String>;

    /// Run a POV and return the harness exit code.
    fn run_pov(&self, run: &PovRun<'_>) -> Result<i32>;

    /// Make `path` visible to other containers under `label`.
    fn register_shared_dir(&self, path: &Path, label: &str) -> Result<()>;

    /// Submit `files` as `kind`. Submissions are final.
    fn submit(&self, kind: DataKind, files: &[PathBuf]) -> Result<()>;
}

/// [`Framework`] backed by the `libCRS` command-line client.
#[derive(Debug, Clone)]
pub struct LibCrs {
    bin: String,
    call_timeout: Duration,
}

impl LibCrs {
    pub fn new(bin: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            call_timeout,
        }
    }

    fn call(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        let label = format!("{} {}", self.bin, args.first().copied().unwrap_or_default());
        debug!(command = %label, "calling framework");
        let output = run_command_with_timeout(cmd, timeout, FRAMEWORK_OUTPUT_LIMIT)
            .with_context(|| format!("run {label}"))?;
        if output.timed_out {
            return Err(anyhow!("{label} timed out after {}s", timeout.as_secs()));
        }
        Ok(output)
    }

    fn call_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.call(args, self.call_timeout)?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} {} failed ({}): {}",
                self.bin,
                args.first().copied().unwrap_or_default(),
                output.status,
                output.stderr_lossy().trim()
            ));
        }
        Ok(output)
    }
}

impl Framework for LibCrs {
    #[instrument(skip_all, fields(kind = %kind, dest = %dest.display()))]
    fn fetch(&self, kind: DataKind, dest: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dest)
            .with_context(|| format!("create directory {}", dest.display()))?;
        let dest_arg = path_arg(dest)?;
        self.call_checked(&["fetch", kind.as_str(), dest_arg])?;
        let files = list_files(dest)?;
        info!(count = files.len(), "fetched");
        Ok(files)
    }

    #[instrument(skip_all, fields(tag, dest = %dest.display()))]
    fn download_build_output(&self, tag: &str, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)
            .with_context(|| format!("create directory {}", dest.display()))?;
        self.call_checked(&["download-build-output", tag, path_arg(dest)?])?;
        Ok(())
    }

    #[instrument(skip_all, fields(name))]
    fn resolve_service(&self, name: &str) -> Result<String> {
        let output = self.call_checked(&["get-service-domain", name])?;
        let domain = output.stdout_lossy().trim().to_string();
        if domain.is_empty() {
            return Err(anyhow!("service '{name}' resolved to an empty address"));
        }
        Ok(domain)
    }

    #[instrument(skip_all, fields(pov = %run.pov.display(), harness = run.harness))]
    fn run_pov(&self, run: &PovRun<'_>) -> Result<i32> {
        let output = self.call(
            &[
                "run-pov",
                path_arg(run.pov)?,
                path_arg(run.response_dir)?,
                "--harness",
                run.harness,
                "--build-id",
                run.build_variant,
                "--builder",
                run.builder,
            ],
            run.timeout,
        )?;
        output
            .status
            .code()
            .ok_or_else(|| anyhow!("run-pov terminated by signal ({})", output.status))
    }

    #[instrument(skip_all, fields(path = %path.display(), label))]
    fn register_shared_dir(&self, path: &Path, label: &str) -> Result<()> {
        self.call_checked(&["register-shared-dir", path_arg(path)?, label])?;
        Ok(())
    }

    #[instrument(skip_all, fields(kind = %kind, count = files.len()))]
    fn submit(&self, kind: DataKind, files: &[PathBuf]) -> Result<()> {
        let mut args = vec!["submit", kind.as_str()];
        for file in files {
            args.push(path_arg(file)?);
        }
        self.call_checked(&args)?;
        Ok(())
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

/// Regular files under `dir`, sorted, skipping dotfiles.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Forwards watcher batches to [`Framework::submit`].
pub struct FrameworkSink<F> {
    framework: Arc<F>,
    kind: DataKind,
}

impl<F> FrameworkSink<F> {
    pub fn new(framework: Arc<F>, kind: DataKind) -> Self {
        Self { framework, kind }
    }
}

impl<F: Framework + 'static> SubmitSink for FrameworkSink<F> {
    fn submit(&self, files: &[PathBuf]) -> Result<()> {
        self.framework.submit(self.kind, files)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    /// Write a stand-in framework CLI that logs its arguments.
    fn fake_cli(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("libCRS");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> \"{}\"\n{body}\n",
            dir.join("calls.log").display()
        );
        fs::write(&path, script).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn calls(dir: &Path) -> String {
        fs::read_to_string(dir.join("calls.log")).unwrap_or_default()
    }

    #[test]
    fn list_files_is_sorted_and_skips_dotfiles() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("nested")).expect("mkdir");
        fs::create_dir_all(temp.path().join(".hidden")).expect("mkdir");
        fs::write(temp.path().join("b.bin"), "b").expect("write");
        fs::write(temp.path().join("a.bin"), "a").expect("write");
        fs::write(temp.path().join(".skip"), "x").expect("write");
        fs::write(temp.path().join("nested/c.bin"), "c").expect("write");
        fs::write(temp.path().join(".hidden/d.bin"), "d").expect("write");

        let files = list_files(temp.path()).expect("list");
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(temp.path()).expect("prefix").to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.bin"),
                PathBuf::from("b.bin"),
                PathBuf::from("nested/c.bin")
            ]
        );
    }

    #[test]
    fn run_pov_returns_cli_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bin = fake_cli(temp.path(), "exit 77");
        let crs = LibCrs::new(bin.to_string_lossy(), Duration::from_secs(10));
        let pov = temp.path().join("crash-1");
        let response = temp.path().join("resp");

        let code = crs
            .run_pov(&PovRun {
                pov: &pov,
                harness: "fuzz_png",
                build_variant: "base",
                response_dir: &response,
                builder: "inc-builder-asan",
                timeout: Duration::from_secs(10),
            })
            .expect("run_pov");
        assert_eq!(code, 77);
        let log = calls(temp.path());
        assert!(log.contains("run-pov"));
        assert!(log.contains("--harness fuzz_png --build-id base --builder inc-builder-asan"));
    }

    #[test]
    fn resolve_service_trims_and_rejects_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bin = fake_cli(temp.path(), "echo '  builder.local  '");
        let crs = LibCrs::new(bin.to_string_lossy(), Duration::from_secs(10));
        assert_eq!(crs.resolve_service("builder").expect("resolve"), "builder.local");

        let temp = tempfile::tempdir().expect("tempdir");
        let bin = fake_cli(temp.path(), "exit 0");
        let crs = LibCrs::new(bin.to_string_lossy(), Duration::from_secs(10));
        assert!(crs.resolve_service("builder").is_err());
    }

    #[test]
    fn failing_cli_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bin = fake_cli(temp.path(), "echo nope >&2; exit 2");
        let crs = LibCrs::new(bin.to_string_lossy(), Duration::from_secs(10));
        let err = crs
            .register_shared_dir(temp.path(), "home")
            .expect_err("should fail");
        assert!(format!("{err:#}").contains("nope"));
    }

    #[test]
    fn submit_passes_every_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bin = fake_cli(temp.path(), "exit 0");
        let crs = Arc::new(LibCrs::new(bin.to_string_lossy(), Duration::from_secs(10)));
        let sink = FrameworkSink::new(crs, DataKind::Patch);

        sink.submit(&[PathBuf::from("/p/a.diff"), PathBuf::from("/p/b.diff")])
            .expect("submit");
        assert!(calls(temp.path()).contains("submit patch /p/a.diff /p/b.diff"));
    }
}
