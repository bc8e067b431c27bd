//! Crash reproduction against the unpatched build.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::crash_log::{
    NO_HARNESS, render_error, render_report, sanitizer_summary, truncate_tail,
};
use crate::core::types::CrashReport;
use crate::io::framework::{Framework, PovRun};

/// Build variant crashes are reproduced on.
pub const BASE_BUILD: &str = "base";

const STDOUT_LOG: &str = "pov_stdout.log";
const STDERR_LOG: &str = "pov_stderr.log";

/// Runs POVs through the builder sidecar and renders bounded crash reports.
pub struct CrashReproducer<F> {
    framework: Arc<F>,
    harness: String,
    builder: String,
    reproduce_dir: PathBuf,
    max_chars: usize,
    timeout: Duration,
}

impl<F: Framework> CrashReproducer<F> {
    pub fn new(
        framework: Arc<F>,
        harness: impl Into<String>,
        builder: impl Into<String>,
        reproduce_dir: impl Into<PathBuf>,
        max_chars: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            framework,
            harness: harness.into(),
            builder: builder.into(),
            reproduce_dir: reproduce_dir.into(),
            max_chars,
            timeout,
        }
    }

    /// Reproduce every POV in order. Never fails; errors become report text.
    pub fn reproduce_all(&self, povs: &[PathBuf]) -> Vec<CrashReport> {
        povs.iter()
            .enumerate()
            .map(|(index, pov)| self.reproduce(index, pov))
            .collect()
    }

    /// Reproduce one POV. `index` keeps response directories distinct.
    #[instrument(skip_all, fields(pov = %pov.display(), index))]
    pub fn reproduce(&self, index: usize, pov: &Path) -> CrashReport {
        if self.harness.is_empty() {
            warn!("no harness configured, skipping reproduction");
            return CrashReport {
                pov: pov.to_path_buf(),
                exit_code: None,
                text: NO_HARNESS.to_string(),
            };
        }

        match self.try_reproduce(index, pov) {
            Ok((exit_code, text)) => {
                info!(
                    exit_code,
                    chars = text.chars().count(),
                    summary = sanitizer_summary(&text).unwrap_or("none"),
                    "crash reproduced"
                );
                CrashReport {
                    pov: pov.to_path_buf(),
                    exit_code: Some(exit_code),
                    text,
                }
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "crash reproduction failed");
                CrashReport {
                    pov: pov.to_path_buf(),
                    exit_code: None,
                    text: truncate_tail(&render_error(&format!("{err:#}")), self.max_chars),
                }
            }
        }
    }

    fn try_reproduce(&self, index: usize, pov: &Path) -> Result<(i32, String)> {
        let response_dir = self.response_dir(index, pov);
        fs::create_dir_all(&response_dir)
            .with_context(|| format!("create directory {}", response_dir.display()))?;

        let exit_code = self.framework.run_pov(&PovRun {
            pov,
            harness: &self.harness,
            build_variant: BASE_BUILD,
            response_dir: &response_dir,
            builder: &self.builder,
            timeout: self.timeout,
        })?;

        let stdout = read_optional(&response_dir.join(STDOUT_LOG))?;
        let stderr = read_optional(&response_dir.join(STDERR_LOG))?;
        let report = render_report(Some(exit_code), &stdout, &stderr);
        Ok((exit_code, truncate_tail(&report, self.max_chars)))
    }

    /// `<reproduce>/<index>-<pov file name>/`
    pub fn response_dir(&self, index: usize, pov: &Path) -> PathBuf {
        let name = pov
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pov".to_string());
        self.reproduce_dir.join(format!("{index}-{name}"))
    }
}

/// Read a log the sidecar may not have written; missing means empty.
fn read_optional(path: &Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crash_log::{NO_OUTPUT, TRUNCATION_MARKER};
    use crate::test_support::{FakeFramework, PovScript};

    fn reproducer(
        fw: Arc<FakeFramework>,
        dir: &Path,
        harness: &str,
    ) -> CrashReproducer<FakeFramework> {
        CrashReproducer::new(
            fw,
            harness,
            "inc-builder-asan",
            dir.join("reproduce"),
            16_384,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn missing_harness_is_a_placeholder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fw = Arc::new(FakeFramework::default());
        let report = reproducer(fw.clone(), temp.path(), "").reproduce(0, Path::new("/povs/a"));

        assert_eq!(report.text, NO_HARNESS);
        assert!(fw.pov_runs().is_empty());
    }

    #[test]
    fn stderr_is_captured_with_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fw = Arc::new(FakeFramework::default().with_pov_script(PovScript::crash(
            1,
            "==42==ERROR: AddressSanitizer: heap-buffer-overflow\n",
        )));
        let report =
            reproducer(fw.clone(), temp.path(), "fuzz").reproduce(3, Path::new("/povs/crash-a"));

        assert_eq!(report.exit_code, Some(1));
        assert!(report.text.contains("AddressSanitizer"));
        assert!(report.text.trim_end().ends_with("Exit code: 1"));
        let runs = fw.pov_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].build_variant, "base");
        assert_eq!(runs[0].response_dir, temp.path().join("reproduce/3-crash-a"));
    }

    #[test]
    fn empty_output_reports_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fw = Arc::new(FakeFramework::default().with_pov_script(PovScript::crash(0, "")));
        let report = reproducer(fw, temp.path(), "fuzz").reproduce(0, Path::new("/povs/a"));

        assert!(report.text.starts_with(NO_OUTPUT));
        assert!(report.text.contains("Exit code: 0"));
    }

    #[test]
    fn sidecar_failure_becomes_error_text() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fw = Arc::new(
            FakeFramework::default().with_pov_script(PovScript::fail("sidecar unreachable")),
        );
        let report = reproducer(fw, temp.path(), "fuzz").reproduce(0, Path::new("/povs/a"));

        assert_eq!(report.exit_code, None);
        assert!(report.text.starts_with("Error reproducing crash:"));
        assert!(report.text.contains("sidecar unreachable"));
    }

    #[test]
    fn long_logs_are_bounded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stderr = format!("{}SUMMARY: AddressSanitizer\n", "#0 frame\n".repeat(20_000));
        let fw = Arc::new(FakeFramework::default().with_pov_script(PovScript::crash(1, &stderr)));
        let report = reproducer(fw, temp.path(), "fuzz").reproduce(0, Path::new("/povs/a"));

        assert!(report.text.chars().count() <= 16_384);
        assert!(report.text.starts_with(TRUNCATION_MARKER));
        assert!(report.text.contains("SUMMARY: AddressSanitizer"));
    }
}
