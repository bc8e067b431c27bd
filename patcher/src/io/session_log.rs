//! Per-session artifacts under the session directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::SessionOutcome;

/// Summary of one agent session, written as `session.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub agent: String,
    pub pov_count: usize,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub outcome: SessionOutcome,
    pub patches: Vec<String>,
}

pub fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub record_path: PathBuf,
}

impl SessionPaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            record_path: dir.join("session.json"),
        }
    }

    /// `crash_log_<index>.txt`
    pub fn crash_log(&self, index: usize) -> PathBuf {
        self.dir.join(format!("crash_log_{index}.txt"))
    }

    pub fn stdout_log(&self, agent: &str) -> PathBuf {
        self.dir.join(format!("{agent}_stdout.log"))
    }

    pub fn stderr_log(&self, agent: &str) -> PathBuf {
        self.dir.join(format!("{agent}_stderr.log"))
    }
}

pub fn write_session_record(paths: &SessionPaths, record: &SessionRecord) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create session dir {}", paths.dir.display()))?;
    let mut buf = serde_json::to_string_pretty(record).context("serialize session record")?;
    buf.push('\n');
    fs::write(&paths.record_path, buf)
        .with_context(|| format!("write {}", paths.record_path.display()))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn session_paths_are_stable() {
        let paths = SessionPaths::new(Path::new("/work/agent"));
        assert_eq!(paths.record_path, PathBuf::from("/work/agent/session.json"));
        assert_eq!(paths.crash_log(1), PathBuf::from("/work/agent/crash_log_1.txt"));
        assert_eq!(
            paths.stdout_log("copilot"),
            PathBuf::from("/work/agent/copilot_stdout.log")
        );
    }

    #[test]
    fn writes_record_with_kebab_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SessionPaths::new(&temp.path().join("agent"));
        let started = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("time");
        let record = SessionRecord {
            agent: "command".to_string(),
            pov_count: 2,
            started_at: rfc3339(started),
            ended_at: rfc3339(started),
            duration_ms: 0,
            exit_code: Some(1),
            timed_out: false,
            outcome: SessionOutcome::PatchProduced,
            patches: vec!["fix.diff".to_string()],
        };

        write_session_record(&paths, &record).expect("write");
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.record_path).expect("read"))
                .expect("parse");
        assert_eq!(json["outcome"], "patch-produced");
        assert_eq!(json["started_at"], "2026-01-02T03:04:05.000Z");
        assert_eq!(json["patches"][0], "fix.diff");
    }
}
