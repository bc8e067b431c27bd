//! Debounced submission watcher for a patch output directory.
//!
//! The watcher runs as a background tokio task for the lifetime of the process.
//! It observes a single directory, collects newly appearing patch files, and
//! forwards them to a [`SubmitSink`] in batches once the directory has been quiet
//! for the debounce window.
//!
//! - **[`batch`]**: pending-file bookkeeping and submission planning.
//! - **[`ledger`]**: persisted record of what was submitted (submissions are final).

pub mod batch;
pub mod ledger;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batch::{Batcher, plan_submission};
use crate::ledger::{Ledger, load_ledger, write_ledger};

/// Destination for settled patch batches.
pub trait SubmitSink: Send + Sync + 'static {
    /// Submit every file in `files` as one batch. Runs on a blocking thread.
    fn submit(&self, files: &[PathBuf]) -> Result<()>;
}

/// Which patches get submitted when several appear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitPolicy {
    /// Every distinct patch is submitted.
    #[default]
    All,
    /// Only the first submitted patch counts; later ones are ignored.
    First,
}

impl SubmitPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmitPolicy::All => "all",
            SubmitPolicy::First => "first",
        }
    }
}

impl fmt::Display for SubmitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmitPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(SubmitPolicy::All),
            "first" => Ok(SubmitPolicy::First),
            other => Err(anyhow!("unknown submit policy '{other}' (expected 'all' or 'first')")),
        }
    }
}

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Directory to observe (not recursive).
    pub dir: PathBuf,
    /// Quiet period after the last event before a batch is flushed.
    pub debounce: Duration,
    /// Filesystem poll interval.
    pub poll_interval: Duration,
    pub policy: SubmitPolicy,
    /// Where the submitted-file ledger lives. `None` keeps it in memory only.
    pub ledger_path: Option<PathBuf>,
    /// File extension (without dot) that marks a patch.
    pub extension: String,
}

impl WatchConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            debounce: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            policy: SubmitPolicy::All,
            ledger_path: None,
            extension: "diff".to_string(),
        }
    }
}

/// Handle to a running watcher task.
pub struct WatchHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl WatchHandle {
    /// Flush whatever has settled and stop the watcher.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("join submission watcher")?
    }
}

/// Start the watcher in a background task. Must be called inside a tokio runtime.
///
/// Files already present in `config.dir` are treated as new.
pub fn spawn<S: SubmitSink>(config: WatchConfig, sink: Arc<S>) -> Result<WatchHandle> {
    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("create watch dir {}", config.dir.display()))?;
    let ledger = match &config.ledger_path {
        Some(path) => load_ledger(path)?,
        None => Ledger::default(),
    };

    let (tx, rx) = mpsc::unbounded_channel::<NotifyEvent>();
    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => warn!(error = %e, "patch directory watch error"),
        },
        notify::Config::default().with_poll_interval(config.poll_interval),
    )
    .context("create patch directory watcher")?;
    watcher
        .watch(&config.dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch {}", config.dir.display()))?;
    info!(
        path = %config.dir.display(),
        debounce_ms = config.debounce.as_millis() as u64,
        policy = %config.policy,
        "watching patch directory"
    );

    let state = WatchState {
        batcher: Batcher::new(config.extension.clone()),
        config,
        sink,
        ledger,
        _watcher: watcher,
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(run_watch_loop(state, rx, shutdown_rx));
    Ok(WatchHandle {
        shutdown: Some(shutdown_tx),
        task,
    })
}

struct WatchState<S> {
    config: WatchConfig,
    sink: Arc<S>,
    ledger: Ledger,
    batcher: Batcher,
    _watcher: PollWatcher,
}

async fn run_watch_loop<S: SubmitSink>(
    mut state: WatchState<S>,
    mut rx: mpsc::UnboundedReceiver<NotifyEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<()> {
    state.scan_existing();
    let debounce = state.config.debounce;
    let mut deadline = (!state.batcher.is_empty()).then(|| Instant::now() + debounce);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                state.flush().await;
                if !state.batcher.is_empty() {
                    warn!(pending = state.batcher.len(), "watcher stopped with unsubmitted patches");
                }
                info!(submitted = state.ledger.len(), "submission watcher stopped");
                return Ok(());
            }
            Some(event) = rx.recv() => {
                if state.handle_event(&event) {
                    deadline = Some(Instant::now() + debounce);
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                state.flush().await;
                deadline = (!state.batcher.is_empty()).then(|| Instant::now() + debounce);
            }
        }
    }
}

impl<S: SubmitSink> WatchState<S> {
    fn scan_existing(&mut self) {
        let entries = match std::fs::read_dir(&self.config.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "cannot scan patch directory");
                return;
            }
        };
        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();
        for path in paths {
            if self.batcher.observe(&path) {
                debug!(path = %path.display(), "found existing patch at startup");
            }
        }
    }

    /// Returns true if the event touched at least one candidate patch.
    fn handle_event(&mut self, event: &NotifyEvent) -> bool {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return false;
        }
        let mut touched = false;
        for path in &event.paths {
            if in_dir(&self.config.dir, path) && self.batcher.observe(path) {
                touched = true;
            }
        }
        touched
    }

    async fn flush(&mut self) {
        let settled = self.batcher.take_settled();
        if settled.is_empty() {
            return;
        }
        let planned = plan_submission(&self.ledger, self.config.policy, settled);
        if planned.is_empty() {
            return;
        }

        let files: Vec<PathBuf> = planned.iter().map(|c| c.path.clone()).collect();
        let names: Vec<&str> = planned.iter().map(|c| c.name.as_str()).collect();
        info!(count = files.len(), files = ?names, "submitting patch batch");

        let sink = Arc::clone(&self.sink);
        let batch = files.clone();
        let result = tokio::task::spawn_blocking(move || sink.submit(&batch)).await;
        match result {
            Ok(Ok(())) => {
                for candidate in planned {
                    self.ledger.record(candidate.name, candidate.sha256);
                }
                if let Some(path) = &self.config.ledger_path
                    && let Err(e) = write_ledger(path, &self.ledger)
                {
                    warn!(error = %format!("{e:#}"), "failed to persist submission ledger");
                }
            }
            Ok(Err(e)) => {
                warn!(error = %format!("{e:#}"), "patch submission failed, retrying next window");
                self.batcher.requeue(files);
            }
            Err(e) => {
                warn!(error = %e, "patch submission task panicked, retrying next window");
                self.batcher.requeue(files);
            }
        }
    }
}

fn in_dir(dir: &Path, path: &Path) -> bool {
    path.parent() == Some(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingSink {
        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().expect("lock").clone()
        }
    }

    impl SubmitSink for RecordingSink {
        fn submit(&self, files: &[PathBuf]) -> Result<()> {
            let names = files
                .iter()
                .map(|p| p.file_name().expect("name").to_string_lossy().to_string())
                .collect();
            self.batches.lock().expect("lock").push(names);
            Ok(())
        }
    }

    fn fast_config(dir: &Path) -> WatchConfig {
        WatchConfig {
            debounce: Duration::from_millis(300),
            poll_interval: Duration::from_millis(50),
            ..WatchConfig::new(dir)
        }
    }

    async fn wait_for_batches(sink: &RecordingSink, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while sink.batches().len() < count && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("ALL".parse::<SubmitPolicy>().expect("all"), SubmitPolicy::All);
        assert_eq!(" first ".parse::<SubmitPolicy>().expect("first"), SubmitPolicy::First);
        assert!("latest".parse::<SubmitPolicy>().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn files_written_together_are_submitted_as_one_batch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(fast_config(temp.path()), Arc::clone(&sink)).expect("spawn");

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(temp.path().join("a.diff"), "a").expect("write");
        fs::write(temp.path().join("b.diff"), "b").expect("write");
        fs::write(temp.path().join("notes.txt"), "ignored").expect("write");

        wait_for_batches(&sink, 1).await;
        handle.shutdown().await.expect("shutdown");

        assert_eq!(
            sink.batches(),
            vec![vec!["a.diff".to_string(), "b.diff".to_string()]]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn temp_name_is_ignored_until_renamed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(fast_config(temp.path()), Arc::clone(&sink)).expect("spawn");

        let tmp = temp.path().join("fix.diff.tmp");
        fs::write(&tmp, "partial").expect("write");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(sink.batches().is_empty());

        fs::rename(&tmp, temp.path().join("fix.diff")).expect("rename");
        wait_for_batches(&sink, 1).await;
        handle.shutdown().await.expect("shutdown");

        assert_eq!(sink.batches(), vec![vec!["fix.diff".to_string()]]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ledger_prevents_resubmission_after_restart() {
        let temp = tempfile::tempdir().expect("tempdir");
        let patches = temp.path().join("patches");
        fs::create_dir_all(&patches).expect("patches dir");
        fs::write(patches.join("fix.diff"), "fix").expect("write");
        let config = WatchConfig {
            ledger_path: Some(temp.path().join("submitted.json")),
            ..fast_config(&patches)
        };

        let first_sink = Arc::new(RecordingSink::default());
        let handle = spawn(config.clone(), Arc::clone(&first_sink)).expect("spawn");
        wait_for_batches(&first_sink, 1).await;
        handle.shutdown().await.expect("shutdown");
        assert_eq!(first_sink.batches(), vec![vec!["fix.diff".to_string()]]);

        let second_sink = Arc::new(RecordingSink::default());
        let handle = spawn(config, Arc::clone(&second_sink)).expect("spawn");
        tokio::time::sleep(Duration::from_millis(800)).await;
        handle.shutdown().await.expect("shutdown");
        assert!(second_sink.batches().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_flushes_pending_batch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = Arc::new(RecordingSink::default());
        let config = WatchConfig {
            debounce: Duration::from_secs(60),
            ..fast_config(temp.path())
        };
        let handle = spawn(config, Arc::clone(&sink)).expect("spawn");

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(temp.path().join("late.diff"), "late").expect("write");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(sink.batches().is_empty());

        handle.shutdown().await.expect("shutdown");
        assert_eq!(sink.batches(), vec![vec!["late.diff".to_string()]]);
    }
}
