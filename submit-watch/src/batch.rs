//! Debounce bookkeeping for patch files that have not been submitted yet.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::SubmitPolicy;
use crate::ledger::{Ledger, LedgerMatch, file_sha256};

/// A settled file that is cleared for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub name: String,
    pub sha256: String,
}

/// Pending files keyed by path, with the size observed at the last event.
#[derive(Debug)]
pub struct Batcher {
    extension: String,
    pending: BTreeMap<PathBuf, Option<u64>>,
}

impl Batcher {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            pending: BTreeMap::new(),
        }
    }

    /// Whether `path` names a publishable patch (not a dotfile, right extension).
    pub fn is_candidate(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        path.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str())
    }

    /// Record an event for `path`. Returns false if the path is not a candidate.
    pub fn observe(&mut self, path: &Path) -> bool {
        if !self.is_candidate(path) {
            return false;
        }
        let size = current_size(path);
        debug!(path = %path.display(), ?size, "observed patch event");
        self.pending.insert(path.to_path_buf(), size);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Remove and return files whose size has not changed since their last event.
    ///
    /// Files that vanished are dropped. Files still growing stay pending with their
    /// new size so the next window can settle them.
    pub fn take_settled(&mut self) -> Vec<PathBuf> {
        let mut settled = Vec::new();
        let mut growing = BTreeMap::new();
        for (path, last_size) in std::mem::take(&mut self.pending) {
            match current_size(&path) {
                None => {
                    debug!(path = %path.display(), "pending patch disappeared");
                }
                Some(size) if Some(size) == last_size => settled.push(path),
                Some(size) => {
                    debug!(path = %path.display(), size, "pending patch still changing");
                    growing.insert(path, Some(size));
                }
            }
        }
        self.pending = growing;
        settled
    }

    /// Put files back after a failed submission so the next window retries them.
    pub fn requeue(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        for path in paths {
            let size = current_size(&path);
            self.pending.insert(path, size);
        }
    }
}

fn current_size(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

/// Decide which settled files to submit, given what was already submitted.
pub fn plan_submission(
    ledger: &Ledger,
    policy: SubmitPolicy,
    settled: Vec<PathBuf>,
) -> Vec<Candidate> {
    let mut planned = Vec::new();
    for path in settled {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let sha256 = match file_sha256(&path) {
            Ok(hash) => hash,
            Err(err) => {
                warn!(path = %path.display(), err = %err, "cannot hash patch, skipping");
                continue;
            }
        };
        match ledger.lookup(&name, &sha256) {
            LedgerMatch::Submitted => {
                debug!(name = %name, "patch already submitted");
                continue;
            }
            LedgerMatch::Changed => {
                warn!(name = %name, "patch changed after submission; submissions are final, ignoring");
                continue;
            }
            LedgerMatch::New => {}
        }
        if policy == SubmitPolicy::First && (!ledger.is_empty() || !planned.is_empty()) {
            warn!(name = %name, "submit policy is 'first' and a patch was already chosen, ignoring");
            continue;
        }
        planned.push(Candidate { path, name, sha256 });
    }
    planned
}
