//! Persistent record of submitted patch files.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// One submitted file, identified by name and content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub name: String,
    pub sha256: String,
}

/// What the ledger knows about a candidate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMatch {
    /// Never submitted.
    New,
    /// Submitted before with identical content.
    Submitted,
    /// Submitted before under this name, but the content has changed since.
    Changed,
}

/// Submitted-file ledger (`submitted.json`).
///
/// Submissions are final, so the ledger only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn lookup(&self, name: &str, sha256: &str) -> LedgerMatch {
        let mut seen_name = false;
        for entry in &self.entries {
            if entry.name == name {
                if entry.sha256 == sha256 {
                    return LedgerMatch::Submitted;
                }
                seen_name = true;
            }
        }
        if seen_name {
            LedgerMatch::Changed
        } else {
            LedgerMatch::New
        }
    }

    pub fn record(&mut self, name: impl Into<String>, sha256: impl Into<String>) {
        self.entries.push(LedgerEntry {
            name: name.into(),
            sha256: sha256.into(),
        });
    }
}

/// Load the ledger, treating a missing file as empty.
pub fn load_ledger(path: &Path) -> Result<Ledger> {
    if !path.exists() {
        return Ok(Ledger::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read ledger {}", path.display()))?;
    let ledger: Ledger = serde_json::from_str(&contents)
        .with_context(|| format!("parse ledger {}", path.display()))?;
    debug!(path = %path.display(), entries = ledger.len(), "ledger loaded");
    Ok(ledger)
}

/// Atomically write the ledger to disk (temp file + rename).
pub fn write_ledger(path: &Path, ledger: &Ledger) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(ledger).context("serialize ledger")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("ledger path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp ledger {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace ledger {}", path.display()))?;
    Ok(())
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = file
            .read(&mut chunk)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
