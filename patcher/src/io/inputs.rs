//! Discovery of run inputs (POVs, reference diff) and patch outputs.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use submit_watch::ledger::file_sha256;
use tracing::{info, warn};

use crate::core::types::ReferenceDiff;
use crate::io::framework::list_files;

/// Extension that marks a patch file.
pub const PATCH_EXTENSION: &str = "diff";

/// Every POV file under `dir`, recursively, sorted by path, skipping dotfiles.
pub fn discover_povs(dir: &Path) -> Result<Vec<PathBuf>> {
    list_files(dir).with_context(|| format!("scan POVs in {}", dir.display()))
}

/// Read the reference diff if present. Absence or a read failure disables delta mode.
pub fn read_reference_diff(path: &Path) -> Option<ReferenceDiff> {
    match fs::read(path) {
        Ok(bytes) => {
            let diff = ReferenceDiff::parse(String::from_utf8_lossy(&bytes).into_owned());
            info!(
                chars = diff.text.chars().count(),
                changed_files = ?diff.changed_files,
                "reference diff found, delta mode on"
            );
            Some(diff)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "cannot read reference diff, delta mode off");
            None
        }
    }
}

/// Patch files directly in `dir`, sorted. Dotfiles (in-progress writes) are skipped.
pub fn list_patches(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    let mut patches = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_patch = path.extension().and_then(|e| e.to_str()) == Some(PATCH_EXTENSION);
        if !hidden && is_patch && path.is_file() {
            patches.push(path);
        }
    }
    patches.sort();
    Ok(patches)
}

/// Patch files in `dir` keyed by path, with the sha256 of their contents.
pub type PatchSnapshot = BTreeMap<PathBuf, String>;

/// Snapshot the patch directory. An unreadable file gets an empty digest.
pub fn snapshot_patches(dir: &Path) -> Result<PatchSnapshot> {
    let mut snapshot = PatchSnapshot::new();
    for path in list_patches(dir)? {
        let digest = file_sha256(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), err = %format!("{err:#}"), "cannot hash patch");
            String::new()
        });
        snapshot.insert(path, digest);
    }
    Ok(snapshot)
}

/// Patches in `after` that are new or whose contents changed since `before`.
pub fn new_patches(before: &PatchSnapshot, after: PatchSnapshot) -> Vec<PathBuf> {
    after
        .into_iter()
        .filter(|(path, digest)| before.get(path) != Some(digest))
        .map(|(path, _)| path)
        .collect()
}
