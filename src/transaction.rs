//! Backup-and-rollback around an artifact rewrite, and crash recovery.
//!
//! ```text
//! Stable(old) -> marker written -> files renamed to *.backup -> encode
//!     ok:  remove marker (commit point), delete backups     -> Stable(new)
//!     err: restore backups, delete new files, remove marker  -> Stable(old)
//! ```
//!
//! The sidecar marker `<stem>.update` lists which files existed before the
//! rewrite, so [`recover`] can finish or undo a half-applied rewrite from
//! disk state alone after a crash.

use chrono::Utc;
use membank_core::models::ArtifactFiles;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::artifact::{backup_path, marker_path, strip_known_extension, BACKUP_SUFFIX, MARKER_SUFFIX};
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MarkerEntry {
    path: PathBuf,
    existed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct UpdateMarker {
    started_at: String,
    request_id: u64,
    files: Vec<MarkerEntry>,
}

/// Guard around one rewrite of an artifact's files.
///
/// Dropping a transaction without calling [`commit`](Self::commit) or
/// [`rollback`](Self::rollback), for example while unwinding from a panic
/// in the encoder, rolls it back. Only a process that dies outright
/// leaves the marker behind for [`recover`].
pub struct Transaction {
    marker: PathBuf,
    entries: Vec<MarkerEntry>,
    done: bool,
}

impl Transaction {
    /// Write the marker, then move every existing file to its backup.
    ///
    /// A file that cannot be renamed is copied instead. If that also fails
    /// the rewrite goes ahead without a backup for that file.
    pub fn begin(files: &ArtifactFiles, request_id: u64) -> Result<Self> {
        let entries: Vec<MarkerEntry> = files
            .all()
            .iter()
            .map(|p| MarkerEntry {
                path: p.to_path_buf(),
                existed: p.exists(),
            })
            .collect();

        let marker = marker_path(files);
        let record = UpdateMarker {
            started_at: Utc::now().to_rfc3339(),
            request_id,
            files: entries.clone(),
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| BridgeError::Internal(format!("serialize update marker: {}", e)))?;
        fs::write(&marker, json)?;

        for entry in entries.iter().filter(|e| e.existed) {
            let backup = backup_path(&entry.path);
            if let Err(rename_err) = fs::rename(&entry.path, &backup) {
                match fs::copy(&entry.path, &backup) {
                    Ok(_) => tracing::warn!(
                        file = %entry.path.display(),
                        "Rename to backup failed ({}), copied instead",
                        rename_err
                    ),
                    Err(copy_err) => tracing::warn!(
                        file = %entry.path.display(),
                        "No backup possible (rename: {}, copy: {}); continuing",
                        rename_err,
                        copy_err
                    ),
                }
            }
        }

        Ok(Self {
            marker,
            entries,
            done: false,
        })
    }

    /// Make the new files permanent.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        fs::remove_file(&self.marker)?;
        for entry in &self.entries {
            if let Err(e) = remove_if_exists(&backup_path(&entry.path)) {
                tracing::warn!(file = %entry.path.display(), "Failed to delete backup: {}", e);
            }
        }
        Ok(())
    }

    /// Put every backed-up file back and remove files the failed rewrite
    /// created.
    pub fn rollback(mut self) -> Result<()> {
        self.done = true;
        restore(&self.entries)?;
        remove_if_exists(&self.marker)?;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        tracing::warn!(marker = %self.marker.display(), "Update abandoned, rolling back");
        match restore(&self.entries) {
            Ok(()) => {
                if let Err(e) = remove_if_exists(&self.marker) {
                    tracing::error!(marker = %self.marker.display(), "Failed to remove marker: {}", e);
                }
            }
            Err(e) => tracing::error!(
                marker = %self.marker.display(),
                "Rollback incomplete, marker kept for recovery: {}",
                e
            ),
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Restore every entry, even after one fails. Returns the first error.
fn restore(entries: &[MarkerEntry]) -> io::Result<()> {
    let mut first_err = None;
    for entry in entries {
        if let Err(e) = restore_one(entry) {
            tracing::error!(file = %entry.path.display(), "Failed to restore: {}", e);
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn restore_one(entry: &MarkerEntry) -> io::Result<()> {
    let backup = backup_path(&entry.path);
    if backup.exists() {
        remove_if_exists(&entry.path)?;
        fs::rename(&backup, &entry.path)?;
    } else if !entry.existed {
        remove_if_exists(&entry.path)?;
    } else if !entry.path.exists() {
        tracing::error!(file = %entry.path.display(), "File lost: no backup to restore from");
    }
    Ok(())
}

/// What [`recover`] did for one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing pending.
    Clean,
    /// A rewrite never committed; the previous files were restored.
    RolledBack,
    /// A rewrite committed but its backups survived; they were deleted.
    RemovedStaleBackups(usize),
}

/// Resolve any half-applied rewrite of the artifact at `files`.
pub fn recover(files: &ArtifactFiles) -> Result<RecoveryAction> {
    let marker = marker_path(files);

    if marker.exists() {
        let entries = match fs::read(&marker)
            .ok()
            .and_then(|raw| serde_json::from_slice::<UpdateMarker>(&raw).ok())
        {
            Some(record) => record.files,
            None => {
                // Unreadable marker: trust whatever backups are on disk.
                tracing::warn!(marker = %marker.display(), "Update marker unreadable");
                files
                    .all()
                    .iter()
                    .map(|p| MarkerEntry {
                        path: p.to_path_buf(),
                        existed: backup_path(p).exists(),
                    })
                    .collect()
            }
        };
        restore(&entries)?;
        fs::remove_file(&marker)?;
        tracing::info!(artifact = %files.name(), "Rolled back interrupted update");
        return Ok(RecoveryAction::RolledBack);
    }

    let mut removed = 0;
    for file in files.all() {
        let backup = backup_path(file);
        if backup.exists() {
            fs::remove_file(&backup)?;
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(artifact = %files.name(), removed, "Removed stale backups");
        Ok(RecoveryAction::RemovedStaleBackups(removed))
    } else {
        Ok(RecoveryAction::Clean)
    }
}

/// Run [`recover`] for every artifact under `dir` that has a marker or a
/// backup file.
pub fn recover_dir(dir: &Path) -> Result<Vec<(ArtifactFiles, RecoveryAction)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let marker_ext = format!(".{}", MARKER_SUFFIX);
    let backup_ext = format!(".{}", BACKUP_SUFFIX);
    let mut stems = BTreeSet::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry during recovery: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().to_string_lossy().to_string();
        if let Some(stem) = path.strip_suffix(&marker_ext) {
            stems.insert(PathBuf::from(stem));
        } else if let Some(file) = path.strip_suffix(&backup_ext) {
            stems.insert(strip_known_extension(Path::new(file)));
        }
    }

    let mut actions = Vec::new();
    for stem in stems {
        let files = ArtifactFiles::from_stem(stem);
        match recover(&files) {
            Ok(action) => actions.push((files, action)),
            Err(e) => tracing::error!(artifact = %files.name(), "Recovery failed: {}", e),
        }
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use membank_core::embedding::HashEmbedder;
    use membank_core::engine::local::LocalEngine;
    use membank_core::engine::Encoder;
    use membank_core::models::EncodeOptions;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn seeded(dir: &Path) -> ArtifactFiles {
        let files = ArtifactFiles::from_stem(dir.join("bank"));
        LocalEngine::new(Arc::new(HashEmbedder::new(32).unwrap()))
            .encode("Original knowledge about lighthouses.", &EncodeOptions::default(), &files)
            .unwrap();
        files
    }

    fn snapshot(files: &ArtifactFiles) -> Vec<Vec<u8>> {
        files.all().iter().map(|p| fs::read(p).unwrap()).collect()
    }

    fn no_leftovers(files: &ArtifactFiles) -> bool {
        files.all().iter().all(|p| !backup_path(p).exists()) && !marker_path(files).exists()
    }

    #[test]
    fn test_begin_moves_files_aside_and_writes_marker() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let tx = Transaction::begin(&files, 1).unwrap();
        assert!(marker_path(&files).exists());
        for p in files.all() {
            assert!(!p.exists());
            assert!(backup_path(p).exists());
        }
        tx.rollback().unwrap();
        assert!(no_leftovers(&files));
    }

    #[test]
    fn test_commit_keeps_new_files() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let tx = Transaction::begin(&files, 2).unwrap();
        for p in files.all() {
            fs::write(p, b"new").unwrap();
        }
        tx.commit().unwrap();
        assert!(no_leftovers(&files));
        assert_eq!(fs::read(&files.index).unwrap(), b"new");
    }

    #[test]
    fn test_rollback_restores_bytes() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let before = snapshot(&files);
        let tx = Transaction::begin(&files, 3).unwrap();
        fs::write(&files.bulk_data, b"half written").unwrap();
        tx.rollback().unwrap();
        assert_eq!(snapshot(&files), before);
        assert!(no_leftovers(&files));
    }

    #[test]
    fn test_rollback_removes_files_that_did_not_exist() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        fs::remove_file(&files.query_index).unwrap();

        let tx = Transaction::begin(&files, 4).unwrap();
        fs::write(&files.query_index, b"new").unwrap();
        tx.rollback().unwrap();
        assert!(!files.query_index.exists());
        assert!(files.index.exists());
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let before = snapshot(&files);

        let tx = Transaction::begin(&files, 8).unwrap();
        fs::write(&files.index, b"partial").unwrap();
        drop(tx);

        assert_eq!(snapshot(&files), before);
        assert!(no_leftovers(&files));
    }

    #[test]
    fn test_panic_mid_rewrite_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let before = snapshot(&files);

        let outcome = std::panic::catch_unwind(|| {
            let _tx = Transaction::begin(&files, 9).unwrap();
            fs::write(&files.bulk_data, b"half written").unwrap();
            panic!("encoder blew up");
        });
        assert!(outcome.is_err());
        assert_eq!(snapshot(&files), before);
        assert!(no_leftovers(&files));
    }

    #[test]
    fn test_rollback_restores_remaining_files_after_one_fails() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let before = snapshot(&files);

        let tx = Transaction::begin(&files, 10).unwrap();
        // A non-empty directory where the bulk-data file belongs cannot be
        // removed with remove_file, so its backup cannot go back.
        fs::create_dir_all(files.bulk_data.join("blocker")).unwrap();

        assert!(tx.rollback().is_err());
        assert_eq!(fs::read(&files.index).unwrap(), before[1]);
        assert_eq!(fs::read(&files.query_index).unwrap(), before[2]);
        assert!(backup_path(&files.bulk_data).exists());
        assert!(marker_path(&files).exists());
    }

    #[test]
    fn test_recover_rolls_back_interrupted_update() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let before = snapshot(&files);

        let tx = Transaction::begin(&files, 5).unwrap();
        fs::write(&files.index, b"partial").unwrap();
        std::mem::forget(tx);

        assert_eq!(recover(&files).unwrap(), RecoveryAction::RolledBack);
        assert_eq!(snapshot(&files), before);
        assert!(no_leftovers(&files));
    }

    #[test]
    fn test_recover_with_corrupt_marker_uses_backups() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let before = snapshot(&files);

        let tx = Transaction::begin(&files, 6).unwrap();
        std::mem::forget(tx);
        fs::write(marker_path(&files), b"{garbage").unwrap();

        assert_eq!(recover(&files).unwrap(), RecoveryAction::RolledBack);
        assert_eq!(snapshot(&files), before);
    }

    #[test]
    fn test_recover_deletes_backups_after_commit_point() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        fs::write(backup_path(&files.index), b"old").unwrap();

        assert_eq!(
            recover(&files).unwrap(),
            RecoveryAction::RemovedStaleBackups(1)
        );
        assert!(no_leftovers(&files));
        assert_eq!(recover(&files).unwrap(), RecoveryAction::Clean);
    }

    #[test]
    fn test_recover_dir_finds_nested_artifacts() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("team");
        fs::create_dir_all(&nested).unwrap();
        let files = seeded(&nested);
        let tx = Transaction::begin(&files, 7).unwrap();
        std::mem::forget(tx);

        let actions = recover_dir(tmp.path()).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].0.stem, files.stem);
        assert_eq!(actions[0].1, RecoveryAction::RolledBack);
        assert!(files.index.exists());
    }

    #[test]
    fn test_recover_dir_missing_is_empty() {
        assert!(recover_dir(Path::new("/definitely/not/a/dir")).unwrap().is_empty());
    }
}
