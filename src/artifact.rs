//! Artifact path derivation and per-artifact locking.
//!
//! Hosts name an artifact by any of its files (`notes.bank`, `notes.json`,
//! legacy `notes.mp4`) or by the bare stem. [`derive_files`] strips one known
//! extension and returns the canonical file set; relative names resolve
//! against the configured banks directory.

use dashmap::DashMap;
use membank_core::models::{with_suffix, ArtifactFiles};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Extensions recognized as naming an artifact file.
pub const KNOWN_EXTENSIONS: &[&str] = &["bank", "json", "idx", "mp4", "faiss"];

/// Suffix appended to a file while an update is in flight.
pub const BACKUP_SUFFIX: &str = "backup";

/// Suffix of the sidecar marker written for the duration of an update.
pub const MARKER_SUFFIX: &str = "update";

/// Strip one known artifact extension, if present.
pub fn strip_known_extension(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if KNOWN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => {
            path.with_extension("")
        }
        _ => path.to_path_buf(),
    }
}

/// Resolve a host-supplied path against `base` (absolute paths pass through).
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Canonical files for the artifact named by `path`.
pub fn derive_files(base: &Path, path: &Path) -> ArtifactFiles {
    ArtifactFiles::from_stem(strip_known_extension(&resolve(base, path)))
}

pub fn backup_path(file: &Path) -> PathBuf {
    with_suffix(file, BACKUP_SUFFIX)
}

pub fn marker_path(files: &ArtifactFiles) -> PathBuf {
    with_suffix(&files.stem, MARKER_SUFFIX)
}

/// One mutex per artifact stem, created on first use.
///
/// Builds, updates and retriever construction for the same stem take the
/// same lock, so their file accesses never interleave.
#[derive(Default)]
pub struct ArtifactLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl ArtifactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_stem(&self, stem: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(stem.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_known_extensions() {
        for name in ["notes.bank", "notes.json", "notes.idx", "notes.mp4", "notes.FAISS", "notes"] {
            assert_eq!(strip_known_extension(Path::new(name)), PathBuf::from("notes"), "{}", name);
        }
        assert_eq!(
            strip_known_extension(Path::new("notes.v2")),
            PathBuf::from("notes.v2")
        );
    }

    #[test]
    fn test_derive_files_relative_and_absolute() {
        let base = Path::new("/srv/banks");
        let rel = derive_files(base, Path::new("project/notes.mp4"));
        assert_eq!(rel.stem, PathBuf::from("/srv/banks/project/notes"));
        assert_eq!(rel.index, PathBuf::from("/srv/banks/project/notes.json"));

        let abs = derive_files(base, Path::new("/data/x.json"));
        assert_eq!(abs.bulk_data, PathBuf::from("/data/x.bank"));
    }

    #[test]
    fn test_backup_and_marker_paths() {
        let files = ArtifactFiles::from_stem("/b/notes");
        assert_eq!(backup_path(&files.index), PathBuf::from("/b/notes.json.backup"));
        assert_eq!(marker_path(&files), PathBuf::from("/b/notes.update"));
    }

    #[test]
    fn test_locks_shared_per_stem() {
        let locks = ArtifactLocks::new();
        let a = locks.for_stem(Path::new("/b/a"));
        let a2 = locks.for_stem(Path::new("/b/a"));
        let b = locks.for_stem(Path::new("/b/b"));
        assert!(Arc::ptr_eq(&a, &a2));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(locks.len(), 2);
    }
}
