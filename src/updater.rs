//! Transactional Updater: append content to an existing artifact.
//!
//! The artifact is rebuilt in place from its stored units plus the new
//! content, inside a [`Transaction`] so a failed rebuild leaves the
//! previous files exactly as they were. A successful rebuild invalidates the
//! artifact's cached retriever before the transaction commits.

use membank_core::engine::Encoder;
use membank_core::models::{ArtifactFiles, EncodeOptions, EncodeStats};
use serde::{Deserialize, Serialize};

use crate::builder::encode_step;
use crate::cache::RetrieverCache;
use crate::error::{BridgeError, Result};
use crate::transaction::Transaction;

/// Optional descriptive header for appended content.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ContentMetadata {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Prefix `content` with one header line per present metadata field.
pub fn wrap_with_metadata(content: &str, metadata: Option<&ContentMetadata>) -> String {
    let Some(meta) = metadata else {
        return content.to_string();
    };

    let present = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let mut header = Vec::new();
    if let Some(source) = present(&meta.source) {
        header.push(format!("Source: {}", source));
    }
    if let Some(category) = present(&meta.category) {
        header.push(format!("Category: {}", category));
    }
    if let Some(timestamp) = present(&meta.timestamp) {
        header.push(format!("Timestamp: {}", timestamp));
    }
    let tags: Vec<&str> = meta
        .tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if !tags.is_empty() {
        header.push(format!("Tags: {}", tags.join(", ")));
    }

    if header.is_empty() {
        content.to_string()
    } else {
        format!("{}\n\n{}", header.join("\n"), content)
    }
}

/// Outcome of a successful append.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub chunks_added: usize,
    pub stats: EncodeStats,
}

pub struct Updater<'a> {
    cache: &'a RetrieverCache,
}

impl<'a> Updater<'a> {
    pub fn new(cache: &'a RetrieverCache) -> Self {
        Self { cache }
    }

    /// Append `content` to the artifact at `files`. `load` supplies the
    /// encoder once the artifact is known to exist.
    pub fn add<'e>(
        &self,
        files: &ArtifactFiles,
        content: &str,
        metadata: Option<&ContentMetadata>,
        opts: &EncodeOptions,
        request_id: u64,
        load: impl FnOnce() -> Result<&'e dyn Encoder>,
    ) -> Result<UpdateOutcome> {
        if !files.bulk_data.exists() {
            return Err(BridgeError::ArtifactNotFound(files.bulk_data.clone()));
        }
        if !files.index.exists() {
            return Err(BridgeError::ArtifactNotFound(files.index.clone()));
        }
        if content.trim().is_empty() {
            return Err(BridgeError::EmptyContent);
        }
        let encoder = load()?;

        let (mut units, previous_chunks) = match encoder.read_units(&files.index) {
            Ok(units) => (units, encoder.chunk_count(&files.index).unwrap_or(0)),
            Err(e) => {
                tracing::warn!(
                    req = request_id,
                    index = %files.index.display(),
                    "Existing index unreadable, rebuilding from new content only: {:#}",
                    e
                );
                (Vec::new(), 0)
            }
        };
        units.push(wrap_with_metadata(content, metadata));

        let tx = Transaction::begin(files, request_id)?;
        match encode_step(encoder, &units, opts, files, request_id) {
            Ok(stats) => {
                // The files on disk are already new, even if commit fails.
                self.cache.invalidate(&files.bulk_data, &files.index);
                tx.commit()?;
                let chunks_added = stats.chunks.saturating_sub(previous_chunks);
                tracing::info!(
                    req = request_id,
                    artifact = %files.name(),
                    units = units.len(),
                    chunks_added,
                    "Memory bank updated"
                );
                Ok(UpdateOutcome {
                    chunks_added,
                    stats,
                })
            }
            Err(cause) => {
                tracing::error!(
                    req = request_id,
                    artifact = %files.name(),
                    "Rebuild failed, rolling back: {:#}",
                    cause
                );
                if let Err(rollback_err) = tx.rollback() {
                    tracing::error!(
                        artifact = %files.name(),
                        "Rollback incomplete, marker kept for recovery: {}",
                        rollback_err
                    );
                    return Err(BridgeError::Rebuild(
                        cause.context(format!("rollback also failed: {}", rollback_err)),
                    ));
                }
                Err(BridgeError::Rebuild(cause))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{backup_path, marker_path};
    use membank_core::embedding::HashEmbedder;
    use membank_core::engine::local::LocalEngine;
    use membank_core::engine::QueryEngine;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine() -> LocalEngine {
        LocalEngine::new(Arc::new(HashEmbedder::new(32).unwrap()))
    }

    fn seeded(dir: &Path) -> ArtifactFiles {
        let files = ArtifactFiles::from_stem(dir.join("bank"));
        engine()
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

    /// Writes part of the bulk-data file, then fails.
    struct Failing(LocalEngine);

    impl Encoder for Failing {
        fn encode_units(
            &self,
            _units: &[String],
            _opts: &EncodeOptions,
            files: &ArtifactFiles,
        ) -> anyhow::Result<EncodeStats> {
            fs::write(&files.bulk_data, b"half written")?;
            anyhow::bail!("injected fault")
        }
        fn read_units(&self, index_file: &Path) -> anyhow::Result<Vec<String>> {
            self.0.read_units(index_file)
        }
        fn chunk_count(&self, index_file: &Path) -> anyhow::Result<usize> {
            self.0.chunk_count(index_file)
        }
    }

    /// Writes part of the bulk-data file, then panics.
    struct Panicking(LocalEngine);

    impl Encoder for Panicking {
        fn encode_units(
            &self,
            _units: &[String],
            _opts: &EncodeOptions,
            files: &ArtifactFiles,
        ) -> anyhow::Result<EncodeStats> {
            fs::write(&files.bulk_data, b"half written").unwrap();
            panic!("encoder crashed")
        }
        fn read_units(&self, index_file: &Path) -> anyhow::Result<Vec<String>> {
            self.0.read_units(index_file)
        }
        fn chunk_count(&self, index_file: &Path) -> anyhow::Result<usize> {
            self.0.chunk_count(index_file)
        }
    }

    /// Encodes normally, then removes the update marker so commit fails.
    struct LosesMarker(LocalEngine);

    impl Encoder for LosesMarker {
        fn encode_units(
            &self,
            units: &[String],
            opts: &EncodeOptions,
            files: &ArtifactFiles,
        ) -> anyhow::Result<EncodeStats> {
            let stats = self.0.encode_units(units, opts, files)?;
            fs::remove_file(marker_path(files))?;
            Ok(stats)
        }
        fn read_units(&self, index_file: &Path) -> anyhow::Result<Vec<String>> {
            self.0.read_units(index_file)
        }
        fn chunk_count(&self, index_file: &Path) -> anyhow::Result<usize> {
            self.0.chunk_count(index_file)
        }
    }

    #[test]
    fn test_metadata_header() {
        let meta = ContentMetadata {
            source: Some("chat".into()),
            category: None,
            timestamp: Some("2024-01-01T00:00:00Z".into()),
            tags: vec!["a".into(), " ".into(), "b".into()],
        };
        assert_eq!(
            wrap_with_metadata("body", Some(&meta)),
            "Source: chat\nTimestamp: 2024-01-01T00:00:00Z\nTags: a, b\n\nbody"
        );
        assert_eq!(wrap_with_metadata("body", None), "body");
        assert_eq!(wrap_with_metadata("body", Some(&ContentMetadata::default())), "body");
    }

    #[test]
    fn test_add_missing_artifact_does_not_load() {
        let tmp = TempDir::new().unwrap();
        let cache = RetrieverCache::new();
        let files = ArtifactFiles::from_stem(tmp.path().join("ghost"));
        let err = Updater::new(&cache)
            .add(&files, "x", None, &EncodeOptions::default(), 1, || {
                Err(BridgeError::Internal("should not load".into()))
            })
            .unwrap_err();
        assert_eq!(err.kind(), "ArtifactNotFound");
    }

    #[test]
    fn test_add_success_keeps_old_units_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let cache = RetrieverCache::new();
        let engine = engine();

        let out = Updater::new(&cache)
            .add(&files, "New fact about tides.", None, &EncodeOptions::default(), 2, || {
                Ok(&engine as &dyn Encoder)
            })
            .unwrap();
        assert_eq!(out.chunks_added, 1);
        assert!(no_leftovers(&files));

        let units = engine.read_units(&files.index).unwrap();
        assert_eq!(units.len(), 2);
        assert!(units[0].contains("lighthouses"));
        assert!(units[1].contains("tides"));
    }

    #[test]
    fn test_add_invalidates_cached_retriever() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let cache = RetrieverCache::new();
        let engine = engine();
        cache
            .get_or_create(&files.bulk_data, &files.index, || {
                engine.open(&files.bulk_data, &files.index)
            })
            .unwrap();

        Updater::new(&cache)
            .add(&files, "More.", None, &EncodeOptions::default(), 3, || {
                Ok(&engine as &dyn Encoder)
            })
            .unwrap();
        assert!(!cache.contains(&files.bulk_data, &files.index));
    }

    #[test]
    fn test_add_failure_restores_bytes() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let before = snapshot(&files);
        let cache = RetrieverCache::new();
        let failing = Failing(engine());

        let err = Updater::new(&cache)
            .add(&files, "doomed", None, &EncodeOptions::default(), 4, || {
                Ok(&failing as &dyn Encoder)
            })
            .unwrap_err();
        assert_eq!(err.kind(), "RebuildFailure");
        assert!(err.to_string().contains("injected fault"));
        assert_eq!(snapshot(&files), before);
        assert!(no_leftovers(&files));
    }

    #[test]
    fn test_panicking_encoder_restores_bytes() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let before = snapshot(&files);
        let cache = RetrieverCache::new();
        let panicking = Panicking(engine());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            Updater::new(&cache).add(&files, "doomed", None, &EncodeOptions::default(), 6, || {
                Ok(&panicking as &dyn Encoder)
            })
        }));
        assert!(result.is_err());
        assert_eq!(snapshot(&files), before);
        assert!(no_leftovers(&files));
    }

    #[test]
    fn test_failed_commit_still_invalidates_cache() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        let cache = RetrieverCache::new();
        let loses_marker = LosesMarker(engine());
        let engine = engine();
        cache
            .get_or_create(&files.bulk_data, &files.index, || {
                engine.open(&files.bulk_data, &files.index)
            })
            .unwrap();

        let err = Updater::new(&cache)
            .add(&files, "Late fact.", None, &EncodeOptions::default(), 7, || {
                Ok(&loses_marker as &dyn Encoder)
            })
            .unwrap_err();
        assert_eq!(err.kind(), "IoError");
        assert!(!cache.contains(&files.bulk_data, &files.index));
    }

    #[test]
    fn test_unreadable_index_rebuilds_from_new_content() {
        let tmp = TempDir::new().unwrap();
        let files = seeded(tmp.path());
        fs::write(&files.index, b"not an index").unwrap();
        let cache = RetrieverCache::new();
        let engine = engine();

        let out = Updater::new(&cache)
            .add(&files, "Fresh start.", None, &EncodeOptions::default(), 5, || {
                Ok(&engine as &dyn Encoder)
            })
            .unwrap();
        assert_eq!(out.chunks_added, 1);
        assert_eq!(engine.read_units(&files.index).unwrap(), vec!["Fresh start."]);
    }
}
