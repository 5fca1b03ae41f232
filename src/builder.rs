//! Artifact Builder: sources in, artifact files out.
//!
//! Order of work for one build:
//! 1. resolve every source into text (skipping what cannot be read)
//! 2. reject the build with `EmptyContent` if nothing usable remains
//! 3. load the indexing backend (only now, so empty requests stay cheap)
//! 4. encode into the artifact's files
//!
//! Rebuilding over an existing artifact runs inside a [`Transaction`], so
//! a failed encode leaves the previous files in place.
//!
//! While a build runs it is listed in [`PendingBuilds`] under
//! `(artifact name, request id)` for diagnostics.

use membank_core::engine::Encoder;
use membank_core::models::{ArtifactFiles, EncodeOptions, EncodeStats};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::config::SourcesConfig;
use crate::error::{BridgeError, Result};
use crate::sources::{SourceDescriptor, SourceResolver};
use crate::transaction::Transaction;

/// A build in flight.
#[derive(Debug, Clone)]
pub struct PendingBuild {
    pub name: String,
    pub request_id: u64,
    pub started: Instant,
}

type BuildKey = (String, u64);

/// Registry of in-flight builds. Entries exist only while their
/// [`PendingGuard`] is alive.
#[derive(Default)]
pub struct PendingBuilds {
    inner: Mutex<HashMap<BuildKey, PendingBuild>>,
}

impl PendingBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, request_id: u64) -> PendingGuard<'_> {
        let key = (name.to_string(), request_id);
        let entry = PendingBuild {
            name: name.to_string(),
            request_id,
            started: Instant::now(),
        };
        self.lock().insert(key.clone(), entry);
        PendingGuard {
            registry: self,
            key,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BuildKey, PendingBuild>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds currently running for `name`.
    pub fn for_name(&self, name: &str) -> Vec<PendingBuild> {
        self.lock()
            .values()
            .filter(|b| b.name == name)
            .cloned()
            .collect()
    }
}

/// Removes its registry entry when dropped, whether the build succeeded,
/// failed or panicked.
pub struct PendingGuard<'a> {
    registry: &'a PendingBuilds,
    key: BuildKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub files: ArtifactFiles,
    pub stats: EncodeStats,
}

pub struct ArtifactBuilder<'a> {
    sources: &'a SourcesConfig,
    pending: &'a PendingBuilds,
}

impl<'a> ArtifactBuilder<'a> {
    pub fn new(sources: &'a SourcesConfig, pending: &'a PendingBuilds) -> Self {
        Self { sources, pending }
    }

    /// Resolve and join sources, failing with `EmptyContent` when nothing
    /// but whitespace remains.
    pub fn accumulate(&self, sources: &[SourceDescriptor]) -> Result<String> {
        let text = SourceResolver::new(self.sources)?.accumulate(sources);
        if text.trim().is_empty() {
            return Err(BridgeError::EmptyContent);
        }
        Ok(text)
    }

    /// Build `files` from `sources`. `load` is called only once there is
    /// content to encode.
    pub fn build<'e>(
        &self,
        files: &ArtifactFiles,
        request_id: u64,
        sources: &[SourceDescriptor],
        opts: &EncodeOptions,
        load: impl FnOnce() -> Result<&'e dyn Encoder>,
    ) -> Result<BuildOutput> {
        let name = files.name();
        let _pending = self.pending.register(&name, request_id);

        let text = self.accumulate(sources)?;
        let encoder = load()?;

        tracing::info!(
            req = request_id,
            artifact = %name,
            chars = text.len(),
            "Encoding memory bank"
        );
        let replacing = files.all().iter().any(|p| p.exists());
        let tx = if replacing {
            Some(Transaction::begin(files, request_id)?)
        } else {
            None
        };

        let stats = match encode_step(encoder, &[text], opts, files, request_id) {
            Ok(stats) => {
                if let Some(tx) = tx {
                    tx.commit()?;
                }
                stats
            }
            Err(cause) => {
                if let Some(tx) = tx {
                    if let Err(e) = tx.rollback() {
                        tracing::error!(artifact = %name, "Rollback incomplete: {}", e);
                    }
                }
                return Err(BridgeError::Encode(cause));
            }
        };

        Ok(BuildOutput {
            files: files.clone(),
            stats,
        })
    }
}

/// The encode step shared by builds and updates.
pub fn encode_step(
    encoder: &dyn Encoder,
    units: &[String],
    opts: &EncodeOptions,
    files: &ArtifactFiles,
    request_id: u64,
) -> anyhow::Result<EncodeStats> {
    let stats = encoder.encode_units(units, opts, files)?;
    tracing::info!(
        req = request_id,
        artifact = %files.name(),
        chunks = stats.chunks,
        elapsed_ms = stats.elapsed_ms,
        "Encoded memory bank"
    );
    Ok(stats)
}
