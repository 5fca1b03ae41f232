//! Retriever Cache.
//!
//! Maps an artifact's `(bulk_data_file, index_file)` pair to an open
//! [`Retriever`]. Construction happens inside DashMap's entry API, which
//! holds the key's shard while the handle is built, so concurrent misses on
//! one key construct it once. Entries live until [`RetrieverCache::invalidate`].

use dashmap::DashMap;
use membank_core::engine::Retriever;
use membank_core::models::RankedResult;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

type CacheKey = (PathBuf, PathBuf);

#[derive(Default)]
pub struct RetrieverCache {
    entries: DashMap<CacheKey, Arc<dyn Retriever>>,
    constructions: AtomicUsize,
}

impl RetrieverCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached handle for the pair, or one built by `open` on a miss.
    /// A failed `open` caches nothing.
    pub fn get_or_create(
        &self,
        bulk_data_file: &Path,
        index_file: &Path,
        open: impl FnOnce() -> anyhow::Result<Arc<dyn Retriever>>,
    ) -> anyhow::Result<Arc<dyn Retriever>> {
        let key = (bulk_data_file.to_path_buf(), index_file.to_path_buf());
        if let Some(hit) = self.entries.get(&key) {
            tracing::debug!(index = %index_file.display(), "Retriever cache hit");
            return Ok(Arc::clone(hit.value()));
        }

        let entry = self.entries.entry(key).or_try_insert_with(|| {
            self.constructions.fetch_add(1, Ordering::SeqCst);
            tracing::info!(index = %index_file.display(), "Opening retriever");
            open()
        })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Drop the handle for the pair. Returns whether one was cached.
    pub fn invalidate(&self, bulk_data_file: &Path, index_file: &Path) -> bool {
        let removed = self
            .entries
            .remove(&(bulk_data_file.to_path_buf(), index_file.to_path_buf()))
            .is_some();
        if removed {
            tracing::debug!(index = %index_file.display(), "Retriever cache entry invalidated");
        }
        removed
    }

    pub fn contains(&self, bulk_data_file: &Path, index_file: &Path) -> bool {
        self.entries
            .contains_key(&(bulk_data_file.to_path_buf(), index_file.to_path_buf()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handles built since this cache was created.
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}

/// Ranked results plus wall-clock search time.
#[derive(Debug, Clone)]
pub struct TimedResults {
    pub results: Vec<RankedResult>,
    pub elapsed_ms: f64,
}

pub fn search(retriever: &dyn Retriever, query: &str, top_k: usize) -> anyhow::Result<TimedResults> {
    let started = Instant::now();
    let results = retriever.search(query, top_k)?;
    Ok(TimedResults {
        results,
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
    })
}
