//! The bridge instance: every piece of process-lifetime state, and one
//! handler per protocol method.
//!
//! All state lives in a [`Bridge`] value rather than in globals, so tests
//! can run several independent bridges side by side. Handlers take `&self`
//! and are safe to call from multiple threads.
//!
//! | Method | Handler | Needs backend |
//! |--------|---------|---------------|
//! | `ping` | [`Bridge::ping`] | no |
//! | `encode` | [`Bridge::encode`] | after sources resolve |
//! | `search` | [`Bridge::search`] | yes |
//! | `add_content` | [`Bridge::add_content`] | once the artifact exists |
//! | `stats` | [`Bridge::stats`] | yes |

use membank_core::engine::local::LocalEngine;
use membank_core::engine::{Backend, Encoder};
use membank_core::models::{ArtifactFiles, EncodeOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};

use crate::artifact::{derive_files, ArtifactLocks};
use crate::builder::{ArtifactBuilder, PendingBuilds};
use crate::cache::{self, RetrieverCache};
use crate::config::{Config, CHARS_PER_TOKEN};
use crate::embedding::create_embedder;
use crate::error::{BridgeError, Result};
use crate::loader::SubsystemLoader;
use crate::protocol::{
    AddContentParams, AddContentResult, ArtifactPaths, EncodeParams, EncodeResult, PingResult,
    SearchHit, SearchParams, SearchResult, StatsParams, StatsResult,
};
use crate::sources::parse_sources;
use crate::transaction::{recover_dir, RecoveryAction};
use crate::updater::Updater;

/// Shared handle to the loaded indexing backend.
pub type SharedBackend = Arc<dyn Backend>;

/// Backend built from the configured embedder and the file-backed engine.
pub fn default_backend(config: &Config) -> anyhow::Result<SharedBackend> {
    let embedder = create_embedder(&config.embedding)?;
    tracing::info!(
        model = embedder.model_name(),
        dims = embedder.dims(),
        "Embedder ready"
    );
    Ok(Arc::new(
        LocalEngine::new(embedder).with_batch_size(config.embedding.batch_size),
    ))
}

pub struct Bridge {
    config: Config,
    loader: SubsystemLoader<SharedBackend>,
    cache: RetrieverCache,
    locks: ArtifactLocks,
    pending: PendingBuilds,
    requests: AtomicU64,
}

impl Bridge {
    pub fn new(config: Config) -> Self {
        Self::with_backend_factory(config, default_backend)
    }

    /// A bridge whose backend comes from `factory`, called at most once
    /// successfully, on first use.
    pub fn with_backend_factory<F>(config: Config, factory: F) -> Self
    where
        F: Fn(&Config) -> anyhow::Result<SharedBackend> + Send + Sync + 'static,
    {
        let init_config = config.clone();
        Self {
            config,
            loader: SubsystemLoader::new(move || factory(&init_config)),
            cache: RetrieverCache::new(),
            locks: ArtifactLocks::new(),
            pending: PendingBuilds::new(),
            requests: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &RetrieverCache {
        &self.cache
    }

    pub fn loader(&self) -> &SubsystemLoader<SharedBackend> {
        &self.loader
    }

    pub fn pending(&self) -> &PendingBuilds {
        &self.pending
    }

    /// Diagnostic correlation id: strictly increasing, starting at 1.
    pub fn next_request_id(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn ensure_loaded(&self) -> Result<&SharedBackend> {
        self.loader.ensure_loaded()
    }

    /// Canonical files for a host-supplied artifact path.
    pub fn artifact_files(&self, path: &str) -> ArtifactFiles {
        derive_files(&self.config.storage.banks_dir, Path::new(path))
    }

    /// Resolve half-applied updates under the banks directory.
    pub fn recover_all(&self) -> Result<Vec<(ArtifactFiles, RecoveryAction)>> {
        recover_dir(&self.config.storage.banks_dir)
    }

    fn encode_options(&self, chunk_size: Option<usize>, overlap: Option<usize>) -> EncodeOptions {
        let chunking = &self.config.chunking;
        let max_chars = chunk_size
            .unwrap_or(chunking.max_tokens * CHARS_PER_TOKEN)
            .max(1);
        let overlap_chars = overlap
            .unwrap_or(chunking.overlap_tokens * CHARS_PER_TOKEN)
            .min(max_chars - 1);
        EncodeOptions {
            max_chars,
            overlap_chars,
        }
    }

    fn lock_artifact(&self, files: &ArtifactFiles) -> Arc<std::sync::Mutex<()>> {
        self.locks.for_stem(&files.stem)
    }

    fn encoder(&self) -> Result<&dyn Encoder> {
        Ok(self.ensure_loaded()?.as_encoder())
    }

    pub fn ping(&self) -> PingResult {
        PingResult::pong()
    }

    pub fn encode(&self, params: EncodeParams) -> EncodeResult {
        let req = self.next_request_id();
        match self.try_encode(req, params) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(req, kind = e.kind(), "encode failed: {}", e);
                EncodeResult::failure(&e)
            }
        }
    }

    fn try_encode(&self, req: u64, params: EncodeParams) -> Result<EncodeResult> {
        let files = self.artifact_files(&params.output_path);
        let sources = parse_sources(&params.sources);
        if let Some(model) = &params.embedding_model {
            tracing::debug!(req, model = %model, "Ignoring per-request embedding model");
        }
        tracing::info!(req, artifact = %files.name(), sources = sources.len(), "Creating memory bank");

        let opts = self.encode_options(params.chunk_size, params.overlap);
        let lock = self.lock_artifact(&files);
        let _guard = acquire(&lock);

        let built = ArtifactBuilder::new(&self.config.sources, &self.pending).build(
            &files,
            req,
            &sources,
            &opts,
            || self.encoder(),
        );
        // A failed commit still leaves new files behind.
        self.cache.invalidate(&files.bulk_data, &files.index);
        let output = built?;

        Ok(EncodeResult {
            success: true,
            chunks_created: output.stats.chunks,
            files: Some(artifact_paths(&output.files)),
            stats: serde_json::to_value(&output.stats).ok(),
            error: None,
            error_type: None,
        })
    }

    pub fn search(&self, params: SearchParams) -> SearchResult {
        let req = self.next_request_id();
        match self.try_search(req, params) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(req, kind = e.kind(), "search failed: {}", e);
                SearchResult::failure(&e)
            }
        }
    }

    fn try_search(&self, req: u64, params: SearchParams) -> Result<SearchResult> {
        let base = &self.config.storage.banks_dir;
        let bulk_data_file = derive_files(base, Path::new(&params.bulk_data_file)).bulk_data;
        let index_file = derive_files(base, Path::new(&params.index_file)).index;
        for file in [&bulk_data_file, &index_file] {
            if !file.exists() {
                return Err(BridgeError::ArtifactNotFound(file.clone()));
            }
        }

        let retrieval = &self.config.retrieval;
        let top_k = params
            .top_k
            .unwrap_or(retrieval.default_top_k)
            .min(retrieval.max_top_k);
        let min_score = params.min_score.unwrap_or(retrieval.min_score);
        tracing::info!(req, index = %index_file.display(), top_k, "Searching memory bank");

        let backend = self.ensure_loaded()?;
        let retriever = {
            let lock = self.locks.for_stem(&derive_files(base, &index_file).stem);
            let _guard = acquire(&lock);
            self.cache
                .get_or_create(&bulk_data_file, &index_file, || {
                    backend.as_query_engine().open(&bulk_data_file, &index_file)
                })
                .map_err(|e| BridgeError::Internal(format!("{:#}", e)))?
        };

        let timed = cache::search(retriever.as_ref(), &params.query, top_k)
            .map_err(|e| BridgeError::Internal(format!("{:#}", e)))?;
        let results: Vec<SearchHit> = timed
            .results
            .into_iter()
            .filter(|r| r.score >= min_score)
            .map(|r| SearchHit {
                content: r.content,
                score: r.score,
                source: r.source,
                metadata: r.metadata,
            })
            .collect();
        tracing::info!(
            req,
            results = results.len(),
            elapsed_ms = timed.elapsed_ms,
            "Search complete"
        );

        Ok(SearchResult {
            success: true,
            total_results: results.len(),
            results,
            search_time_ms: Some(timed.elapsed_ms),
            error: None,
            error_type: None,
        })
    }

    pub fn add_content(&self, params: AddContentParams) -> AddContentResult {
        let req = self.next_request_id();
        match self.try_add_content(req, params) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(req, kind = e.kind(), "add_content failed: {}", e);
                AddContentResult::failure(&e)
            }
        }
    }

    fn try_add_content(&self, req: u64, params: AddContentParams) -> Result<AddContentResult> {
        let files = self.artifact_files(&params.bank_path);
        tracing::info!(req, artifact = %files.name(), "Adding content");
        let opts = self.encode_options(params.chunk_size, params.overlap);

        let lock = self.lock_artifact(&files);
        let _guard = acquire(&lock);
        let outcome = Updater::new(&self.cache).add(
            &files,
            &params.content,
            params.metadata.as_ref(),
            &opts,
            req,
            || self.encoder(),
        )?;

        Ok(AddContentResult {
            success: true,
            chunks_added: outcome.chunks_added,
            error: None,
            error_type: None,
        })
    }

    pub fn stats(&self, params: StatsParams) -> StatsResult {
        let req = self.next_request_id();
        match self.try_stats(&params) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(req, kind = e.kind(), "stats failed: {}", e);
                StatsResult::failure(&e)
            }
        }
    }

    fn try_stats(&self, params: &StatsParams) -> Result<StatsResult> {
        let files = self.artifact_files(&params.bank_path);
        if !files.index.exists() {
            return Err(BridgeError::ArtifactNotFound(files.index.clone()));
        }
        let chunks = self
            .encoder()?
            .chunk_count(&files.index)
            .map_err(|e| BridgeError::Internal(format!("{:#}", e)))?;
        let size_bytes = files
            .all()
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();

        Ok(StatsResult {
            success: true,
            chunks,
            size_bytes,
            files: Some(artifact_paths(&files)),
            error: None,
            error_type: None,
        })
    }
}

/// Artifact locks guard no data, so a lock poisoned by a panicking request
/// is taken over as is.
fn acquire(lock: &std::sync::Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

fn artifact_paths(files: &ArtifactFiles) -> ArtifactPaths {
    ArtifactPaths {
        bulk_data: files.bulk_data.display().to_string(),
        query_index: files.query_index.display().to_string(),
        metadata_index: files.index.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn bridge(dir: &Path) -> Bridge {
        let mut config = Config::default();
        config.storage.banks_dir = dir.to_path_buf();
        config.embedding.dims = Some(64);
        Bridge::new(config)
    }

    fn encode(bridge: &Bridge, sources: serde_json::Value, output: &str) -> EncodeResult {
        bridge.encode(serde_json::from_value(json!({"sources": sources, "output_path": output})).unwrap())
    }

    fn search(bridge: &Bridge, name: &str, query: &str) -> SearchResult {
        bridge.search(
            serde_json::from_value(json!({
                "bulk_data_file": format!("{}.bank", name),
                "index_file": format!("{}.json", name),
                "query": query
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_request_ids_strictly_increase() {
        let tmp = TempDir::new().unwrap();
        let b = bridge(tmp.path());
        let ids: Vec<u64> = (0..5).map(|_| b.next_request_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_ping_does_not_load_backend() {
        let tmp = TempDir::new().unwrap();
        let b = bridge(tmp.path());
        assert_eq!(b.ping(), PingResult::pong());
        assert!(!b.loader().is_ready());
    }

    #[test]
    fn test_encode_relative_path_lands_in_banks_dir() {
        let tmp = TempDir::new().unwrap();
        let b = bridge(tmp.path());
        let result = encode(&b, json!(["Some text to remember."]), "notes.mp4");
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.chunks_created, 1);
        assert!(tmp.path().join("notes.bank").exists());
        assert!(tmp.path().join("notes.json").exists());
        assert!(tmp.path().join("notes.idx").exists());
        assert!(b.pending().is_empty());
    }

    #[test]
    fn test_encode_empty_sources_is_empty_content() {
        let tmp = TempDir::new().unwrap();
        let b = bridge(tmp.path());
        let result = encode(&b, json!([]), "empty");
        assert!(!result.success);
        assert_eq!(result.chunks_created, 0);
        assert_eq!(result.error_type.as_deref(), Some("EmptyContent"));
        assert!(!b.loader().is_ready());
    }

    #[test]
    fn test_search_reuses_retriever() {
        let tmp = TempDir::new().unwrap();
        let b = bridge(tmp.path());
        assert!(encode(&b, json!(["Rust ownership rules."]), "kb").success);

        let first = search(&b, "kb", "ownership");
        let second = search(&b, "kb", "ownership");
        assert!(first.success && second.success);
        assert_eq!(first.total_results, 1);
        assert_eq!(b.cache().constructions(), 1);
    }

    #[test]
    fn test_search_missing_artifact() {
        let tmp = TempDir::new().unwrap();
        let b = bridge(tmp.path());
        let result = search(&b, "ghost", "anything");
        assert!(!result.success);
        assert!(result.results.is_empty());
        assert_eq!(result.error_type.as_deref(), Some("ArtifactNotFound"));
    }

    #[test]
    fn test_add_content_then_search_sees_new_text() {
        let tmp = TempDir::new().unwrap();
        let b = bridge(tmp.path());
        assert!(encode(&b, json!(["Alpha facts about gardens."]), "kb").success);
        assert_eq!(search(&b, "kb", "gardens").total_results, 1);

        let added = b.add_content(
            serde_json::from_value(json!({
                "bank_path": "kb.json",
                "content": "Beta facts about volcanoes.",
                "metadata": {"source": "test", "category": "geology"}
            }))
            .unwrap(),
        );
        assert!(added.success, "{:?}", added.error);
        assert_eq!(added.chunks_added, 1);

        let after = search(&b, "kb", "volcanoes");
        assert!(after.success);
        assert!(after.results[0].content.contains("volcanoes"));
        assert!(after.results[0].content.contains("Category: geology"));
        assert_eq!(b.cache().constructions(), 2);
    }

    #[test]
    fn test_stats_reports_chunks() {
        let tmp = TempDir::new().unwrap();
        let b = bridge(tmp.path());
        assert!(encode(&b, json!(["One.", "Two."]), "kb").success);
        let stats = b.stats(StatsParams {
            bank_path: "kb".to_string(),
        });
        assert!(stats.success);
        assert_eq!(stats.chunks, 1);
        assert!(stats.size_bytes > 0);
    }

    #[test]
    fn test_encode_options_from_config_and_overrides() {
        let tmp = TempDir::new().unwrap();
        let b = bridge(tmp.path());
        assert_eq!(
            b.encode_options(None, None),
            EncodeOptions {
                max_chars: 512,
                overlap_chars: 0
            }
        );
        assert_eq!(
            b.encode_options(Some(100), Some(500)),
            EncodeOptions {
                max_chars: 100,
                overlap_chars: 99
            }
        );
    }
}
