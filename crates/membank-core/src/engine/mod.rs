//! Indexing capabilities consumed by the bridge.
//!
//! The bridge never looks inside an artifact. It asks an [`Encoder`] to
//! persist text and a [`QueryEngine`] to open a [`Retriever`] over an
//! existing artifact. Anything that implements both is a [`Backend`].
//!
//! | Capability | Purpose |
//! |------------|---------|
//! | [`Encoder::encode_units`] | Chunk, embed and write all artifact files |
//! | [`Encoder::read_units`] | Recover the unit texts stored in an index file |
//! | [`Encoder::chunk_count`] | Count indexed chunks without loading vectors |
//! | [`QueryEngine::open`] | Build an in-memory query handle (expensive) |
//! | [`Retriever::search`] | Rank stored chunks against a query |
//!
//! All methods are synchronous and may block on I/O or model inference.

pub mod local;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::models::{ArtifactFiles, EncodeOptions, EncodeStats, RankedResult};

/// Writes artifacts. The sole authority on their internal format.
pub trait Encoder: Send + Sync {
    /// Encode `units` (independent blocks of text, each chunked on its own)
    /// and write the bulk-data, index and query-index files named by `files`,
    /// replacing whatever is there.
    fn encode_units(
        &self,
        units: &[String],
        opts: &EncodeOptions,
        files: &ArtifactFiles,
    ) -> Result<EncodeStats>;

    /// Encode one block of text.
    fn encode(&self, text: &str, opts: &EncodeOptions, files: &ArtifactFiles) -> Result<EncodeStats> {
        self.encode_units(&[text.to_string()], opts, files)
    }

    /// The unit texts an index file was built from, in original order.
    fn read_units(&self, index_file: &Path) -> Result<Vec<String>>;

    /// Number of chunks recorded in an index file.
    fn chunk_count(&self, index_file: &Path) -> Result<usize>;
}

/// Opens query handles over existing artifacts.
pub trait QueryEngine: Send + Sync {
    fn open(&self, bulk_data_file: &Path, index_file: &Path) -> Result<Arc<dyn Retriever>>;
}

/// A read-only, reusable query handle bound to one artifact.
pub trait Retriever: Send + Sync {
    fn search(&self, query: &str, top_k: usize) -> Result<Vec<RankedResult>>;

    /// Number of chunks held by this handle.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Both capabilities behind one object, as the bridge loads them.
pub trait Backend: Encoder + QueryEngine {
    fn as_encoder(&self) -> &dyn Encoder;
    fn as_query_engine(&self) -> &dyn QueryEngine;
}

impl<T: Encoder + QueryEngine> Backend for T {
    fn as_encoder(&self) -> &dyn Encoder {
        self
    }
    fn as_query_engine(&self) -> &dyn QueryEngine {
        self
    }
}
