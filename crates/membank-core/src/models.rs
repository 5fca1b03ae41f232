//! Data types that flow between the bridge and the indexing engine.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Extension of the bulk-data file (one encoded frame per chunk).
pub const BULK_DATA_EXT: &str = "bank";
/// Extension of the primary index file (chunk manifest).
pub const INDEX_EXT: &str = "json";
/// Extension of the auxiliary query index (vectors).
pub const QUERY_INDEX_EXT: &str = "idx";

/// The on-disk files that make up one artifact ("memory bank").
///
/// Identity is the `stem`: the path without any artifact extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactFiles {
    pub stem: PathBuf,
    pub bulk_data: PathBuf,
    pub index: PathBuf,
    pub query_index: PathBuf,
}

impl ArtifactFiles {
    pub fn from_stem(stem: impl Into<PathBuf>) -> Self {
        let stem = stem.into();
        Self {
            bulk_data: with_suffix(&stem, BULK_DATA_EXT),
            index: with_suffix(&stem, INDEX_EXT),
            query_index: with_suffix(&stem, QUERY_INDEX_EXT),
            stem,
        }
    }

    /// All three files, bulk data first.
    pub fn all(&self) -> [&Path; 3] {
        [&self.bulk_data, &self.index, &self.query_index]
    }

    /// Artifact name as the host knows it (file name of the stem).
    pub fn name(&self) -> String {
        self.stem
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.stem.display().to_string())
    }
}

/// Append `.ext` without touching dots already in the stem
/// (`notes.v1` + `bank` → `notes.v1.bank`).
pub fn with_suffix(path: &Path, ext: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Chunking limits for one encode call, counted in chars (not bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            max_chars: 512,
            overlap_chars: 0,
        }
    }
}

/// A chunk of unit text ready for embedding.
///
/// `overlap` is the tail of the previous chunk of the same unit, kept
/// separately so a rebuild can recover the unit text without duplicating it.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub unit: usize,
    pub frame: usize,
    pub overlap: String,
    pub text: String,
    pub hash: String,
    pub source: Option<String>,
}

impl Chunk {
    /// Text that is embedded and returned from search.
    pub fn content(&self) -> String {
        if self.overlap.is_empty() {
            self.text.clone()
        } else {
            format!("{} {}", self.overlap, self.text)
        }
    }
}

/// Statistics reported by an encode. Opaque to the bridge apart from
/// `chunks`, which it forwards as the created/added count.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EncodeStats {
    pub chunks: usize,
    pub units: usize,
    pub total_chars: usize,
    pub bulk_data_bytes: u64,
    pub index_bytes: u64,
    pub query_index_bytes: u64,
    pub model: String,
    pub dims: usize,
    pub elapsed_ms: u64,
}

/// One ranked search hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedResult {
    pub content: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub metadata: serde_json::Value,
}
