//! File-backed reference engine.
//!
//! Artifact layout for stem `S`:
//!
//! | File | Contents |
//! |------|----------|
//! | `S.bank` | One JSON frame per line: `{"frame", "id", "content"}` |
//! | `S.json` | [`IndexManifest`]: model, dims, unit texts, and every chunk's unit, body, hash, source |
//! | `S.idx`  | `MBQX` magic, version, dims, count, then `count × dims` LE f32 |
//!
//! [`LocalEngine::open`] loads all three and cross-checks them; a retriever
//! never serves an artifact whose files disagree. When the query index is
//! missing or was built by a different model, search falls back to keyword
//! overlap.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use super::{Encoder, QueryEngine, Retriever};
use crate::chunk::{chunk_units, reassemble_unit};
use crate::embedding::{blob_to_vec, cosine_similarity, tokens, vec_to_blob, Embedder};
use crate::models::{ArtifactFiles, Chunk, EncodeOptions, EncodeStats, RankedResult};

const INDEX_FORMAT: &str = "membank-index";
const INDEX_VERSION: u32 = 1;
const QUERY_INDEX_MAGIC: &[u8; 4] = b"MBQX";
const QUERY_INDEX_VERSION: u32 = 1;
const QUERY_INDEX_HEADER: usize = 16;

/// Primary index file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format: String,
    pub version: u32,
    pub created_at: String,
    pub model: String,
    pub dims: usize,
    /// Unit texts exactly as encoded, so an append can rebuild from them.
    #[serde(default)]
    pub units: Vec<String>,
    pub chunks: Vec<IndexedChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub id: String,
    pub frame: usize,
    pub unit: usize,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BulkFrame {
    frame: usize,
    id: String,
    content: String,
}

/// Encoder and query engine over plain files, parameterized by an embedder.
pub struct LocalEngine {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl LocalEngine {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            batch_size: 64,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        let contents: Vec<String> = chunks.iter().map(Chunk::content).collect();
        let mut vectors = Vec::with_capacity(contents.len());
        for batch in contents.chunks(self.batch_size) {
            let embedded = self.embedder.embed(batch)?;
            if embedded.len() != batch.len() {
                bail!(
                    "embedder returned {} vectors for {} texts",
                    embedded.len(),
                    batch.len()
                );
            }
            vectors.extend(embedded);
        }
        let dims = self.embedder.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            bail!("embedder returned a {}-dim vector, expected {}", bad.len(), dims);
        }
        Ok(vectors)
    }
}

/// Read and parse an index manifest.
pub fn read_manifest(index_file: &Path) -> Result<IndexManifest> {
    let raw = fs::read_to_string(index_file)
        .with_context(|| format!("Failed to read index file: {}", index_file.display()))?;
    let manifest: IndexManifest = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse index file: {}", index_file.display()))?;
    if manifest.format != INDEX_FORMAT {
        bail!(
            "{} is not a memory-bank index (format '{}')",
            index_file.display(),
            manifest.format
        );
    }
    if manifest.version > INDEX_VERSION {
        bail!(
            "{} has index version {}, newest supported is {}",
            index_file.display(),
            manifest.version,
            INDEX_VERSION
        );
    }
    Ok(manifest)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn write_bulk_data(path: &Path, chunks: &[Chunk]) -> Result<u64> {
    ensure_parent(path)?;
    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create bulk-data file: {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for chunk in chunks {
        let frame = BulkFrame {
            frame: chunk.frame,
            id: chunk.id.clone(),
            content: chunk.content(),
        };
        serde_json::to_writer(&mut out, &frame)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(fs::metadata(path)?.len())
}

fn read_bulk_data(path: &Path) -> Result<Vec<BulkFrame>> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open bulk-data file: {}", path.display()))?;
    let mut frames = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: BulkFrame = serde_json::from_str(&line)
            .with_context(|| format!("Corrupt frame at line {} of {}", n + 1, path.display()))?;
        frames.push(frame);
    }
    Ok(frames)
}

fn write_query_index(path: &Path, dims: usize, vectors: &[Vec<f32>]) -> Result<u64> {
    ensure_parent(path)?;
    let mut bytes = Vec::with_capacity(QUERY_INDEX_HEADER + vectors.len() * dims * 4);
    bytes.extend_from_slice(QUERY_INDEX_MAGIC);
    bytes.extend_from_slice(&QUERY_INDEX_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(dims as u32).to_le_bytes());
    bytes.extend_from_slice(&(vectors.len() as u32).to_le_bytes());
    for v in vectors {
        bytes.extend_from_slice(&vec_to_blob(v));
    }
    fs::write(path, &bytes)
        .with_context(|| format!("Failed to write query index: {}", path.display()))?;
    Ok(bytes.len() as u64)
}

fn read_query_index(path: &Path) -> Result<(usize, Vec<Vec<f32>>)> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read query index: {}", path.display()))?;
    if bytes.len() < QUERY_INDEX_HEADER || &bytes[..4] != QUERY_INDEX_MAGIC {
        bail!("{} is not a memory-bank query index", path.display());
    }
    let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let version = word(4);
    if version != QUERY_INDEX_VERSION {
        bail!("{} has unsupported query index version {}", path.display(), version);
    }
    let dims = word(8) as usize;
    let count = word(12) as usize;
    let body = &bytes[QUERY_INDEX_HEADER..];
    if dims == 0 || body.len() != count * dims * 4 {
        bail!(
            "{} is truncated: expected {} vectors of {} dims",
            path.display(),
            count,
            dims
        );
    }
    let vectors = body.chunks_exact(dims * 4).map(blob_to_vec).collect();
    Ok((dims, vectors))
}

impl Encoder for LocalEngine {
    fn encode_units(
        &self,
        units: &[String],
        opts: &EncodeOptions,
        files: &ArtifactFiles,
    ) -> Result<EncodeStats> {
        let started = Instant::now();
        let chunks = chunk_units(units, opts);
        if chunks.is_empty() {
            bail!("nothing to encode: all units are empty");
        }
        let vectors = self.embed_chunks(&chunks)?;

        let bulk_data_bytes = write_bulk_data(&files.bulk_data, &chunks)?;
        let query_index_bytes = write_query_index(&files.query_index, self.embedder.dims(), &vectors)?;

        let manifest = IndexManifest {
            format: INDEX_FORMAT.to_string(),
            version: INDEX_VERSION,
            created_at: Utc::now().to_rfc3339(),
            model: self.embedder.model_name().to_string(),
            dims: self.embedder.dims(),
            units: units
                .iter()
                .filter(|u| !u.trim().is_empty())
                .cloned()
                .collect(),
            chunks: chunks
                .iter()
                .map(|c| IndexedChunk {
                    id: c.id.clone(),
                    frame: c.frame,
                    unit: c.unit,
                    hash: c.hash.clone(),
                    source: c.source.clone(),
                    text: c.text.clone(),
                })
                .collect(),
        };
        ensure_parent(&files.index)?;
        let index_json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&files.index, &index_json)
            .with_context(|| format!("Failed to write index file: {}", files.index.display()))?;

        Ok(EncodeStats {
            chunks: chunks.len(),
            units: manifest.units.len(),
            total_chars: units.iter().map(|u| u.chars().count()).sum(),
            bulk_data_bytes,
            index_bytes: index_json.len() as u64,
            query_index_bytes,
            model: manifest.model,
            dims: manifest.dims,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn read_units(&self, index_file: &Path) -> Result<Vec<String>> {
        let manifest = read_manifest(index_file)?;
        if !manifest.units.is_empty() {
            return Ok(manifest.units);
        }
        // Older manifests carry only chunk bodies.
        let mut by_unit: BTreeMap<usize, Vec<&IndexedChunk>> = BTreeMap::new();
        for chunk in &manifest.chunks {
            by_unit.entry(chunk.unit).or_default().push(chunk);
        }
        Ok(by_unit
            .into_values()
            .map(|mut chunks| {
                chunks.sort_by_key(|c| c.frame);
                reassemble_unit(chunks.iter().map(|c| c.text.as_str()))
            })
            .collect())
    }

    fn chunk_count(&self, index_file: &Path) -> Result<usize> {
        Ok(read_manifest(index_file)?.chunks.len())
    }
}

struct StoredChunk {
    id: String,
    frame: usize,
    source: Option<String>,
    content: String,
}

/// In-memory query handle produced by [`LocalEngine::open`].
pub struct LocalRetriever {
    chunks: Vec<StoredChunk>,
    vectors: Option<Vec<Vec<f32>>>,
    embedder: Arc<dyn Embedder>,
}

impl QueryEngine for LocalEngine {
    fn open(&self, bulk_data_file: &Path, index_file: &Path) -> Result<Arc<dyn Retriever>> {
        let manifest = read_manifest(index_file)?;
        let frames = read_bulk_data(bulk_data_file)?;

        if frames.len() != manifest.chunks.len() {
            bail!(
                "{} holds {} frames but {} indexes {} chunks",
                bulk_data_file.display(),
                frames.len(),
                index_file.display(),
                manifest.chunks.len()
            );
        }

        let mut chunks = Vec::with_capacity(frames.len());
        for (frame, indexed) in frames.into_iter().zip(&manifest.chunks) {
            if frame.id != indexed.id || frame.frame != indexed.frame {
                bail!(
                    "frame {} of {} does not match its index entry",
                    frame.frame,
                    bulk_data_file.display()
                );
            }
            chunks.push(StoredChunk {
                id: frame.id,
                frame: frame.frame,
                source: indexed.source.clone(),
                content: frame.content,
            });
        }

        // The query index sits next to the other two files.
        let stem = index_file.with_extension("");
        let query_index = ArtifactFiles::from_stem(stem).query_index;
        let vectors = if query_index.exists()
            && manifest.model == self.embedder.model_name()
            && manifest.dims == self.embedder.dims()
        {
            let (dims, vectors) = read_query_index(&query_index)?;
            if dims != manifest.dims || vectors.len() != chunks.len() {
                bail!(
                    "{} does not match {}: {} vectors of {} dims for {} chunks",
                    query_index.display(),
                    index_file.display(),
                    vectors.len(),
                    dims,
                    chunks.len()
                );
            }
            Some(vectors)
        } else {
            None
        };

        Ok(Arc::new(LocalRetriever {
            chunks,
            vectors,
            embedder: Arc::clone(&self.embedder),
        }))
    }
}

impl LocalRetriever {
    fn keyword_scores(&self, query: &str) -> Vec<f64> {
        let terms: Vec<String> = tokens(query).collect();
        if terms.is_empty() {
            return vec![0.0; self.chunks.len()];
        }
        self.chunks
            .iter()
            .map(|c| {
                let text = c.content.to_lowercase();
                let hits = terms.iter().filter(|t| text.contains(t.as_str())).count();
                hits as f64 / terms.len() as f64
            })
            .collect()
    }

    /// Whether vector scoring is available (false means keyword fallback).
    pub fn has_vectors(&self) -> bool {
        self.vectors.is_some()
    }
}

impl Retriever for LocalRetriever {
    fn search(&self, query: &str, top_k: usize) -> Result<Vec<RankedResult>> {
        let scores: Vec<f64> = match &self.vectors {
            Some(vectors) => {
                let q = self
                    .embedder
                    .embed(&[query.to_string()])?
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;
                vectors
                    .iter()
                    .map(|v| cosine_similarity(&q, v) as f64)
                    .collect()
            }
            None => self.keyword_scores(query),
        };

        let mut ranked: Vec<(usize, f64)> = scores.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(top_k);

        Ok(ranked
            .into_iter()
            .map(|(i, score)| {
                let c = &self.chunks[i];
                RankedResult {
                    content: c.content.clone(),
                    score,
                    source: c.source.clone(),
                    metadata: serde_json::json!({ "frame": c.frame, "chunk_id": c.id }),
                }
            })
            .collect())
    }

    fn len(&self) -> usize {
        self.chunks.len()
    }
}
