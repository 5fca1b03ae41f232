//! Source descriptors and their resolution into text blocks.
//!
//! An `encode` request carries a list of sources. Each one resolves to
//! zero or more [`Block`]s:
//!
//! | Kind | Payload | Blocks |
//! |------|---------|--------|
//! | `text` | literal content | one, unlabeled |
//! | `legacy_content` | inline content (older request shape) | one, unlabeled |
//! | `file` | path | one, labeled with the path |
//! | `directory` | path | one per accepted file, labeled with the relative path |
//! | `url` | URL | one, labeled with the URL |
//!
//! Anything that cannot be parsed or read is logged and skipped. Only the
//! caller decides whether the combined result is too empty to use.
//!
//! Directory walks use `walkdir` in file-name order and skip `.git`,
//! `node_modules` and `target` plus the configured `exclude_globs`.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use walkdir::WalkDir;

use crate::config::SourcesConfig;
use crate::error::{BridgeError, Result};

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/node_modules/**", "**/target/**"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Text,
    File,
    Directory,
    Url,
    LegacyContent,
}

impl SourceKind {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "text" => Some(SourceKind::Text),
            "file" => Some(SourceKind::File),
            "directory" | "dir" => Some(SourceKind::Directory),
            "url" => Some(SourceKind::Url),
            "legacy_content" | "content" => Some(SourceKind::LegacyContent),
            _ => None,
        }
    }
}

/// One parsed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    pub payload: String,
    /// Accepted extensions for `directory`, normalized to `.ext`.
    pub extensions: Option<Vec<String>>,
}

impl SourceDescriptor {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Text,
            payload: content.into(),
            extensions: None,
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::File,
            payload: path.into(),
            extensions: None,
        }
    }

    pub fn directory(path: impl Into<String>, extensions: Option<Vec<String>>) -> Self {
        Self {
            kind: SourceKind::Directory,
            payload: path.into(),
            extensions: extensions.map(|e| e.iter().map(|x| normalize_extension(x)).collect()),
        }
    }

    /// Short description for log lines.
    pub fn label(&self) -> String {
        match self.kind {
            SourceKind::Text | SourceKind::LegacyContent => {
                format!("{:?} ({} chars)", self.kind, self.payload.chars().count())
            }
            _ => format!("{:?} {}", self.kind, self.payload),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Text(String),
    Object(RawSource),
}

#[derive(Deserialize)]
struct RawSource {
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default, alias = "path")]
    payload: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    options: Option<RawOptions>,
}

#[derive(Deserialize)]
struct RawOptions {
    #[serde(default, alias = "extensions")]
    file_types: Option<Vec<String>>,
}

impl RawSource {
    fn into_descriptor(self) -> std::result::Result<SourceDescriptor, String> {
        let Some(kind_name) = self.kind else {
            // Older hosts sent bare `{content}` objects.
            return match self.content {
                Some(content) => Ok(SourceDescriptor {
                    kind: SourceKind::LegacyContent,
                    payload: content,
                    extensions: None,
                }),
                None => Err("source has neither 'kind' nor 'content'".to_string()),
            };
        };

        let kind = SourceKind::parse(&kind_name)
            .ok_or_else(|| format!("unknown source kind '{}'", kind_name))?;
        let payload = match kind {
            SourceKind::Text | SourceKind::LegacyContent => self.content.or(self.payload),
            SourceKind::Url => self.url.or(self.payload),
            SourceKind::File | SourceKind::Directory => self.payload,
        }
        .ok_or_else(|| format!("{} source has no payload", kind_name))?;

        let extensions = self
            .options
            .and_then(|o| o.file_types)
            .map(|exts| exts.iter().map(|e| normalize_extension(e)).collect());

        Ok(SourceDescriptor {
            kind,
            payload,
            extensions,
        })
    }
}

/// Parse a request's `sources` array. Elements that do not describe a
/// usable source are logged and dropped.
pub fn parse_sources(values: &[serde_json::Value]) -> Vec<SourceDescriptor> {
    values
        .iter()
        .enumerate()
        .filter_map(|(i, value)| {
            let parsed = serde_json::from_value::<RawEntry>(value.clone())
                .map_err(|e| e.to_string())
                .and_then(|entry| match entry {
                    RawEntry::Text(text) => Ok(SourceDescriptor::text(text)),
                    RawEntry::Object(raw) => raw.into_descriptor(),
                });
            match parsed {
                Ok(desc) => Some(desc),
                Err(reason) => {
                    tracing::warn!(index = i, "Skipping source: {}", reason);
                    None
                }
            }
        })
        .collect()
}

/// `MD`, `md` and `.md` all become `.md`.
pub fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

/// A piece of resolved text, optionally labeled with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub label: Option<String>,
    pub text: String,
}

impl Block {
    fn render(&self) -> String {
        match &self.label {
            Some(label) => format!("=== {} ===\n{}", label, self.text),
            None => self.text.clone(),
        }
    }
}

/// Resolves descriptors using the `[sources]` settings.
pub struct SourceResolver<'a> {
    config: &'a SourcesConfig,
    excludes: GlobSet,
}

impl<'a> SourceResolver<'a> {
    pub fn new(config: &'a SourcesConfig) -> Result<Self> {
        let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        patterns.extend(config.exclude_globs.iter().cloned());
        let excludes = build_globset(&patterns)
            .map_err(|e| BridgeError::Internal(format!("invalid exclude glob: {}", e)))?;
        Ok(Self { config, excludes })
    }

    /// Resolve every source and join the blocks, separated by blank lines.
    ///
    /// Whitespace-only blocks are dropped so a label never stands in for
    /// missing content.
    pub fn accumulate(&self, sources: &[SourceDescriptor]) -> String {
        let mut parts = Vec::new();
        for source in sources {
            match self.resolve(source) {
                Ok(blocks) => {
                    tracing::debug!(source = %source.label(), blocks = blocks.len(), "Resolved source");
                    parts.extend(
                        blocks
                            .iter()
                            .filter(|b| !b.text.trim().is_empty())
                            .map(Block::render),
                    );
                }
                Err(e) => tracing::warn!(source = %source.label(), "Skipping source: {}", e),
            }
        }
        parts.join("\n\n")
    }

    pub fn resolve(&self, source: &SourceDescriptor) -> Result<Vec<Block>> {
        match source.kind {
            SourceKind::Text | SourceKind::LegacyContent => Ok(vec![Block {
                label: None,
                text: source.payload.clone(),
            }]),
            SourceKind::File => {
                let path = Path::new(&source.payload);
                let text = self.read_file(path)?;
                Ok(vec![Block {
                    label: Some(source.payload.clone()),
                    text,
                }])
            }
            SourceKind::Directory => self.walk_directory(
                Path::new(&source.payload),
                source.extensions.as_deref(),
            ),
            SourceKind::Url => {
                let text = self.fetch_url(&source.payload)?;
                Ok(vec![Block {
                    label: Some(source.payload.clone()),
                    text,
                }])
            }
        }
    }

    fn read_file(&self, path: &Path) -> Result<String> {
        let label = path.display().to_string();
        let metadata =
            std::fs::metadata(path).map_err(|e| BridgeError::source_unreadable(&label, e))?;
        if !metadata.is_file() {
            return Err(BridgeError::source_unreadable(&label, "not a regular file"));
        }
        if metadata.len() > self.config.max_file_bytes {
            return Err(BridgeError::source_unreadable(
                &label,
                format!(
                    "{} bytes exceeds max_file_bytes ({})",
                    metadata.len(),
                    self.config.max_file_bytes
                ),
            ));
        }
        let bytes = std::fs::read(path).map_err(|e| BridgeError::source_unreadable(&label, e))?;
        String::from_utf8(bytes).map_err(|_| BridgeError::source_unreadable(&label, "not valid UTF-8"))
    }

    fn walk_directory(&self, root: &Path, extensions: Option<&[String]>) -> Result<Vec<Block>> {
        if !root.is_dir() {
            return Err(BridgeError::source_unreadable(
                root.display().to_string(),
                "directory does not exist",
            ));
        }

        let defaults: Vec<String>;
        let accepted = match extensions {
            Some(exts) => exts,
            None => {
                defaults = self
                    .config
                    .default_extensions
                    .iter()
                    .map(|e| normalize_extension(e))
                    .collect();
                &defaults
            }
        };

        let mut blocks = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(root = %root.display(), "Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.excludes.is_match(&rel_str) {
                continue;
            }
            if !has_accepted_extension(path, accepted) {
                continue;
            }

            match self.read_file(path) {
                Ok(text) => blocks.push(Block {
                    label: Some(rel_str),
                    text,
                }),
                Err(e) => tracing::warn!("Skipping file: {}", e),
            }
        }
        Ok(blocks)
    }

    fn fetch_url(&self, url: &str) -> Result<String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.config.url_timeout_secs))
            .build()
            .map_err(|e| BridgeError::source_unreadable(url, e))?;
        let response = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| BridgeError::source_unreadable(url, e))?;
        response
            .text()
            .map_err(|e| BridgeError::source_unreadable(url, e))
    }
}

fn has_accepted_extension(path: &Path, accepted: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| accepted.contains(&normalize_extension(e)))
        .unwrap_or(false)
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn config() -> SourcesConfig {
        SourcesConfig::default()
    }

    #[test]
    fn test_parse_all_shapes() {
        let parsed = parse_sources(&[
            json!("bare string"),
            json!({"content": "legacy object"}),
            json!({"kind": "text", "payload": "typed text"}),
            json!({"type": "file", "path": "/tmp/a.md"}),
            json!({"kind": "directory", "payload": "/tmp/docs", "options": {"file_types": ["MD", ".rs"]}}),
            json!({"kind": "url", "url": "https://example.com"}),
        ]);
        assert_eq!(parsed.len(), 6);
        assert_eq!(parsed[0], SourceDescriptor::text("bare string"));
        assert_eq!(parsed[1].kind, SourceKind::LegacyContent);
        assert_eq!(parsed[3].kind, SourceKind::File);
        assert_eq!(
            parsed[4].extensions,
            Some(vec![".md".to_string(), ".rs".to_string()])
        );
        assert_eq!(parsed[5].payload, "https://example.com");
    }

    #[test]
    fn test_parse_skips_unusable_entries() {
        let parsed = parse_sources(&[
            json!(42),
            json!({"kind": "carrier_pigeon", "payload": "x"}),
            json!({"kind": "file"}),
            json!({"foo": "bar"}),
            json!("kept"),
        ]);
        assert_eq!(parsed, vec![SourceDescriptor::text("kept")]);
    }

    #[test]
    fn test_normalize_extension() {
        assert_eq!(normalize_extension("MD"), ".md");
        assert_eq!(normalize_extension(".Txt"), ".txt");
    }

    #[test]
    fn test_missing_file_skipped_valid_text_kept() {
        let cfg = config();
        let resolver = SourceResolver::new(&cfg).unwrap();
        let text = resolver.accumulate(&[
            SourceDescriptor::file("/definitely/not/here.md"),
            SourceDescriptor::text("only this"),
        ]);
        assert_eq!(text, "only this");
    }

    #[test]
    fn test_file_source_gets_section_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("note.md");
        fs::write(&path, "file body").unwrap();
        let cfg = config();
        let resolver = SourceResolver::new(&cfg).unwrap();
        let label = path.to_string_lossy().to_string();
        let text = resolver.accumulate(&[
            SourceDescriptor::text("intro"),
            SourceDescriptor::file(label.clone()),
        ]);
        assert_eq!(text, format!("intro\n\n=== {} ===\nfile body", label));
    }

    #[test]
    fn test_directory_filters_extensions_and_excludes() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("b.md"), "bee").unwrap();
        fs::write(root.join("a.txt"), "ay").unwrap();
        fs::write(root.join("image.png"), "not text").unwrap();
        fs::write(root.join("sub/c.PY"), "sea").unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), "ignored").unwrap();

        let cfg = config();
        let resolver = SourceResolver::new(&cfg).unwrap();
        let blocks = resolver
            .resolve(&SourceDescriptor::directory(root.to_string_lossy(), None))
            .unwrap();
        let labels: Vec<_> = blocks.iter().filter_map(|b| b.label.clone()).collect();
        assert_eq!(labels, vec!["a.txt", "b.md", "sub/c.PY"]);
    }

    #[test]
    fn test_directory_custom_filter() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.md"), "markdown").unwrap();
        fs::write(tmp.path().join("b.rs"), "fn main() {}").unwrap();

        let cfg = config();
        let resolver = SourceResolver::new(&cfg).unwrap();
        let blocks = resolver
            .resolve(&SourceDescriptor::directory(
                tmp.path().to_string_lossy(),
                Some(vec!["rs".to_string()]),
            ))
            .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "fn main() {}");
    }

    #[test]
    fn test_directory_without_matches_accumulates_nothing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("photo.jpg"), "jpeg").unwrap();
        let cfg = config();
        let resolver = SourceResolver::new(&cfg).unwrap();
        let text =
            resolver.accumulate(&[SourceDescriptor::directory(tmp.path().to_string_lossy(), None)]);
        assert!(text.trim().is_empty());
    }

    #[test]
    fn test_empty_file_does_not_leave_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.md");
        fs::write(&path, "   \n").unwrap();
        let cfg = config();
        let resolver = SourceResolver::new(&cfg).unwrap();
        let text = resolver.accumulate(&[SourceDescriptor::file(path.to_string_lossy())]);
        assert!(text.is_empty());
    }

    #[test]
    fn test_oversized_and_binary_files_skipped() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("big.txt"), "x".repeat(64)).unwrap();
        fs::write(tmp.path().join("bin.txt"), [0xff, 0xfe, 0x00]).unwrap();
        fs::write(tmp.path().join("ok.txt"), "fine").unwrap();
        let cfg = SourcesConfig {
            max_file_bytes: 16,
            ..SourcesConfig::default()
        };
        let resolver = SourceResolver::new(&cfg).unwrap();
        let blocks = resolver
            .resolve(&SourceDescriptor::directory(tmp.path().to_string_lossy(), None))
            .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].label.as_deref(), Some("ok.txt"));
    }

    #[test]
    fn test_unreachable_url_is_skipped() {
        let cfg = SourcesConfig {
            url_timeout_secs: 2,
            ..SourcesConfig::default()
        };
        let resolver = SourceResolver::new(&cfg).unwrap();
        let text = resolver.accumulate(&[
            SourceDescriptor {
                kind: SourceKind::Url,
                payload: "http://127.0.0.1:9/nothing".to_string(),
                extensions: None,
            },
            SourceDescriptor::text("kept"),
        ]);
        assert_eq!(text, "kept");
    }
}
