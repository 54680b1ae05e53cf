//! Content source abstraction.
//!
//! The host content store is an external collaborator: anything that can
//! produce plain text with heading offsets and a deterministic content
//! hash satisfies [`ContentSource`]. The built-in [`FsContentSource`]
//! reads Markdown and plain-text files from a directory tree, which is
//! enough to drive the pipeline end to end and in tests.

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ContentConfig;
use crate::error::{Error, Result};
use crate::models::Heading;

/// Scope of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunScope {
    /// Every item the source knows about.
    All,
    /// Items of one content type.
    ContentType { content_type: String },
    /// A single item.
    Item { content_id: String },
}

impl Default for RunScope {
    fn default() -> Self {
        RunScope::All
    }
}

/// One content item as delivered by the source. `content_hash` must be
/// deterministic: unchanged content always yields the same hash.
#[derive(Debug, Clone)]
pub struct ContentItem {
    pub content_id: String,
    pub content_type: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub text: String,
    pub headings: Vec<Heading>,
    pub content_hash: String,
    pub updated_at: i64,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Content ids in scope, in stable order.
    async fn list(&self, scope: &RunScope) -> Result<Vec<String>>;

    /// Fetch one item. `None` when the id is unknown (e.g. removed).
    async fn fetch(&self, content_id: &str) -> Result<Option<ContentItem>>;
}

/// Filesystem-backed content source over Markdown and text files.
pub struct FsContentSource {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl FsContentSource {
    pub fn new(config: &ContentConfig) -> Result<Self> {
        let root = config
            .root
            .clone()
            .ok_or_else(|| Error::Validation("content.root not configured".into()))?;
        if !root.exists() {
            return Err(Error::Validation(format!(
                "content root does not exist: {}",
                root.display()
            )));
        }

        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            root,
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    fn content_type_for(path: &Path) -> &'static str {
        match path.extension().and_then(|e| e.to_str()) {
            Some("md") => "markdown",
            _ => "text",
        }
    }

    fn read_item(&self, content_id: &str) -> Result<Option<ContentItem>> {
        let path = self.root.join(content_id);
        if !path.is_file() {
            return Ok(None);
        }

        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Validation(format!("unreadable file {}: {}", content_id, e)))?;

        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let content_hash = format!("{:x}", hasher.finalize());

        let updated_at = std::fs::metadata(&path)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let headings = parse_markdown_headings(&text);
        let title = headings
            .first()
            .filter(|h| h.level == 1)
            .map(|h| h.text.clone())
            .or_else(|| {
                path.file_stem()
                    .map(|n| n.to_string_lossy().to_string())
            });

        Ok(Some(ContentItem {
            content_id: content_id.to_string(),
            content_type: Self::content_type_for(&path).to_string(),
            title,
            url: Some(format!("file://{}", path.display())),
            text,
            headings,
            content_hash,
            updated_at,
        }))
    }
}

#[async_trait]
impl ContentSource for FsContentSource {
    async fn list(&self, scope: &RunScope) -> Result<Vec<String>> {
        if let RunScope::Item { content_id } = scope {
            return Ok(vec![content_id.clone()]);
        }

        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry =
                entry.map_err(|e| Error::Validation(format!("content walk failed: {}", e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }
            if let RunScope::ContentType { content_type } = scope {
                if Self::content_type_for(path) != content_type {
                    continue;
                }
            }
            ids.push(rel_str);
        }

        // Stable order keeps runs reproducible.
        ids.sort();
        Ok(ids)
    }

    async fn fetch(&self, content_id: &str) -> Result<Option<ContentItem>> {
        self.read_item(content_id)
    }
}

/// Extract ATX headings (`#`..`######`) with their byte offsets.
pub fn parse_markdown_headings(text: &str) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut offset = 0usize;
    let mut in_fence = false;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed.trim_start().starts_with("```") {
            in_fence = !in_fence;
        } else if !in_fence && trimmed.starts_with('#') {
            let level = trimmed.chars().take_while(|&c| c == '#').count();
            if level <= 6 {
                let rest = trimmed[level..].trim();
                if !rest.is_empty() {
                    headings.push(Heading {
                        level: level as u8,
                        text: rest.to_string(),
                        offset,
                    });
                }
            }
        }
        offset += line.len();
    }
    headings
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Validation(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Validation(format!("bad glob set: {}", e)))
}
