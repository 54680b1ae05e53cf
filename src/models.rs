//! Core data models used throughout Semandex.
//!
//! These types represent the documents, chunks, and vectors that flow
//! through the ingestion pipeline, plus the payloads served at query time.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a document in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    /// Built from the content source, not yet chunked.
    Pending,
    /// Chunks exist; vectors may still be missing.
    Chunked,
    /// Every chunk has a vector; searchable.
    Indexed,
    /// Requires manual investigation (zero chunks, stuck embeds).
    Error,
    /// Empty or otherwise not indexable content.
    Excluded,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Pending => "pending",
            DocStatus::Chunked => "chunked",
            DocStatus::Indexed => "indexed",
            DocStatus::Error => "error",
            DocStatus::Excluded => "excluded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocStatus::Pending),
            "chunked" => Some(DocStatus::Chunked),
            "indexed" => Some(DocStatus::Indexed),
            "error" => Some(DocStatus::Error),
            "excluded" => Some(DocStatus::Excluded),
            _ => None,
        }
    }
}

/// One indexed content item. Created by the document build phase; status
/// advanced by later phases.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub content_id: String,
    pub content_type: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub content_hash: String,
    pub status: DocStatus,
    pub chunk_count: i64,
    pub last_error: Option<String>,
    pub indexed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A token-bounded slice of a document's text; the atomic unit of
/// embedding and retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    /// Stable per-chunk citation identifier, unique within the document.
    pub anchor: String,
    /// Headings active at the chunk's start offset, outermost first.
    pub heading_path: Vec<String>,
    pub text: String,
    pub hash: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub token_estimate: i64,
}

/// Heading extracted from a document, with its byte offset in the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub level: u8,
    pub text: String,
    pub offset: usize,
}

/// A ranked hit returned from the retrieval service.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub chunk_id: String,
    pub doc_id: String,
    pub content_id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub anchor: String,
    pub heading_path: Vec<String>,
    pub text: String,
    pub score: f64,
    pub token_estimate: i64,
}

/// Full search response, including scan accounting so callers can detect
/// scan-ceiling truncation.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultItem>,
    pub total_scanned: i64,
    pub query_time_ms: i64,
}

/// Metadata filters applied before similarity scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default, rename = "type")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub ids: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_ids: Option<Vec<String>>,
    /// Inclusive lower bound on document updated_at, Unix seconds.
    #[serde(default)]
    pub date_after: Option<i64>,
    /// Inclusive upper bound on document updated_at, Unix seconds.
    #[serde(default)]
    pub date_before: Option<i64>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.content_type.is_none()
            && self.ids.is_none()
            && self.exclude_ids.is_none()
            && self.date_after.is_none()
            && self.date_before.is_none()
    }
}
