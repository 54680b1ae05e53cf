//! Query-time retrieval over the vector index.
//!
//! The service validates the request, embeds the query text, delegates
//! candidate scoring to the [`VectorIndex`], then hydrates the ranked
//! hits with chunk and document metadata in one batched query.

use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Instant;

use crate::config::RetrievalConfig;
use crate::embedding::{blob_to_vec, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::index::{SearchHit, VectorIndex};
use crate::models::{SearchFilters, SearchResponse, SearchResultItem};

pub struct RetrievalService {
    pool: SqlitePool,
    provider: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
}

impl RetrievalService {
    pub fn new(
        pool: SqlitePool,
        provider: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            pool,
            provider,
            index,
            config,
        }
    }

    /// Semantic search: embed the query and return the top-k hydrated
    /// hits passing the metadata filters.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        filters: &SearchFilters,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::Validation("query must not be empty".into()));
        }
        if query.chars().count() > self.config.max_query_chars {
            return Err(Error::Validation(format!(
                "query exceeds {} characters",
                self.config.max_query_chars
            )));
        }
        let top_k = self.resolve_top_k(top_k)?;

        let query_vector = self.provider.embed_single(query).await?;
        let hits = self.index.search(&query_vector, top_k, filters).await?;

        let results = self.hydrate(&hits.hits).await?;
        Ok(SearchResponse {
            results,
            total_scanned: hits.total_scanned,
            query_time_ms: started.elapsed().as_millis() as i64,
        })
    }

    /// More-like-this: search with a stored vector of `content_id` as the
    /// query, excluding the source document itself. `None` when the
    /// content id is unknown or has no vectors yet.
    pub async fn find_similar(
        &self,
        content_id: &str,
        top_k: Option<usize>,
        filters: &SearchFilters,
    ) -> Result<Option<SearchResponse>> {
        let started = Instant::now();
        let top_k = self.resolve_top_k(top_k)?;

        // The document's first chunk usually carries its lead content,
        // which makes the best single-vector proxy for the whole item.
        let row = sqlx::query(
            r#"
            SELECT v.embedding
            FROM vectors v
            JOIN chunks c ON c.id = v.chunk_id
            JOIN documents d ON d.id = v.document_id
            WHERE d.content_id = ?
            ORDER BY c.chunk_index
            LIMIT 1
            "#,
        )
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let blob: Vec<u8> = row.get("embedding");
        let query_vector = blob_to_vec(&blob);

        let mut filters = filters.clone();
        filters
            .exclude_ids
            .get_or_insert_with(Vec::new)
            .push(content_id.to_string());

        let hits = self.index.search(&query_vector, top_k, &filters).await?;
        let results = self.hydrate(&hits.hits).await?;
        Ok(Some(SearchResponse {
            results,
            total_scanned: hits.total_scanned,
            query_time_ms: started.elapsed().as_millis() as i64,
        }))
    }

    fn resolve_top_k(&self, requested: Option<usize>) -> Result<usize> {
        match requested {
            None => Ok(self.config.default_top_k),
            Some(0) => Err(Error::Validation("top_k must be at least 1".into())),
            Some(k) if k > self.config.max_top_k => Err(Error::Validation(format!(
                "top_k exceeds maximum of {}",
                self.config.max_top_k
            ))),
            Some(k) => Ok(k),
        }
    }

    /// Attach chunk text and document metadata to ranked hits with a
    /// single batched query. Hits whose chunk vanished mid-flight (a
    /// concurrent reindex) are dropped, not errored.
    async fn hydrate(&self, hits: &[SearchHit]) -> Result<Vec<SearchResultItem>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; hits.len()].join(", ");
        let sql = format!(
            r#"
            SELECT c.id, c.anchor, c.heading_path, c.text, c.token_estimate,
                   d.id AS doc_id, d.content_id, d.title, d.url
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.id IN ({})
            "#,
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for hit in hits {
            query = query.bind(&hit.chunk_id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut by_chunk = std::collections::HashMap::with_capacity(rows.len());
        for row in &rows {
            by_chunk.insert(row.get::<String, _>("id"), row);
        }

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(row) = by_chunk.get(&hit.chunk_id) else {
                tracing::warn!(chunk_id = %hit.chunk_id, "hit chunk vanished during hydration");
                continue;
            };
            let heading_raw: String = row.get("heading_path");
            let heading_path = serde_json::from_str(&heading_raw).unwrap_or_default();
            results.push(SearchResultItem {
                chunk_id: hit.chunk_id.clone(),
                doc_id: row.get("doc_id"),
                content_id: row.get("content_id"),
                title: row.get("title"),
                url: row.get("url"),
                anchor: row.get("anchor"),
                heading_path,
                text: row.get("text"),
                score: hit.score,
                token_estimate: row.get("token_estimate"),
            });
        }

        // The index already ranks; re-sort to keep ordering authoritative
        // even if a backend misbehaves.
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(results)
    }
}
