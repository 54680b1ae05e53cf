//! Vector storage and filtered nearest-neighbor search.
//!
//! [`VectorIndex`] is the backend seam: the default [`SqliteVectorIndex`]
//! keeps embeddings as fixed-width f32 BLOBs in SQLite and scores them
//! with cosine similarity in process. Alternative backends (approximate
//! engines, external vector databases) implement the same trait without
//! touching callers.
//!
//! Search bounds its cost two ways: metadata filters are applied in SQL
//! *before* any scoring, and at most `scan_limit` candidates are scanned,
//! in stable chunk-id order. The true `total_scanned` is always reported
//! so callers can detect truncation and narrow their filters.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::Result;
use crate::models::SearchFilters;

/// A stored embedding with its provenance.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub provider: String,
    pub model: String,
    pub dims: usize,
    /// Hash of the chunk text this vector was computed from.
    pub hash: String,
    pub embedding: Vec<f32>,
}

/// One scored candidate from a similarity search.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f64,
}

/// Ranked hits plus scan accounting.
#[derive(Debug, Clone)]
pub struct SearchHits {
    pub hits: Vec<SearchHit>,
    /// Candidates actually scanned. Equal to the scan limit when the
    /// candidate set was truncated.
    pub total_scanned: i64,
}

/// Storage and similarity-search capability over embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn store(&self, record: &VectorRecord) -> Result<()>;
    async fn delete(&self, chunk_id: &str) -> Result<()>;
    async fn delete_for_document(&self, document_id: &str) -> Result<()>;
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<SearchHits>;
    async fn count(&self, filters: &SearchFilters) -> Result<i64>;
}

/// Default self-contained index over the `vectors` table.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
    scan_limit: usize,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool, scan_limit: usize) -> Self {
        Self { pool, scan_limit }
    }

    /// Build the WHERE clause for the given filters. Returns the SQL
    /// fragment and the values to bind, in order.
    fn filter_sql(filters: &SearchFilters) -> (String, Vec<FilterBind>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<FilterBind> = Vec::new();

        if let Some(ref content_type) = filters.content_type {
            clauses.push("d.content_type = ?".into());
            binds.push(FilterBind::Text(content_type.clone()));
        }
        if let Some(ref ids) = filters.ids {
            if ids.is_empty() {
                // An explicit empty allow-list matches nothing.
                clauses.push("1 = 0".into());
            } else {
                let placeholders = vec!["?"; ids.len()].join(", ");
                clauses.push(format!("d.content_id IN ({})", placeholders));
                binds.extend(ids.iter().cloned().map(FilterBind::Text));
            }
        }
        if let Some(ref exclude_ids) = filters.exclude_ids {
            if !exclude_ids.is_empty() {
                let placeholders = vec!["?"; exclude_ids.len()].join(", ");
                clauses.push(format!("d.content_id NOT IN ({})", placeholders));
                binds.extend(exclude_ids.iter().cloned().map(FilterBind::Text));
            }
        }
        if let Some(after) = filters.date_after {
            clauses.push("d.updated_at >= ?".into());
            binds.push(FilterBind::Int(after));
        }
        if let Some(before) = filters.date_before {
            clauses.push("d.updated_at <= ?".into());
            binds.push(FilterBind::Int(before));
        }

        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        (sql, binds)
    }
}

enum FilterBind {
    Text(String),
    Int(i64),
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [FilterBind],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            FilterBind::Text(s) => query.bind(s.as_str()),
            FilterBind::Int(i) => query.bind(*i),
        };
    }
    query
}

fn bind_all_scalar<'q, O>(
    mut query: sqlx::query::QueryScalar<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [FilterBind],
) -> sqlx::query::QueryScalar<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            FilterBind::Text(s) => query.bind(s.as_str()),
            FilterBind::Int(i) => query.bind(*i),
        };
    }
    query
}

/// Scores are reported at fixed precision so results are stable across
/// float noise.
fn round_score(score: f64) -> f64 {
    (score * 10_000.0).round() / 10_000.0
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn store(&self, record: &VectorRecord) -> Result<()> {
        let blob = vec_to_blob(&record.embedding);
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO vectors (chunk_id, document_id, provider, model, dims, hash, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                document_id = excluded.document_id,
                provider = excluded.provider,
                model = excluded.model,
                dims = excluded.dims,
                hash = excluded.hash,
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
        )
        .bind(&record.chunk_id)
        .bind(&record.document_id)
        .bind(&record.provider)
        .bind(&record.model)
        .bind(record.dims as i64)
        .bind(&record.hash)
        .bind(&blob)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_for_document(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<SearchHits> {
        let (where_sql, binds) = Self::filter_sql(filters);
        let sql = format!(
            r#"
            SELECT v.chunk_id, v.document_id, v.embedding
            FROM vectors v
            JOIN documents d ON d.id = v.document_id
            {}
            ORDER BY v.chunk_id
            LIMIT ?
            "#,
            where_sql
        );

        let rows = bind_all(sqlx::query(&sql), &binds)
            .bind(self.scan_limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let total_scanned = rows.len() as i64;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                SearchHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    score: round_score(cosine_similarity(query, &vector) as f64),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(top_k);

        Ok(SearchHits {
            hits,
            total_scanned,
        })
    }

    async fn count(&self, filters: &SearchFilters) -> Result<i64> {
        let (where_sql, binds) = Self::filter_sql(filters);
        let sql = format!(
            r#"
            SELECT COUNT(*)
            FROM vectors v
            JOIN documents d ON d.id = v.document_id
            {}
            "#,
            where_sql
        );

        let count: i64 = bind_all_scalar(sqlx::query_scalar(&sql), &binds)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
