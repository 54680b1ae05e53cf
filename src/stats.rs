//! Index statistics and health overview.
//!
//! Summarizes what the pipeline has produced: document counts by status,
//! chunk and vector totals, and embedding coverage. Used by `sdx stats`
//! and by the server's status endpoint.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::error::Result;

/// Snapshot of index contents.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub documents: i64,
    pub by_status: Vec<StatusCount>,
    pub chunks: i64,
    pub vectors: i64,
    /// Chunks with a current vector, as a percentage of all chunks.
    pub embedded_pct: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

pub async fn gather_stats(pool: &SqlitePool) -> Result<IndexStats> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors")
        .fetch_one(pool)
        .await?;
    let embedded: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM chunks c JOIN vectors v ON v.chunk_id = c.id AND v.hash = c.hash",
    )
    .fetch_one(pool)
    .await?;

    let status_rows =
        sqlx::query("SELECT status, COUNT(*) AS count FROM documents GROUP BY status ORDER BY count DESC")
            .fetch_all(pool)
            .await?;
    let by_status = status_rows
        .iter()
        .map(|row| StatusCount {
            status: row.get("status"),
            count: row.get("count"),
        })
        .collect();

    Ok(IndexStats {
        documents,
        by_status,
        chunks,
        vectors,
        embedded_pct: if chunks > 0 { embedded * 100 / chunks } else { 0 },
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    let stats = gather_stats(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Semandex — Index Stats");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents);
    for entry in &stats.by_status {
        println!("    {:<10} {}", entry.status, entry.count);
    }
    println!("  Chunks:      {}", stats.chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.vectors, stats.chunks, stats.embedded_pct
    );
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
