#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use semandex::config::{ChunkingConfig, ContentConfig, PipelineConfig};
use semandex::content::FsContentSource;
use semandex::db;
use semandex::embedding::{EmbeddingBatch, EmbeddingProvider};
use semandex::error::Result;
use semandex::index::{SqliteVectorIndex, VectorIndex};
use semandex::migrate;
use semandex::pipeline::Orchestrator;

pub const DIMS: usize = 32;

/// Deterministic word-bucket embedder: each word increments one of 32
/// buckets, so texts sharing vocabulary get similar vectors. Records
/// every embedded text so tests can assert exactly-once embedding.
pub struct HashProvider {
    pub embedded: Mutex<Vec<String>>,
}

impl HashProvider {
    pub fn new() -> Self {
        Self {
            embedded: Mutex::new(Vec::new()),
        }
    }

    pub fn embedded_count(&self) -> usize {
        self.embedded.lock().unwrap().len()
    }
}

fn bucket(word: &str) -> usize {
    word.bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
        % DIMS
}

pub fn embed_text(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIMS];
    for word in text.split_whitespace() {
        vector[bucket(&word.to_lowercase())] += 1.0;
    }
    vector
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn provider_name(&self) -> &str {
        "stub"
    }
    fn model_name(&self) -> &str {
        "hash-v0"
    }
    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        let mut log = self.embedded.lock().unwrap();
        let vectors = texts
            .iter()
            .map(|text| {
                log.push(text.clone());
                embed_text(text)
            })
            .collect();
        Ok(EmbeddingBatch {
            vectors,
            dims: DIMS,
            total_tokens: None,
        })
    }
}

/// A content directory, database, and orchestrator wired together over a
/// shared pool and recording stub provider.
pub struct Harness {
    pub tmp: TempDir,
    pub pool: SqlitePool,
    pub provider: Arc<HashProvider>,
    pub index: Arc<SqliteVectorIndex>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn write(&self, name: &str, text: &str) {
        std::fs::write(self.tmp.path().join("content").join(name), text).unwrap();
    }
}

/// Batch size stays fixed: thresholds are set so the adaptive sizing
/// never triggers.
pub fn steady_pipeline_config(batch: usize) -> PipelineConfig {
    PipelineConfig {
        batch_floor: 1,
        batch_ceiling: 1000,
        initial_batch: batch,
        slow_threshold_ms: 1_000_000,
        fast_threshold_ms: 0,
        pending_timeout_secs: 86_400,
    }
}

/// Small bounds so short test documents produce one chunk per section.
pub fn small_chunking_config() -> ChunkingConfig {
    ChunkingConfig {
        target_tokens: 30,
        overlap_tokens: 5,
        min_tokens: 5,
        max_tokens: 40,
    }
}

pub async fn harness(chunking: ChunkingConfig, pipeline: PipelineConfig) -> Harness {
    harness_with_index(chunking, pipeline, |index| index).await
}

/// Like [`harness`] but lets the test wrap the vector index handed to the
/// orchestrator, e.g. with a fault-injecting decorator.
pub async fn harness_with_index<F>(
    chunking: ChunkingConfig,
    pipeline: PipelineConfig,
    wrap: F,
) -> Harness
where
    F: FnOnce(Arc<SqliteVectorIndex>) -> Arc<dyn VectorIndex>,
{
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("content")).unwrap();

    let pool = db::connect_memory().await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let source = Arc::new(
        FsContentSource::new(&ContentConfig {
            root: Some(tmp.path().join("content")),
            include_globs: vec!["**/*.md".into(), "**/*.txt".into()],
            exclude_globs: vec![],
        })
        .unwrap(),
    );
    let provider = Arc::new(HashProvider::new());
    let index = Arc::new(SqliteVectorIndex::new(pool.clone(), 10_000));

    let orchestrator = Orchestrator::new(
        pool.clone(),
        source,
        provider.clone(),
        wrap(index.clone()),
        chunking,
        pipeline,
    );

    Harness {
        tmp,
        pool,
        provider,
        index,
        orchestrator,
    }
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn doc_status(pool: &SqlitePool, content_id: &str) -> Option<String> {
    sqlx::query_scalar("SELECT status FROM documents WHERE content_id = ?")
        .bind(content_id)
        .fetch_optional(pool)
        .await
        .unwrap()
}
