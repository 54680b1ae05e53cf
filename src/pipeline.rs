//! Phase-ordered, resumable ingestion pipeline.
//!
//! A run drives every in-scope content item through five fixed phases:
//! document build → chunk build → embed chunks → index upsert → cleanup.
//! Work executes as discrete batch jobs on the durable [`JobQueue`]; each
//! job selects up to `batch_size` unprocessed items *by persisted status*
//! (the cursor is only a rescan optimization), processes them, updates the
//! CAS-persisted [`PipelineState`], and re-enqueues itself until the phase
//! drains. Because selection is status-based and every write is an
//! idempotent upsert, a crash or restart mid-phase resumes correctly and
//! duplicate delivery from the at-least-once queue is harmless.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chunker::chunk_document;
use crate::config::{ChunkingConfig, PipelineConfig};
use crate::content::{ContentSource, RunScope};
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::index::{VectorIndex, VectorRecord};
use crate::models::DocStatus;
use crate::queue::{Job, JobQueue};
use crate::state::StateStore;

/// State-store key holding the active run's state.
pub const STATE_KEY: &str = "pipeline";
/// Queue job name for phase batches.
pub const BATCH_JOB: &str = "pipeline.batch";

/// The fixed, ordered phase list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    DocumentBuild,
    ChunkBuild,
    EmbedChunks,
    IndexUpsert,
    Cleanup,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::DocumentBuild,
        Phase::ChunkBuild,
        Phase::EmbedChunks,
        Phase::IndexUpsert,
        Phase::Cleanup,
    ];

    pub fn next(self) -> Option<Phase> {
        let pos = Self::ALL.iter().position(|&p| p == self)?;
        Self::ALL.get(pos + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::DocumentBuild => "document_build",
            Phase::ChunkBuild => "chunk_build",
            Phase::EmbedChunks => "embed_chunks",
            Phase::IndexUpsert => "index_upsert",
            Phase::Cleanup => "cleanup",
        }
    }
}

/// Run lifecycle. `Paused` is reserved for operator-driven suspension but
/// currently unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Counter block, kept both run-wide and per phase.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl Progress {
    pub fn percentage(&self) -> f64 {
        if self.total <= 0 {
            return 100.0;
        }
        let done = (self.completed + self.failed + self.skipped) as f64;
        (done / self.total as f64 * 100.0).min(100.0)
    }
}

/// Durable state of the active run. Mutated only through CAS so
/// concurrent workers serialize through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub status: RunStatus,
    pub run_id: String,
    pub current_phase: Phase,
    pub scope: RunScope,
    pub force: bool,
    pub batch_size: usize,
    pub overall: Progress,
    pub phase: Progress,
    /// Max processed id for the current phase; an optimization only,
    /// selection remains status-based.
    pub cursor: Option<String>,
    /// Exponential moving average of per-item processing time.
    pub avg_item_ms: f64,
    pub started_at: i64,
    pub last_activity: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub scope: RunScope,
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchPayload {
    run_id: String,
    phase: Phase,
    cursor: Option<String>,
}

/// Outcome of one phase batch.
#[derive(Debug, Default)]
struct BatchReport {
    completed: i64,
    failed: i64,
    skipped: i64,
    max_id: Option<String>,
    remaining: bool,
    item_error: Option<String>,
}

pub struct Orchestrator {
    pool: SqlitePool,
    state: StateStore,
    queue: JobQueue,
    source: Arc<dyn ContentSource>,
    provider: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    chunking: ChunkingConfig,
    pipeline: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        source: Arc<dyn ContentSource>,
        provider: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        chunking: ChunkingConfig,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            state: StateStore::new(pool.clone()),
            queue: JobQueue::new(pool.clone()),
            pool,
            source,
            provider,
            index,
            chunking,
            pipeline,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Begin a run. Fails with a conflict when one is already active.
    pub async fn start(&self, options: StartOptions) -> Result<PipelineState> {
        let existing = self.state.get::<PipelineState>(STATE_KEY).await?;
        if let Some(ref versioned) = existing {
            if versioned.value.status == RunStatus::Running {
                return Err(Error::Conflict("pipeline is already running".into()));
            }
        }

        let total = self.source.list(&options.scope).await?.len() as i64;
        let now = chrono::Utc::now().timestamp();
        let run_id = uuid::Uuid::new_v4().to_string();

        let state = PipelineState {
            status: RunStatus::Running,
            run_id: run_id.clone(),
            current_phase: Phase::DocumentBuild,
            scope: options.scope,
            force: options.force,
            batch_size: self.pipeline.initial_batch,
            overall: Progress {
                total,
                ..Default::default()
            },
            phase: Progress {
                total,
                ..Default::default()
            },
            cursor: None,
            avg_item_ms: 0.0,
            started_at: now,
            last_activity: now,
            last_error: None,
        };

        self.state
            .compare_and_swap(STATE_KEY, &state, existing.map(|v| v.version))
            .await?;

        self.enqueue_batch(&run_id, Phase::DocumentBuild, None, 0)
            .await?;

        tracing::info!(run_id = %run_id, total, "pipeline run started");
        Ok(state)
    }

    /// Cooperative stop: cancel everything still queued and mark the run
    /// idle. Already-committed work stands. A no-op when nothing runs.
    pub async fn stop(&self) -> Result<bool> {
        stop_run(&self.pool).await
    }

    pub async fn status(&self) -> Result<Option<PipelineState>> {
        Ok(self
            .state
            .get::<PipelineState>(STATE_KEY)
            .await?
            .map(|v| v.value))
    }

    /// Process queued jobs until the queue drains. Recovers jobs left
    /// running by a previous crash before starting.
    pub async fn run_worker_until_idle(&self) -> Result<()> {
        self.queue.recover_stale().await?;
        loop {
            match self.queue.claim_next().await? {
                Some(job) => {
                    if let Err(err) = self.run_job(&job).await {
                        tracing::error!(job_id = job.id, error = %err, "job failed");
                    }
                    self.queue.complete(job.id).await?;
                }
                None => {
                    let state = self.status().await?;
                    let active = state.is_some_and(|s| s.status == RunStatus::Running);
                    if !active {
                        break;
                    }
                    // Jobs may be delayed (rate-limit backoff); wait for
                    // the next one to come due.
                    let run_id = self
                        .status()
                        .await?
                        .map(|s| s.run_id)
                        .unwrap_or_default();
                    if self.queue.pending_count(&run_id).await? == 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        Ok(())
    }

    /// Claim and run at most one job. Returns false when none was due.
    /// Test-friendly single-step driver.
    pub async fn step(&self) -> Result<bool> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(false);
        };
        let result = self.run_job(&job).await;
        self.queue.complete(job.id).await?;
        result.map(|_| true)
    }

    /// Execute one batch job: run the phase batch, fold the report into
    /// the persisted state, and either re-enqueue or advance the phase.
    pub async fn run_job(&self, job: &Job) -> Result<()> {
        let payload: BatchPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| Error::Invariant(format!("malformed batch payload: {}", e)))?;

        let Some(versioned) = self.state.get::<PipelineState>(STATE_KEY).await? else {
            return Ok(());
        };
        let state = versioned.value;
        // A job from a stopped or superseded run is dropped silently.
        if state.status != RunStatus::Running || state.run_id != payload.run_id {
            return Ok(());
        }

        let started = Instant::now();
        let report = self
            .phase_batch(
                payload.phase,
                &state.scope,
                state.force,
                payload.cursor.as_deref(),
                state.batch_size,
            )
            .await;

        match report {
            Ok(report) => {
                let elapsed_ms = started.elapsed().as_millis() as f64;
                let updated = self
                    .mutate_state(|s| {
                        s.phase.completed += report.completed;
                        s.phase.failed += report.failed;
                        s.phase.skipped += report.skipped;
                        s.overall.completed += report.completed;
                        s.overall.failed += report.failed;
                        s.overall.skipped += report.skipped;
                        if report.max_id.is_some() {
                            s.cursor = report.max_id.clone();
                        }
                        if let Some(ref err) = report.item_error {
                            s.last_error = Some(err.clone());
                        }
                        s.last_activity = chrono::Utc::now().timestamp();
                        adjust_batch_size(s, &self.pipeline, elapsed_ms, &report);
                    })
                    .await?;

                if updated.status != RunStatus::Running {
                    return Ok(()); // stopped while we worked
                }

                if report.remaining {
                    self.enqueue_batch(
                        &payload.run_id,
                        payload.phase,
                        updated.cursor.clone(),
                        0,
                    )
                    .await?;
                } else {
                    tracing::info!(phase = payload.phase.as_str(), "phase complete");
                    self.advance_phase(&payload.run_id, payload.phase).await?;
                }
                Ok(())
            }
            Err(Error::RateLimit { retry_after }) => {
                // Suspend the phase, not the run: re-enqueue the same
                // batch after the backoff window.
                let delay = retry_after.unwrap_or(Duration::from_secs(30)).as_secs() as i64;
                tracing::warn!(
                    phase = payload.phase.as_str(),
                    delay_secs = delay,
                    "batch rate limited, rescheduling"
                );
                self.mutate_state(|s| {
                    s.last_error = Some("rate limited by embedding provider".into());
                    s.last_activity = chrono::Utc::now().timestamp();
                })
                .await?;
                self.enqueue_batch(&payload.run_id, payload.phase, payload.cursor, delay)
                    .await?;
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    phase = payload.phase.as_str(),
                    error = %err,
                    "batch failed, marking run failed"
                );
                self.mutate_state(|s| {
                    s.status = RunStatus::Failed;
                    s.last_error = Some(err.to_string());
                    s.last_activity = chrono::Utc::now().timestamp();
                })
                .await?;
                Err(err)
            }
        }
    }

    async fn advance_phase(&self, run_id: &str, finished: Phase) -> Result<()> {
        match finished.next() {
            Some(next) => {
                let total = self.phase_total(next).await?;
                self.mutate_state(|s| {
                    s.current_phase = next;
                    s.phase = Progress {
                        total,
                        ..Default::default()
                    };
                    s.overall.total += total;
                    s.cursor = None;
                    s.last_activity = chrono::Utc::now().timestamp();
                })
                .await?;
                self.enqueue_batch(run_id, next, None, 0).await?;
            }
            None => {
                self.mutate_state(|s| {
                    s.status = RunStatus::Completed;
                    s.cursor = None;
                    s.last_activity = chrono::Utc::now().timestamp();
                })
                .await?;
                tracing::info!(run_id = %run_id, "pipeline run completed");
            }
        }
        Ok(())
    }

    async fn enqueue_batch(
        &self,
        run_id: &str,
        phase: Phase,
        cursor: Option<String>,
        delay_secs: i64,
    ) -> Result<()> {
        let payload = serde_json::to_value(BatchPayload {
            run_id: run_id.to_string(),
            phase,
            cursor,
        })
        .map_err(|e| Error::Invariant(format!("unserializable payload: {}", e)))?;
        let run_at = chrono::Utc::now().timestamp() + delay_secs;
        self.queue.enqueue(BATCH_JOB, &payload, run_at, run_id).await?;
        Ok(())
    }

    /// Retrying CAS loop over the persisted state.
    async fn mutate_state<F>(&self, mut apply: F) -> Result<PipelineState>
    where
        F: FnMut(&mut PipelineState),
    {
        for _ in 0..8 {
            let Some(versioned) = self.state.get::<PipelineState>(STATE_KEY).await? else {
                return Err(Error::Invariant("pipeline state missing".into()));
            };
            let mut state = versioned.value;
            apply(&mut state);
            match self
                .state
                .compare_and_swap(STATE_KEY, &state, Some(versioned.version))
                .await
            {
                Ok(_) => return Ok(state),
                Err(Error::Conflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict("pipeline state under contention".into()))
    }

    // ============ Phase batches ============

    async fn phase_batch(
        &self,
        phase: Phase,
        scope: &RunScope,
        force: bool,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<BatchReport> {
        match phase {
            Phase::DocumentBuild => self.build_batch(scope, force, cursor, batch_size).await,
            Phase::ChunkBuild => self.chunk_batch(scope, cursor, batch_size).await,
            Phase::EmbedChunks => self.embed_batch(scope, cursor, batch_size).await,
            Phase::IndexUpsert => self.upsert_batch(scope, cursor, batch_size).await,
            Phase::Cleanup => self.cleanup_batch(scope, cursor, batch_size).await,
        }
    }

    async fn phase_total(&self, phase: Phase) -> Result<i64> {
        let count = match phase {
            Phase::DocumentBuild => 0, // computed at start()
            Phase::ChunkBuild => {
                sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE status = 'pending'")
                    .fetch_one(&self.pool)
                    .await?
            }
            Phase::EmbedChunks => {
                sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*)
                    FROM chunks c
                    JOIN documents d ON d.id = c.document_id
                    LEFT JOIN vectors v ON v.chunk_id = c.id
                    WHERE d.status = 'chunked'
                      AND c.embed_error IS NULL
                      AND (v.chunk_id IS NULL OR v.hash != c.hash)
                    "#,
                )
                .fetch_one(&self.pool)
                .await?
            }
            Phase::IndexUpsert => {
                sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE status = 'chunked'")
                    .fetch_one(&self.pool)
                    .await?
            }
            Phase::Cleanup => sqlx::query_scalar("SELECT COUNT(*) FROM documents")
                .fetch_one(&self.pool)
                .await?,
        };
        Ok(count)
    }

    /// DocumentBuild: upsert a document row per in-scope content item.
    /// Unchanged, already-settled items are skipped unless forced.
    async fn build_batch(
        &self,
        scope: &RunScope,
        force: bool,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<BatchReport> {
        let ids = self.source.list(scope).await?;
        let start = match cursor {
            Some(cursor) => ids.partition_point(|id| id.as_str() <= cursor),
            None => 0,
        };
        let batch: Vec<&String> = ids[start..].iter().take(batch_size).collect();

        let mut report = BatchReport {
            remaining: start + batch.len() < ids.len(),
            max_id: batch.last().map(|id| id.to_string()),
            ..Default::default()
        };

        for content_id in batch {
            match self.build_document(content_id, force).await {
                Ok(BuildOutcome::Built) => report.completed += 1,
                Ok(BuildOutcome::Excluded) => report.completed += 1,
                Ok(BuildOutcome::Skipped) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    report.item_error = Some(format!("{}: {}", content_id, err));
                    tracing::error!(
                        phase = "document_build",
                        content_id = %content_id,
                        error = %err,
                        "item failed"
                    );
                }
            }
        }
        Ok(report)
    }

    async fn build_document(&self, content_id: &str, force: bool) -> Result<BuildOutcome> {
        let Some(item) = self.source.fetch(content_id).await? else {
            tracing::warn!(content_id, "content item vanished from source");
            return Ok(BuildOutcome::Skipped);
        };

        let existing = sqlx::query(
            "SELECT content_hash, status FROM documents WHERE content_id = ?",
        )
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = &existing {
            let hash: String = row.get("content_hash");
            let status: String = row.get("status");
            let settled = matches!(status.as_str(), "indexed" | "excluded");
            if !force && settled && hash == item.content_hash {
                return Ok(BuildOutcome::Skipped);
            }
        }

        let excluded = item.text.trim().is_empty();
        let status = if excluded {
            DocStatus::Excluded
        } else {
            DocStatus::Pending
        };
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO documents (id, content_id, content_type, title, url, content_hash, status, chunk_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(content_id) DO UPDATE SET
                content_type = excluded.content_type,
                title = excluded.title,
                url = excluded.url,
                content_hash = excluded.content_hash,
                status = excluded.status,
                -- a document that became empty owns no chunks; cleanup
                -- then drops its leftovers
                chunk_count = CASE WHEN excluded.status = 'excluded'
                                   THEN 0 ELSE documents.chunk_count END,
                last_error = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&item.content_id)
        .bind(&item.content_type)
        .bind(&item.title)
        .bind(&item.url)
        .bind(&item.content_hash)
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(if excluded {
            BuildOutcome::Excluded
        } else {
            BuildOutcome::Built
        })
    }

    /// ChunkBuild: chunk each pending document and upsert its chunks,
    /// rewriting a chunk when its text, anchor, heading path, or offsets
    /// changed. Only a text (hash) change invalidates the vector.
    async fn chunk_batch(
        &self,
        scope: &RunScope,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<BatchReport> {
        let docs = self
            .select_documents("pending", scope, cursor, batch_size)
            .await?;

        let mut report = BatchReport {
            remaining: docs.len() == batch_size,
            max_id: docs.last().map(|d| d.id.clone()),
            ..Default::default()
        };

        for doc in &docs {
            match self.chunk_one(doc).await {
                Ok(count) => {
                    report.completed += 1;
                    tracing::debug!(content_id = %doc.content_id, chunks = count, "document chunked");
                }
                Err(err) => {
                    report.failed += 1;
                    report.item_error = Some(format!("{}: {}", doc.content_id, err));
                    tracing::error!(
                        phase = "chunk_build",
                        content_id = %doc.content_id,
                        error = %err,
                        "item failed"
                    );
                }
            }
        }
        Ok(report)
    }

    async fn chunk_one(&self, doc: &DocRow) -> Result<usize> {
        let Some(item) = self.source.fetch(&doc.content_id).await? else {
            self.mark_document_error(&doc.id, "content vanished before chunking")
                .await?;
            return Err(Error::Invariant(format!(
                "content '{}' vanished before chunking",
                doc.content_id
            )));
        };

        let drafts = chunk_document(&item.content_id, &item.text, &item.headings, &self.chunking);
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        for draft in &drafts {
            let heading_path = serde_json::to_string(&draft.heading_path)
                .map_err(|e| Error::Invariant(format!("unserializable heading path: {}", e)))?;
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, anchor, heading_path, text, hash,
                                    start_offset, end_offset, token_estimate, embed_error, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)
                ON CONFLICT(document_id, chunk_index) DO UPDATE SET
                    anchor = excluded.anchor,
                    heading_path = excluded.heading_path,
                    text = excluded.text,
                    hash = excluded.hash,
                    start_offset = excluded.start_offset,
                    end_offset = excluded.end_offset,
                    token_estimate = excluded.token_estimate,
                    -- a heading rename moves anchors and paths without
                    -- touching the text; the vector stays valid then
                    embed_error = CASE WHEN chunks.hash != excluded.hash
                                       THEN NULL ELSE chunks.embed_error END
                WHERE chunks.hash != excluded.hash
                   OR chunks.anchor != excluded.anchor
                   OR chunks.heading_path != excluded.heading_path
                   OR chunks.start_offset != excluded.start_offset
                   OR chunks.end_offset != excluded.end_offset
                "#,
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&doc.id)
            .bind(draft.chunk_index)
            .bind(&draft.anchor)
            .bind(&heading_path)
            .bind(&draft.text)
            .bind(&draft.hash)
            .bind(draft.start_offset)
            .bind(draft.end_offset)
            .bind(draft.token_estimate)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE documents SET status = 'chunked', chunk_count = ?, content_hash = ?, updated_at = ? WHERE id = ?",
        )
        .bind(drafts.len() as i64)
        .bind(&item.content_hash)
        .bind(now)
        .bind(&doc.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(drafts.len())
    }

    /// EmbedChunks: embed every chunk still lacking a current vector.
    /// Rate limits suspend the batch; provider failures flag each chunk
    /// for manual retry rather than dropping it.
    async fn embed_batch(
        &self,
        scope: &RunScope,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<BatchReport> {
        let (scope_sql, scope_binds) = scope_clause(scope);
        let sql = format!(
            r#"
            SELECT c.id, c.document_id, c.text, c.hash
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            LEFT JOIN vectors v ON v.chunk_id = c.id
            WHERE d.status = 'chunked'
              AND c.embed_error IS NULL
              AND (v.chunk_id IS NULL OR v.hash != c.hash)
              AND (? IS NULL OR c.id > ?)
              {}
            ORDER BY c.id
            LIMIT ?
            "#,
            scope_sql
        );

        let mut query = sqlx::query(&sql).bind(cursor).bind(cursor);
        for bind in &scope_binds {
            query = query.bind(bind.as_str());
        }
        let rows = query
            .bind(batch_size as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut report = BatchReport {
            remaining: rows.len() == batch_size,
            max_id: rows.last().map(|r| r.get::<String, _>("id")),
            ..Default::default()
        };

        if rows.is_empty() {
            return Ok(report);
        }

        let texts: Vec<String> = rows.iter().map(|r| r.get("text")).collect();
        match self.provider.embed(&texts).await {
            Ok(batch) => {
                for (row, vector) in rows.iter().zip(batch.vectors.into_iter()) {
                    let record = VectorRecord {
                        chunk_id: row.get("id"),
                        document_id: row.get("document_id"),
                        provider: self.provider.provider_name().to_string(),
                        model: self.provider.model_name().to_string(),
                        dims: batch.dims,
                        hash: row.get("hash"),
                        embedding: vector,
                    };
                    // A store failure costs one chunk, not the run; the
                    // chunk still lacks a vector and is retried next run.
                    match self.index.store(&record).await {
                        Ok(()) => report.completed += 1,
                        Err(err) => {
                            report.failed += 1;
                            report.item_error =
                                Some(format!("{}: {}", record.chunk_id, err));
                            tracing::error!(
                                phase = "embed_chunks",
                                chunk_id = %record.chunk_id,
                                error = %err,
                                "item failed"
                            );
                        }
                    }
                }
            }
            Err(err @ Error::RateLimit { .. }) => return Err(err),
            Err(Error::Provider(message)) => {
                // Flag every chunk in the batch for manual retry; the
                // data is never silently dropped.
                for row in &rows {
                    let chunk_id: String = row.get("id");
                    sqlx::query("UPDATE chunks SET embed_error = ? WHERE id = ?")
                        .bind(&message)
                        .bind(&chunk_id)
                        .execute(&self.pool)
                        .await?;
                    report.failed += 1;
                }
                report.item_error = Some(message.clone());
                tracing::error!(
                    phase = "embed_chunks",
                    failed = report.failed,
                    error = %message,
                    "embedding batch failed; chunks flagged for manual retry"
                );
            }
            Err(err) => return Err(err),
        }

        Ok(report)
    }

    /// IndexUpsert: finalize documents whose chunks are fully vectorized.
    async fn upsert_batch(
        &self,
        scope: &RunScope,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<BatchReport> {
        let docs = self
            .select_documents("chunked", scope, cursor, batch_size)
            .await?;

        let mut report = BatchReport {
            remaining: docs.len() == batch_size,
            max_id: docs.last().map(|d| d.id.clone()),
            ..Default::default()
        };
        let now = chrono::Utc::now().timestamp();

        for doc in &docs {
            if doc.chunk_count == 0 {
                self.mark_document_error(&doc.id, "document has zero chunks at index upsert")
                    .await?;
                report.failed += 1;
                tracing::error!(
                    content_id = %doc.content_id,
                    "document reached index upsert with zero chunks; needs investigation"
                );
                continue;
            }

            // Chunks past chunk_count are leftovers from a larger
            // previous version; cleanup removes them next phase.
            let vectorized: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*)
                FROM chunks c
                JOIN vectors v ON v.chunk_id = c.id AND v.hash = c.hash
                WHERE c.document_id = ? AND c.chunk_index < ?
                "#,
            )
            .bind(&doc.id)
            .bind(doc.chunk_count)
            .fetch_one(&self.pool)
            .await?;

            if vectorized == doc.chunk_count {
                sqlx::query(
                    "UPDATE documents SET status = 'indexed', indexed_at = ?, last_error = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(now)
                .bind(&doc.id)
                .execute(&self.pool)
                .await?;
                report.completed += 1;
                tracing::info!(content_id = %doc.content_id, chunks = doc.chunk_count, "document indexed");
            } else if now - doc.updated_at > self.pipeline.pending_timeout_secs {
                self.mark_document_error(&doc.id, "embedding incomplete past deadline")
                    .await?;
                report.failed += 1;
                tracing::error!(
                    content_id = %doc.content_id,
                    vectorized,
                    chunk_count = doc.chunk_count,
                    "document stuck partially embedded; demoted to error"
                );
            } else {
                report.skipped += 1;
                tracing::warn!(
                    content_id = %doc.content_id,
                    vectorized,
                    chunk_count = doc.chunk_count,
                    "document not fully embedded; will retry on next run"
                );
            }
        }
        Ok(report)
    }

    /// Cleanup: drop chunks past the current chunk count and vectors
    /// whose hash no longer matches their chunk. Everything still current
    /// is retained, which is what makes reindexing incremental.
    async fn cleanup_batch(
        &self,
        scope: &RunScope,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<BatchReport> {
        let docs = self
            .select_documents_any_status(scope, cursor, batch_size)
            .await?;

        let mut report = BatchReport {
            remaining: docs.len() == batch_size,
            max_id: docs.last().map(|d| d.id.clone()),
            ..Default::default()
        };

        for doc in &docs {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                DELETE FROM vectors WHERE chunk_id IN (
                    SELECT id FROM chunks WHERE document_id = ? AND chunk_index >= ?
                )
                "#,
            )
            .bind(&doc.id)
            .bind(doc.chunk_count)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM chunks WHERE document_id = ? AND chunk_index >= ?")
                .bind(&doc.id)
                .bind(doc.chunk_count)
                .execute(&mut *tx)
                .await?;

            // Stale vectors: the chunk text changed but no fresh vector
            // was written (e.g. flagged embed failures).
            sqlx::query(
                r#"
                DELETE FROM vectors WHERE document_id = ? AND chunk_id IN (
                    SELECT v.chunk_id FROM vectors v
                    JOIN chunks c ON c.id = v.chunk_id
                    WHERE v.document_id = ? AND v.hash != c.hash
                )
                "#,
            )
            .bind(&doc.id)
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

            // Orphans with no surviving chunk.
            sqlx::query(
                r#"
                DELETE FROM vectors WHERE document_id = ?
                  AND chunk_id NOT IN (SELECT id FROM chunks WHERE document_id = ?)
                "#,
            )
            .bind(&doc.id)
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            report.completed += 1;
        }
        Ok(report)
    }

    // ============ Selection helpers ============

    async fn select_documents(
        &self,
        status: &str,
        scope: &RunScope,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<Vec<DocRow>> {
        let (scope_sql, scope_binds) = scope_clause(scope);
        let sql = format!(
            r#"
            SELECT d.id, d.content_id, d.chunk_count, d.updated_at
            FROM documents d
            WHERE d.status = ?
              AND (? IS NULL OR d.id > ?)
              {}
            ORDER BY d.id
            LIMIT ?
            "#,
            scope_sql
        );

        let mut query = sqlx::query(&sql).bind(status).bind(cursor).bind(cursor);
        for bind in &scope_binds {
            query = query.bind(bind.as_str());
        }
        let rows = query
            .bind(batch_size as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(DocRow::from_row).collect())
    }

    async fn select_documents_any_status(
        &self,
        scope: &RunScope,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<Vec<DocRow>> {
        let (scope_sql, scope_binds) = scope_clause(scope);
        let sql = format!(
            r#"
            SELECT d.id, d.content_id, d.chunk_count, d.updated_at
            FROM documents d
            WHERE (? IS NULL OR d.id > ?)
              {}
            ORDER BY d.id
            LIMIT ?
            "#,
            scope_sql
        );

        let mut query = sqlx::query(&sql).bind(cursor).bind(cursor);
        for bind in &scope_binds {
            query = query.bind(bind.as_str());
        }
        let rows = query
            .bind(batch_size as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(DocRow::from_row).collect())
    }

    async fn mark_document_error(&self, doc_id: &str, message: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE documents SET status = 'error', last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(message)
        .bind(now)
        .bind(doc_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Stop the active run given only a database handle. The in-flight batch
/// (if any) finishes its unit of work; its follow-up job is gone and its
/// state write sees a non-running status.
pub async fn stop_run(pool: &SqlitePool) -> Result<bool> {
    let state = StateStore::new(pool.clone());
    let queue = JobQueue::new(pool.clone());

    for _ in 0..8 {
        let Some(versioned) = state.get::<PipelineState>(STATE_KEY).await? else {
            return Ok(false);
        };
        if versioned.value.status != RunStatus::Running {
            return Ok(false);
        }

        let cancelled = queue.cancel_all(None, &versioned.value.run_id).await?;

        let mut stopped = versioned.value.clone();
        stopped.status = RunStatus::Idle;
        stopped.last_activity = chrono::Utc::now().timestamp();
        match state
            .compare_and_swap(STATE_KEY, &stopped, Some(versioned.version))
            .await
        {
            Ok(_) => {
                tracing::info!(
                    run_id = %versioned.value.run_id,
                    cancelled_jobs = cancelled,
                    "pipeline stopped"
                );
                return Ok(true);
            }
            Err(Error::Conflict(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(Error::Conflict("pipeline state under contention".into()))
}

enum BuildOutcome {
    Built,
    Excluded,
    Skipped,
}

struct DocRow {
    id: String,
    content_id: String,
    chunk_count: i64,
    updated_at: i64,
}

impl DocRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            content_id: row.get("content_id"),
            chunk_count: row.get("chunk_count"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// SQL fragment (ANDed into a WHERE over alias `d`) restricting to the
/// run scope, plus its bind values.
fn scope_clause(scope: &RunScope) -> (String, Vec<String>) {
    match scope {
        RunScope::All => (String::new(), Vec::new()),
        RunScope::ContentType { content_type } => (
            "AND d.content_type = ?".to_string(),
            vec![content_type.clone()],
        ),
        RunScope::Item { content_id } => {
            ("AND d.content_id = ?".to_string(), vec![content_id.clone()])
        }
    }
}

/// Float the batch size between the configured floor and ceiling based on
/// a rolling average of per-item time: shrink when slow, grow when fast.
fn adjust_batch_size(
    state: &mut PipelineState,
    config: &PipelineConfig,
    elapsed_ms: f64,
    report: &BatchReport,
) {
    let items = report.completed + report.failed + report.skipped;
    if items <= 0 {
        return;
    }
    let per_item = elapsed_ms / items as f64;
    state.avg_item_ms = if state.avg_item_ms == 0.0 {
        per_item
    } else {
        state.avg_item_ms * 0.7 + per_item * 0.3
    };

    if state.avg_item_ms > config.slow_threshold_ms as f64 {
        state.batch_size = (state.batch_size / 2).max(config.batch_floor);
    } else if state.avg_item_ms < config.fast_threshold_ms as f64 {
        state.batch_size = (state.batch_size * 2).min(config.batch_ceiling);
    }
}
