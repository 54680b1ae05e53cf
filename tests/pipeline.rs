//! End-to-end pipeline runs over a filesystem content root, driven
//! through the durable queue exactly as production runs are.

mod common;

use async_trait::async_trait;
use common::{
    count, doc_status, harness, harness_with_index, small_chunking_config,
    steady_pipeline_config,
};
use semandex::content::RunScope;
use semandex::error::{Error, Result};
use semandex::index::{SearchHits, SqliteVectorIndex, VectorIndex, VectorRecord};
use semandex::models::SearchFilters;
use semandex::pipeline::{RunStatus, StartOptions};
use sqlx::Row;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn start_all() -> StartOptions {
    StartOptions {
        scope: RunScope::All,
        force: false,
    }
}

/// One section per chunk: a heading plus fifteen words stays under the
/// small target.
fn section(heading: &str, words: &str) -> String {
    format!("{}\n\n{}\n\n", heading, words)
}

fn three_section_doc(third_body: &str) -> String {
    titled_three_section_doc("Launch Guide", third_body)
}

fn titled_three_section_doc(title: &str, third_body: &str) -> String {
    let mut doc = String::new();
    doc.push_str(&section(
        &format!("# {}", title),
        "alpha bravo charlie delta echo foxtrot golf hotel india juliett kilo lima mike november oscar",
    ));
    doc.push_str(&section(
        "## Preparation",
        "papa quebec romeo sierra tango uniform victor whiskey xray yankee zulu anchor beacon cable dial",
    ));
    doc.push_str(&section("## Aftermath", third_body));
    doc
}

/// Delegating index whose first `store` call fails with a storage error.
struct FailOnceIndex {
    inner: Arc<SqliteVectorIndex>,
    tripped: AtomicBool,
}

#[async_trait]
impl VectorIndex for FailOnceIndex {
    async fn store(&self, record: &VectorRecord) -> Result<()> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(Error::Storage(sqlx::Error::PoolTimedOut));
        }
        self.inner.store(record).await
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        self.inner.delete(chunk_id).await
    }

    async fn delete_for_document(&self, document_id: &str) -> Result<()> {
        self.inner.delete_for_document(document_id).await
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<SearchHits> {
        self.inner.search(query, top_k, filters).await
    }

    async fn count(&self, filters: &SearchFilters) -> Result<i64> {
        self.inner.count(filters).await
    }
}

#[tokio::test]
async fn full_run_indexes_documents_and_excludes_empty_ones() {
    let h = harness(small_chunking_config(), steady_pipeline_config(5)).await;
    h.write("guide.md", &three_section_doc(
        "ember falcon garnet harbor ingot jasper kernel lantern marble nickel onyx pebble quartz ridge slate",
    ));
    h.write("notes.txt", "A short note about deployment and rollback procedures for the platform.");
    h.write("empty.md", "  \n\n  ");

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    let state = h.orchestrator.status().await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.overall.failed, 0);

    assert_eq!(doc_status(&h.pool, "guide.md").await.as_deref(), Some("indexed"));
    assert_eq!(doc_status(&h.pool, "notes.txt").await.as_deref(), Some("indexed"));
    assert_eq!(doc_status(&h.pool, "empty.md").await.as_deref(), Some("excluded"));

    let chunks = count(&h.pool, "chunks").await;
    let vectors = count(&h.pool, "vectors").await;
    assert!(chunks >= 4, "expected multiple chunks, got {}", chunks);
    assert_eq!(vectors, chunks);

    // Every stored vector is current with its chunk's text.
    let stale: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM vectors v JOIN chunks c ON c.id = v.chunk_id WHERE v.hash != c.hash",
    )
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(stale, 0);
}

#[tokio::test]
async fn unchanged_rerun_skips_and_embeds_nothing() {
    let h = harness(small_chunking_config(), steady_pipeline_config(5)).await;
    h.write("a.md", "# Alpha\n\nSome stable content about compilers and parsers goes here today.");
    h.write("b.md", "# Beta\n\nEntirely different content about databases and indexes lives here now.");

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();
    let first_embeds = h.provider.embedded_count();
    assert!(first_embeds > 0);

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    let state = h.orchestrator.status().await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(h.provider.embedded_count(), first_embeds);
    assert!(state.overall.skipped >= 2, "unchanged documents were not skipped");

    // Force reprocesses documents but chunk hashes still match, so the
    // embedding provider is never called again.
    h.orchestrator
        .start(StartOptions {
            scope: RunScope::All,
            force: true,
        })
        .await
        .unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();
    assert_eq!(h.provider.embedded_count(), first_embeds);
    assert_eq!(doc_status(&h.pool, "a.md").await.as_deref(), Some("indexed"));
}

#[tokio::test]
async fn stop_mid_run_then_restart_embeds_each_chunk_exactly_once() {
    let h = harness(small_chunking_config(), steady_pipeline_config(5)).await;
    for i in 0..12 {
        h.write(
            &format!("doc{:02}.md", i),
            &format!(
                "item{i} subject{i} matter{i} theme{i} focus{i} angle{i} facet{i} layer{i}",
                i = i
            ),
        );
    }

    h.orchestrator.start(start_all()).await.unwrap();

    // Drive single jobs until the embed phase is partway through.
    loop {
        let stepped = h.orchestrator.step().await.unwrap();
        assert!(stepped, "queue drained before any vectors were stored");
        let vectors = count(&h.pool, "vectors").await;
        if vectors > 0 && vectors < 12 {
            break;
        }
    }
    let partial = count(&h.pool, "vectors").await;
    assert_eq!(h.provider.embedded_count() as i64, partial);

    assert!(h.orchestrator.stop().await.unwrap());
    let state = h.orchestrator.status().await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Idle);
    // Stop is cooperative: the queue holds nothing runnable afterwards.
    assert!(h.orchestrator.queue().claim_next().await.unwrap().is_none());
    // Stopping twice is a no-op.
    assert!(!h.orchestrator.stop().await.unwrap());

    // Restart resumes from persisted status: the already-stored vectors
    // are kept and only the remaining chunks get embedded.
    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    let state = h.orchestrator.status().await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(count(&h.pool, "vectors").await, 12);
    for i in 0..12 {
        assert_eq!(
            doc_status(&h.pool, &format!("doc{:02}.md", i)).await.as_deref(),
            Some("indexed")
        );
    }

    let log = h.provider.embedded.lock().unwrap();
    assert_eq!(log.len(), 12);
    let mut unique = log.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 12, "some chunk was embedded more than once");
}

#[tokio::test]
async fn editing_one_section_replaces_only_that_chunk() {
    let h = harness(small_chunking_config(), steady_pipeline_config(5)).await;
    h.write("doc.md", &three_section_doc(
        "ember falcon garnet harbor ingot jasper kernel lantern marble nickel onyx pebble quartz ridge slate",
    ));

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    assert_eq!(count(&h.pool, "chunks").await, 3);
    assert_eq!(count(&h.pool, "vectors").await, 3);
    let embeds_before = h.provider.embedded_count();
    assert_eq!(embeds_before, 3);

    let before: Vec<(String, i64, String)> =
        sqlx::query("SELECT id, chunk_index, hash FROM chunks ORDER BY chunk_index")
            .fetch_all(&h.pool)
            .await
            .unwrap()
            .iter()
            .map(|r| (r.get("id"), r.get("chunk_index"), r.get("hash")))
            .collect();

    // Rewrite only the last section's body.
    h.write("doc.md", &three_section_doc(
        "tundra umber violet walnut xenon yonder zephyr amber basalt cobalt damson emerald flint gorse heather",
    ));

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    assert_eq!(count(&h.pool, "chunks").await, 3);
    assert_eq!(count(&h.pool, "vectors").await, 3);
    // Exactly one new embedding call, for the changed chunk.
    assert_eq!(h.provider.embedded_count(), embeds_before + 1);

    let after: Vec<(String, i64, String)> =
        sqlx::query("SELECT id, chunk_index, hash FROM chunks ORDER BY chunk_index")
            .fetch_all(&h.pool)
            .await
            .unwrap()
            .iter()
            .map(|r| (r.get("id"), r.get("chunk_index"), r.get("hash")))
            .collect();

    // Chunk identities are stable across the reindex.
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.0, a.0);
        assert_eq!(b.1, a.1);
    }
    assert_eq!(before[0].2, after[0].2);
    assert_eq!(before[1].2, after[1].2);
    assert_ne!(before[2].2, after[2].2);

    assert_eq!(doc_status(&h.pool, "doc.md").await.as_deref(), Some("indexed"));
}

#[tokio::test]
async fn shrinking_document_cleans_up_excess_chunks_and_vectors() {
    let h = harness(small_chunking_config(), steady_pipeline_config(5)).await;
    h.write("doc.md", &three_section_doc(
        "ember falcon garnet harbor ingot jasper kernel lantern marble nickel onyx pebble quartz ridge slate",
    ));

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();
    assert_eq!(count(&h.pool, "chunks").await, 3);

    h.write("doc.md", "# Launch Guide\n\nJust a short residual summary remains here.");

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    assert_eq!(count(&h.pool, "chunks").await, 1);
    assert_eq!(count(&h.pool, "vectors").await, 1);
    assert_eq!(doc_status(&h.pool, "doc.md").await.as_deref(), Some("indexed"));

    let chunk_count: i64 = sqlx::query_scalar(
        "SELECT chunk_count FROM documents WHERE content_id = 'doc.md'",
    )
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(chunk_count, 1);
}

#[tokio::test]
async fn content_type_scope_restricts_the_run() {
    let h = harness(small_chunking_config(), steady_pipeline_config(5)).await;
    h.write("a.md", "# Markdown\n\nMarkdown body content for the scoped run test.");
    h.write("b.txt", "Plain text body that the scoped run must not touch.");

    h.orchestrator
        .start(StartOptions {
            scope: RunScope::ContentType {
                content_type: "markdown".into(),
            },
            force: false,
        })
        .await
        .unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    assert_eq!(doc_status(&h.pool, "a.md").await.as_deref(), Some("indexed"));
    assert!(doc_status(&h.pool, "b.txt").await.is_none());
}

#[tokio::test]
async fn renaming_a_heading_refreshes_paths_and_anchors_without_reembedding() {
    let h = harness(small_chunking_config(), steady_pipeline_config(5)).await;
    let third =
        "ember falcon garnet harbor ingot jasper kernel lantern marble nickel onyx pebble quartz ridge slate";
    h.write("doc.md", &titled_three_section_doc("Launch Guide", third));

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    let embeds_before = h.provider.embedded_count();
    assert_eq!(embeds_before, 3);
    let before: Vec<(String, String)> =
        sqlx::query("SELECT anchor, heading_path FROM chunks ORDER BY chunk_index")
            .fetch_all(&h.pool)
            .await
            .unwrap()
            .iter()
            .map(|r| (r.get("anchor"), r.get("heading_path")))
            .collect();

    h.write("doc.md", &titled_three_section_doc("Mission Guide", third));

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    let after: Vec<(String, String)> =
        sqlx::query("SELECT anchor, heading_path FROM chunks ORDER BY chunk_index")
            .fetch_all(&h.pool)
            .await
            .unwrap()
            .iter()
            .map(|r| (r.get("anchor"), r.get("heading_path")))
            .collect();

    // Every chunk's stored heading stack reflects the new title.
    assert_eq!(after.len(), 3);
    for (_, path_json) in &after {
        let path: Vec<String> = serde_json::from_str(path_json).unwrap();
        assert_eq!(path[0], "Mission Guide");
    }
    // Anchors derive from the heading path, so they all moved too.
    for (b, a) in before.iter().zip(after.iter()) {
        assert_ne!(b.0, a.0);
    }

    // Only the chunk containing the heading line itself changed text;
    // the other two keep their vectors.
    assert_eq!(h.provider.embedded_count(), embeds_before + 1);
    let stale: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM vectors v JOIN chunks c ON c.id = v.chunk_id WHERE v.hash != c.hash",
    )
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(stale, 0);
    assert_eq!(doc_status(&h.pool, "doc.md").await.as_deref(), Some("indexed"));
}

#[tokio::test]
async fn vector_store_failure_costs_one_chunk_not_the_run() {
    let h = harness_with_index(
        small_chunking_config(),
        steady_pipeline_config(5),
        |inner| {
            Arc::new(FailOnceIndex {
                inner,
                tripped: AtomicBool::new(false),
            })
        },
    )
    .await;
    h.write("a.md", "# Alpha\n\nShort body about compilers for the store failure run.");
    h.write("b.md", "# Beta\n\nShort body about databases for the store failure run.");
    h.write("c.md", "# Gamma\n\nShort body about networks for the store failure run.");

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    // The failed store costs one chunk; every other document still
    // reaches indexed and the run completes.
    let state = h.orchestrator.status().await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.overall.failed, 1);
    assert!(state.last_error.is_some());
    assert_eq!(count(&h.pool, "vectors").await, 2);

    let chunked: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE status = 'chunked'")
            .fetch_one(&h.pool)
            .await
            .unwrap();
    let indexed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE status = 'indexed'")
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(chunked, 1);
    assert_eq!(indexed, 2);

    // The next run embeds the missing vector and finishes the document.
    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    let state = h.orchestrator.status().await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.overall.failed, 0);
    assert_eq!(count(&h.pool, "vectors").await, 3);
    let indexed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE status = 'indexed'")
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(indexed, 3);
}

#[tokio::test]
async fn zero_chunk_document_is_demoted_to_error_without_retry() {
    let h = harness(small_chunking_config(), steady_pipeline_config(5)).await;
    h.write("real.md", "# Real\n\nA body that indexes normally alongside the broken row.");

    // A chunked document that somehow lost its chunks.
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO documents (id, content_id, content_type, content_hash, status, chunk_count, created_at, updated_at)
         VALUES ('d-ghost', 'ghost.md', 'markdown', 'h0', 'chunked', 0, ?, ?)",
    )
    .bind(now)
    .bind(now)
    .execute(&h.pool)
    .await
    .unwrap();

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    let state = h.orchestrator.status().await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.overall.failed, 1);
    assert_eq!(doc_status(&h.pool, "ghost.md").await.as_deref(), Some("error"));
    let message: Option<String> =
        sqlx::query_scalar("SELECT last_error FROM documents WHERE content_id = 'ghost.md'")
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert!(message.unwrap_or_default().contains("zero chunks"));
    assert_eq!(doc_status(&h.pool, "real.md").await.as_deref(), Some("indexed"));

    // Error status is terminal: a later run leaves it untouched.
    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();
    assert_eq!(doc_status(&h.pool, "ghost.md").await.as_deref(), Some("error"));
}

#[tokio::test]
async fn stalled_partial_embedding_times_out_to_error() {
    let h = harness(small_chunking_config(), steady_pipeline_config(5)).await;
    let now = chrono::Utc::now().timestamp();

    // Two chunked documents stuck before embedding: one past the pending
    // deadline, one well inside it.
    for (doc_id, content_id, updated_at) in [
        ("d-stuck", "stuck.md", now - 2 * 86_400),
        ("d-wait", "wait.md", now - 60),
    ] {
        sqlx::query(
            "INSERT INTO documents (id, content_id, content_type, content_hash, status, chunk_count, created_at, updated_at)
             VALUES (?, ?, 'markdown', 'h0', 'chunked', 1, ?, ?)",
        )
        .bind(doc_id)
        .bind(content_id)
        .bind(updated_at)
        .bind(updated_at)
        .execute(&h.pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, anchor, heading_path, text, hash,
                                 start_offset, end_offset, token_estimate, embed_error, created_at)
             VALUES (?, ?, 0, 'section-0-feedc0de', '[]', 'never embedded', 'h-chunk',
                     0, 14, 5, 'provider exploded', ?)",
        )
        .bind(format!("c-{}", doc_id))
        .bind(doc_id)
        .bind(updated_at)
        .execute(&h.pool)
        .await
        .unwrap();
    }

    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();

    assert_eq!(doc_status(&h.pool, "stuck.md").await.as_deref(), Some("error"));
    let message: Option<String> =
        sqlx::query_scalar("SELECT last_error FROM documents WHERE content_id = 'stuck.md'")
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert!(message.unwrap_or_default().contains("deadline"));
    // Inside the window the document just waits for a later run.
    assert_eq!(doc_status(&h.pool, "wait.md").await.as_deref(), Some("chunked"));
}

#[tokio::test]
async fn starting_while_running_conflicts() {
    let h = harness(small_chunking_config(), steady_pipeline_config(5)).await;
    h.write("a.md", "# Doc\n\nEnough body text to make the run meaningful.");

    h.orchestrator.start(start_all()).await.unwrap();
    let err = h.orchestrator.start(start_all()).await.unwrap_err();
    assert_eq!(err.code(), "conflict");

    h.orchestrator.run_worker_until_idle().await.unwrap();
    // Completed runs can be restarted.
    h.orchestrator.start(start_all()).await.unwrap();
    h.orchestrator.run_worker_until_idle().await.unwrap();
}
