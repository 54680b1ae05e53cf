//! Durable job queue over SQLite.
//!
//! Batch work is dispatched as discrete queued jobs so a run survives
//! process restarts. Delivery is at-least-once: a job claimed by a worker
//! that dies stays `running` until [`JobQueue::recover_stale`] re-queues
//! it, so every handler must be idempotent.

use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::error::Result;

/// A claimed job ready to execute.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub group: String,
    pub payload: Value,
    pub run_at: i64,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue a job. `group` scopes cancellation (one pipeline run uses
    /// its run id as the group).
    pub async fn enqueue(&self, name: &str, payload: &Value, run_at: i64, group: &str) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (name, group_name, payload, run_at, status, created_at)
            VALUES (?, ?, ?, ?, 'queued', ?)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(group)
        .bind(payload.to_string())
        .bind(run_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("id"))
    }

    /// Cancel pending jobs: all queued jobs in `group`, optionally
    /// restricted to one job name. Running jobs finish their current unit
    /// of work (cancellation is cooperative).
    pub async fn cancel_all(&self, name: Option<&str>, group: &str) -> Result<u64> {
        let result = match name {
            Some(name) => {
                sqlx::query(
                    "DELETE FROM jobs WHERE status = 'queued' AND group_name = ? AND name = ?",
                )
                .bind(group)
                .bind(name)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("DELETE FROM jobs WHERE status = 'queued' AND group_name = ?")
                    .bind(group)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Atomically claim the next due job, marking it running. Safe under
    /// concurrent workers: the UPDATE targets a single row by subquery.
    pub async fn claim_next(&self) -> Result<Option<Job>> {
        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query(
            r#"
            UPDATE jobs SET status = 'running'
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued' AND run_at <= ?
                ORDER BY run_at, id
                LIMIT 1
            )
            RETURNING id, name, group_name, payload, run_at
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload_raw: String = row.get("payload");
        let payload = serde_json::from_str(&payload_raw).unwrap_or(Value::Null);

        Ok(Some(Job {
            id: row.get("id"),
            name: row.get("name"),
            group: row.get("group_name"),
            payload,
            run_at: row.get("run_at"),
        }))
    }

    /// Acknowledge a finished job.
    pub async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Re-queue jobs left `running` by a crashed worker. Called on worker
    /// start; this is what makes delivery at-least-once.
    pub async fn recover_stale(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE jobs SET status = 'queued' WHERE status = 'running'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Number of queued or running jobs in `group`.
    pub async fn pending_count(&self, group: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE group_name = ? AND status IN ('queued', 'running')",
        )
        .bind(group)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
