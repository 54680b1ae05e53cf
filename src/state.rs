//! Durable key/value state store with optimistic versioning.
//!
//! Pipeline state is an explicit persisted value, never a process-wide
//! global: readers get the value plus its version, and writers commit
//! with a compare-and-swap on that version. Concurrent workers mutating
//! the same run therefore serialize through the store instead of
//! clobbering each other.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};

/// A loaded value and the version to CAS against when writing it back.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load and deserialize the value at `key`, if present.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<T>>> {
        let row = sqlx::query("SELECT value, version FROM pipeline_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.get("value");
        let value = serde_json::from_str(&raw)
            .map_err(|e| Error::Invariant(format!("corrupt state at key '{}': {}", key, e)))?;
        Ok(Some(Versioned {
            value,
            version: row.get("version"),
        }))
    }

    /// Write `value` only if the stored version still equals
    /// `expected_version` (None means the key must not exist yet).
    /// Returns the new version, or [`Error::Conflict`] when another
    /// writer got there first.
    pub async fn compare_and_swap<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        let raw = serde_json::to_string(value)
            .map_err(|e| Error::Invariant(format!("unserializable state: {}", e)))?;

        match expected_version {
            None => {
                let result = sqlx::query(
                    "INSERT INTO pipeline_state (key, value, version) VALUES (?, ?, 1)
                     ON CONFLICT(key) DO NOTHING",
                )
                .bind(key)
                .bind(&raw)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(Error::Conflict(format!(
                        "state key '{}' already exists",
                        key
                    )));
                }
                Ok(1)
            }
            Some(expected) => {
                let result = sqlx::query(
                    "UPDATE pipeline_state SET value = ?, version = version + 1
                     WHERE key = ? AND version = ?",
                )
                .bind(&raw)
                .bind(key)
                .bind(expected)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(Error::Conflict(format!(
                        "state key '{}' was modified concurrently",
                        key
                    )));
                }
                Ok(expected + 1)
            }
        }
    }

    /// Unconditional write, creating the key if needed. For values where
    /// last-writer-wins is acceptable.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)
            .map_err(|e| Error::Invariant(format!("unserializable state: {}", e)))?;
        sqlx::query(
            "INSERT INTO pipeline_state (key, value, version) VALUES (?, ?, 1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, version = version + 1",
        )
        .bind(key)
        .bind(&raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM pipeline_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
