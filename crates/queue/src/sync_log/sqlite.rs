//! Flush history in the outbox database.
//!
//! Table `sync_log (id INTEGER PRIMARY KEY AUTOINCREMENT, ts INTEGER, event
//! TEXT, job_id TEXT NULL, message TEXT)`, `ts` in milliseconds since the
//! epoch. Rows are ordered by `id`, so entries written in the same
//! millisecond keep their order.

use anyhow::Context;
use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use wardsync_core::JobId;

use super::{LogEntry, SyncLog};
use crate::kv::{SqliteKv, StorageError};

const TABLE: &str = "sync_log";

/// SQLite-backed log sharing the connection pool of a [`SqliteKv`].
#[derive(Debug, Clone)]
pub struct SqliteLog {
    pool: SqlitePool,
    capacity: usize,
}

impl SqliteLog {
    /// Create the log table next to the key-value table of `kv`.
    pub async fn attach(kv: &SqliteKv, capacity: usize) -> anyhow::Result<Self> {
        let pool = kv.pool().clone();
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_log (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                ts      INTEGER NOT NULL,
                event   TEXT NOT NULL,
                job_id  TEXT,
                message TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create sync_log table")?;

        Ok(Self { pool, capacity })
    }
}

#[async_trait]
impl SyncLog for SqliteLog {
    async fn append(&self, entry: LogEntry) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend("begin log write"))?;

        sqlx::query("INSERT INTO sync_log (ts, event, job_id, message) VALUES (?1, ?2, ?3, ?4)")
            .bind(entry.at.timestamp_millis())
            .bind(entry.event.as_str())
            .bind(entry.job_id.as_ref().map(JobId::as_str))
            .bind(entry.message.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend("append to sync log"))?;

        // Everything older than the newest `capacity` rows.
        sqlx::query(
            r#"
            DELETE FROM sync_log
            WHERE id <= (SELECT id FROM sync_log ORDER BY id DESC LIMIT 1 OFFSET ?1)
            "#,
        )
        .bind(to_i64(self.capacity))
        .execute(&mut *tx)
        .await
        .map_err(backend("prune sync log"))?;

        tx.commit().await.map_err(backend("commit log write"))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT ts, event, job_id, message FROM sync_log ORDER BY id DESC LIMIT ?1",
        )
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(backend("read sync log"))?;

        rows.iter().map(decode).collect()
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sync_log")
            .fetch_one(&self.pool)
            .await
            .map_err(backend("count sync log"))?;
        let n: i64 = row.try_get("n").map_err(|err| corrupt(err.to_string()))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_log")
            .execute(&self.pool)
            .await
            .map_err(backend("clear sync log"))?;
        Ok(())
    }
}

fn decode(row: &SqliteRow) -> Result<LogEntry, StorageError> {
    let ts: i64 = row.try_get("ts").map_err(|err| corrupt(err.to_string()))?;
    let event: String = row.try_get("event").map_err(|err| corrupt(err.to_string()))?;
    let job_id: Option<String> = row.try_get("job_id").map_err(|err| corrupt(err.to_string()))?;
    let message: String = row.try_get("message").map_err(|err| corrupt(err.to_string()))?;

    Ok(LogEntry {
        at: DateTime::from_timestamp_millis(ts).ok_or_else(|| corrupt(format!("timestamp {ts} out of range")))?,
        event: event.parse().map_err(corrupt)?,
        job_id: job_id
            .map(JobId::parse)
            .transpose()
            .map_err(|err| corrupt(err.to_string()))?,
        message,
    })
}

fn backend(action: &'static str) -> impl Fn(sqlx::Error) -> StorageError {
    move |err| {
        tracing::error!("failed to {action}: {err:?}");
        StorageError::backend(err)
    }
}

fn corrupt(reason: String) -> StorageError {
    StorageError::Corrupt {
        key: TABLE.to_string(),
        reason,
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
