//! Durable key-value store persisted in SQLite.
//!
//! One table, `kv_store (key TEXT PRIMARY KEY, value TEXT NOT NULL)`. Every
//! write is a single statement, so each `set`/`delete` is atomic on its own.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::{KeyValueStore, StorageError};

/// SQLite-backed store.
///
/// Cheap to clone; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create outbox directory at {parent:?}"))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open SQLite outbox at {path:?}"))?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database. Contents vanish when the store is dropped.
    pub async fn in_memory() -> anyhow::Result<Self> {
        // A single connection that never expires, otherwise each new
        // connection would see its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory SQLite outbox")?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create kv_store table")?;

        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl KeyValueStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| {
                tracing::error!(key, "failed to read outbox key: {err:?}");
                StorageError::backend(err)
            })?;

        row.map(|row| row.try_get::<String, _>("value"))
            .transpose()
            .map_err(|err| StorageError::Corrupt {
                key: key.to_string(),
                reason: err.to_string(),
            })
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value)
            VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            tracing::error!(key, "failed to write outbox key: {err:?}");
            StorageError::backend(err)
        })?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                tracing::error!(key, "failed to delete outbox key: {err:?}");
                StorageError::backend(err)
            })?;

        Ok(())
    }
}

/// Default location of the outbox database (in the OS app data directory).
///
/// Example on Linux: `~/.local/share/wardsync/outbox.db`
pub fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(dirs::home_dir)
        .context("could not determine a data directory for the outbox")?;

    Ok(base.join("wardsync").join("outbox.db"))
}
