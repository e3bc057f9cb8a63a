//! String key-value storage backends.
//!
//! The queue only needs three primitives from its storage: read a value, write
//! a value, delete a value. Anything that can offer them durably (a SQLite
//! table, a device keychain, an in-memory map for tests) can back the outbox.

mod memory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

pub use memory::MemoryKv;
pub use sqlite::{SqliteKv, default_db_path};

/// Storage backend abstraction.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Insert or overwrite the value stored under `key`.
    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        (**self).delete(key).await
    }
}

/// Storage error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("failed to encode record for {key}: {reason}")]
    Encode { key: String, reason: String },
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StorageError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}
