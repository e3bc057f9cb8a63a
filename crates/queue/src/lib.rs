//! `wardsync-queue`: the durable outbox.
//!
//! Jobs survive restarts: every mutation is persisted through a
//! [`KeyValueStore`] before the call returns. The queue knows nothing about
//! delivery; the flush coordinator in `wardsync-sync` drives it and records
//! what it did in a [`SyncLog`].

pub mod kv;
pub mod store;
pub mod sync_log;

pub use kv::{KeyValueStore, MemoryKv, SqliteKv, StorageError, default_db_path};
pub use store::{Pending, PersistentQueue, QueueError, QueueMeta};
pub use sync_log::{DEFAULT_LOG_CAPACITY, LogEntry, LogEvent, MemoryLog, SqliteLog, SyncLog};
