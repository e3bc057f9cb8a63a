use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{DEFAULT_LOG_CAPACITY, LogEntry, SyncLog};
use crate::kv::StorageError;

/// In-memory log (for tests and outboxes without a database).
#[derive(Debug)]
pub struct MemoryLog {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
}

impl MemoryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity,
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[async_trait]
impl SyncLog for MemoryLog {
    async fn append(&self, entry: LogEntry) -> Result<(), StorageError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>, StorageError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.entries.read().unwrap_or_else(PoisonError::into_inner).len())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }
}
