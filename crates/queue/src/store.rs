//! Durable FIFO of jobs on top of a [`KeyValueStore`].
//!
//! Layout:
//! - `wardsync/outbox/index` holds the ordered list of job ids (with their
//!   creation time, so queue metadata needs no record reads);
//! - `wardsync/outbox/jobs/<id>` holds one serialized [`Job`].
//!
//! A record is always written before its id enters the index and the id
//! leaves the index before its record is deleted. A crash between the two
//! steps therefore leaves at worst an orphan record (invisible) or a dangling
//! id, which [`PersistentQueue::pending`] drops from the index.
//!
//! An index that no longer decodes is moved aside under
//! `wardsync/outbox/index.corrupt.<millis>` and the queue starts over with an
//! empty one, so new jobs can still be recorded. A record that no longer
//! decodes stays where it is and blocks delivery from that point on.
//!
//! Every index read-modify-write runs under one async mutex, so concurrent
//! enqueues never lose each other's ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use wardsync_core::{Job, JobId, NewJob, ValidationError};

use crate::kv::{KeyValueStore, StorageError};

pub const INDEX_KEY: &str = "wardsync/outbox/index";
pub const INDEX_QUARANTINE_PREFIX: &str = "wardsync/outbox/index.corrupt.";
pub const JOB_KEY_PREFIX: &str = "wardsync/outbox/jobs/";

/// Storage key of a job record.
pub fn job_key(id: &JobId) -> String {
    format!("{JOB_KEY_PREFIX}{id}")
}

/// Queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("invalid job: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Queue summary for UI badges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMeta {
    pub size: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Deliverable head of the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Pending {
    /// Readable jobs, oldest first, up to the first corrupt record.
    pub jobs: Vec<Job>,
    /// The record that stopped the read, if any. Jobs behind it stay queued.
    pub blocked_by: Option<StorageError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    id: JobId,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    fn position(&self, id: &JobId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    fn contains(&self, id: &JobId) -> bool {
        self.position(id).is_some()
    }

    // Keep the first occurrence of every id. Returns true if anything changed.
    fn dedup(&mut self) -> bool {
        let before = self.entries.len();
        let mut seen = std::collections::HashSet::with_capacity(before);
        self.entries.retain(|e| seen.insert(e.id.clone()));
        self.entries.len() != before
    }
}

/// Durable, ordered job queue.
#[derive(Debug)]
pub struct PersistentQueue<K> {
    kv: K,
    index_lock: Mutex<()>,
}

impl<K: KeyValueStore> PersistentQueue<K> {
    pub fn new(kv: K) -> Self {
        Self {
            kv,
            index_lock: Mutex::new(()),
        }
    }

    /// Underlying storage backend.
    pub fn backend(&self) -> &K {
        &self.kv
    }

    /// Persist a job at the tail of the queue.
    ///
    /// If a job with the same id is already queued it is updated in place:
    /// it keeps its position and `created_at`, takes the new payload and
    /// metadata, gets its idempotency key recomputed and its tries reset.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Job, QueueError> {
        let mut job = new_job.into_job(Utc::now())?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await?;

        if let Some(pos) = index.position(&job.id) {
            job.created_at = index.entries[pos].created_at;
            self.write_job(&job).await?;
            tracing::info!(job_id = %job.id, "queued job replaced in place");
            return Ok(job);
        }

        self.write_job(&job).await?;
        index.entries.push(IndexEntry {
            id: job.id.clone(),
            created_at: job.created_at,
        });
        self.store_index(&index).await?;

        tracing::info!(
            job_id = %job.id,
            patient_id = job.patient_id().unwrap_or("-"),
            queue_size = index.entries.len(),
            "job enqueued"
        );
        Ok(job)
    }

    /// Readable jobs, oldest first, and the corrupt record that ends them.
    ///
    /// Ids whose record has vanished are dropped from the index. Reading
    /// stops at the first record that exists but cannot be decoded; it is
    /// reported in [`Pending::blocked_by`] and left untouched.
    pub async fn pending(&self) -> Result<Pending, StorageError> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        let mut dirty = index.dedup();

        let mut jobs = Vec::with_capacity(index.entries.len());
        let mut dangling = Vec::new();
        let mut blocked_by = None;
        for entry in &index.entries {
            match self.read_job(&entry.id).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => dangling.push(entry.id.clone()),
                Err(err @ StorageError::Corrupt { .. }) => {
                    tracing::error!(job_id = %entry.id, "undecodable outbox record: {err}");
                    blocked_by = Some(err);
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        if !dangling.is_empty() {
            tracing::warn!(count = dangling.len(), "dropping dangling ids from outbox index");
            index.entries.retain(|e| !dangling.contains(&e.id));
            dirty = true;
        }

        if dirty {
            if let Err(err) = self.store_index(&index).await {
                tracing::warn!("failed to heal outbox index: {err}");
            }
        }

        Ok(Pending { jobs, blocked_by })
    }

    /// Every queued job, oldest first.
    ///
    /// Fails with [`StorageError::Corrupt`] if any record cannot be decoded;
    /// use [`PersistentQueue::pending`] to get at the jobs ahead of it.
    pub async fn read_all(&self) -> Result<Vec<Job>, StorageError> {
        let pending = self.pending().await?;
        match pending.blocked_by {
            Some(err) => Err(err),
            None => Ok(pending.jobs),
        }
    }

    /// A single queued job.
    pub async fn get(&self, id: &JobId) -> Result<Option<Job>, StorageError> {
        let _guard = self.index_lock.lock().await;
        if !self.load_index().await?.contains(id) {
            return Ok(None);
        }
        self.read_job(id).await
    }

    /// Persist the attempt counter of `job`.
    ///
    /// Only writes if the job is still queued with the same idempotency key,
    /// so a job removed or replaced mid-flight is never resurrected or
    /// overwritten with a stale payload. Returns whether anything was written.
    pub async fn record_attempt(&self, job: &Job) -> Result<bool, StorageError> {
        let _guard = self.index_lock.lock().await;
        let Some(mut stored) = self.current(job).await? else {
            return Ok(false);
        };

        stored.tries = job.tries;
        self.write_job(&stored).await?;
        Ok(true)
    }

    /// Remove `job` after a delivery the server acknowledged.
    ///
    /// If the job was replaced in place since it was read (different
    /// idempotency key), the new content is still pending and stays queued.
    /// Returns whether the job was removed.
    pub async fn acknowledge(&self, job: &Job) -> Result<bool, StorageError> {
        let _guard = self.index_lock.lock().await;
        if self.current(job).await?.is_none() {
            tracing::info!(job_id = %job.id, "delivered job was replaced or removed meanwhile; keeping queue as is");
            return Ok(false);
        }
        self.remove_locked(&job.id).await?;
        Ok(true)
    }

    /// Delete a job by id. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: &JobId) -> Result<(), StorageError> {
        let _guard = self.index_lock.lock().await;
        self.remove_locked(id).await
    }

    /// Delete every queued job and the index.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.index_lock.lock().await;
        let index = self.load_index().await?;

        for entry in &index.entries {
            self.kv.delete(&job_key(&entry.id)).await?;
        }
        self.kv.delete(INDEX_KEY).await?;

        tracing::info!(removed = index.entries.len(), "outbox cleared");
        Ok(())
    }

    /// Number of queued jobs.
    pub async fn size(&self) -> Result<usize, StorageError> {
        Ok(self.live_index().await?.entries.len())
    }

    pub async fn meta(&self) -> Result<QueueMeta, StorageError> {
        let index = self.live_index().await?;
        Ok(QueueMeta {
            size: index.entries.len(),
            oldest: index.entries.iter().map(|e| e.created_at).min(),
            newest: index.entries.iter().map(|e| e.created_at).max(),
        })
    }

    // The index without duplicates or ids whose record is gone. Corrupt
    // records still count: they are queued, just not deliverable.
    async fn live_index(&self) -> Result<Index, StorageError> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        let mut dirty = index.dedup();

        let mut live = Vec::with_capacity(index.entries.len());
        for entry in index.entries.drain(..) {
            if self.kv.get(&job_key(&entry.id)).await?.is_some() {
                live.push(entry);
            } else {
                dirty = true;
            }
        }
        index.entries = live;

        if dirty {
            if let Err(err) = self.store_index(&index).await {
                tracing::warn!("failed to heal outbox index: {err}");
            }
        }
        Ok(index)
    }

    async fn remove_locked(&self, id: &JobId) -> Result<(), StorageError> {
        let mut index = self.load_index().await?;
        let before = index.entries.len();
        index.entries.retain(|e| &e.id != id);
        if index.entries.len() != before {
            self.store_index(&index).await?;
            tracing::debug!(job_id = %id, "job removed from outbox");
        }
        // Also cleans up an orphan record left by an interrupted write.
        self.kv.delete(&job_key(id)).await
    }

    // The stored record for `job`, if it is still queued with the same key.
    async fn current(&self, job: &Job) -> Result<Option<Job>, StorageError> {
        if !self.load_index().await?.contains(&job.id) {
            return Ok(None);
        }
        Ok(self
            .read_job(&job.id)
            .await?
            .filter(|stored| stored.idempotency_key == job.idempotency_key))
    }

    // Callers hold `index_lock`.
    async fn load_index(&self) -> Result<Index, StorageError> {
        let Some(raw) = self.kv.get(INDEX_KEY).await? else {
            return Ok(Index::default());
        };
        match serde_json::from_str(&raw) {
            Ok(index) => Ok(index),
            Err(err) => {
                self.quarantine_index(raw, &err).await?;
                Ok(Index::default())
            }
        }
    }

    // Keep the unreadable index for inspection and start over empty. Records
    // it pointed to stay in storage.
    async fn quarantine_index(&self, raw: String, err: &serde_json::Error) -> Result<(), StorageError> {
        let key = format!("{INDEX_QUARANTINE_PREFIX}{}", Utc::now().timestamp_millis());
        tracing::warn!(quarantine_key = %key, "outbox index is corrupt, starting a new one: {err}");
        self.kv.set(&key, raw).await?;
        self.kv.delete(INDEX_KEY).await
    }

    async fn store_index(&self, index: &Index) -> Result<(), StorageError> {
        let raw = serde_json::to_string(index).map_err(|err| StorageError::Encode {
            key: INDEX_KEY.to_string(),
            reason: err.to_string(),
        })?;
        self.kv.set(INDEX_KEY, raw).await
    }

    async fn read_job(&self, id: &JobId) -> Result<Option<Job>, StorageError> {
        let key = job_key(id);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| StorageError::Corrupt {
                key,
                reason: err.to_string(),
            })
    }

    async fn write_job(&self, job: &Job) -> Result<(), StorageError> {
        let key = job_key(&job.id);
        let raw = serde_json::to_string(job).map_err(|err| StorageError::Encode {
            key: key.clone(),
            reason: err.to_string(),
        })?;
        self.kv.set(&key, raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;
    use std::sync::Arc;

    fn queue() -> (Arc<MemoryKv>, PersistentQueue<Arc<MemoryKv>>) {
        let kv = Arc::new(MemoryKv::new());
        (kv.clone(), PersistentQueue::new(kv))
    }

    fn job(id: &str, n: i64) -> NewJob {
        NewJob::new(json!({"resourceType": "Bundle", "n": n})).with_id(JobId::parse(id).unwrap())
    }

    fn ids(jobs: &[Job]) -> Vec<&str> {
        jobs.iter().map(|j| j.id.as_str()).collect()
    }

    #[tokio::test]
    async fn read_all_is_fifo() {
        let (_, q) = queue();
        for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
            q.enqueue(job(id, i as i64)).await.unwrap();
        }

        let jobs = q.read_all().await.unwrap();
        assert_eq!(ids(&jobs), ["a", "b", "c"]);
        assert_eq!(q.size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn enqueue_rejects_non_object_payload_without_writing() {
        let (kv, q) = queue();
        let err = q.enqueue(NewJob::new(json!([1, 2, 3]))).await.unwrap_err();

        assert!(matches!(err, QueueError::Validation(_)));
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn enqueue_existing_id_updates_in_place() {
        let (_, q) = queue();
        let first = q.enqueue(job("a", 1)).await.unwrap();
        q.enqueue(job("b", 2)).await.unwrap();

        let mut tried = first.clone();
        tried.tries = 3;
        q.record_attempt(&tried).await.unwrap();

        let replaced = q.enqueue(job("a", 10)).await.unwrap();
        let jobs = q.read_all().await.unwrap();

        assert_eq!(ids(&jobs), ["a", "b"]);
        assert_eq!(jobs[0].payload["n"], 10);
        assert_eq!(jobs[0].created_at, first.created_at);
        assert_eq!(jobs[0].tries, 0);
        assert_ne!(replaced.idempotency_key, first.idempotency_key);
    }

    #[tokio::test]
    async fn read_all_drops_dangling_ids() {
        let (kv, q) = queue();
        for id in ["a", "b", "c"] {
            q.enqueue(job(id, 0)).await.unwrap();
        }
        kv.delete(&job_key(&JobId::parse("b").unwrap())).await.unwrap();

        let jobs = q.read_all().await.unwrap();
        assert_eq!(ids(&jobs), ["a", "c"]);
        assert_eq!(q.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_index_entries_are_collapsed() {
        let (kv, q) = queue();
        q.enqueue(job("a", 0)).await.unwrap();
        let a = q.read_all().await.unwrap().remove(0);

        let raw = json!({"entries": [
            {"id": "a", "created_at": a.created_at},
            {"id": "a", "created_at": a.created_at}
        ]});
        kv.set(INDEX_KEY, raw.to_string()).await.unwrap();

        assert_eq!(q.size().await.unwrap(), 1);
        assert_eq!(ids(&q.read_all().await.unwrap()), ["a"]);
    }

    #[tokio::test]
    async fn corrupt_record_blocks_only_what_follows_it() {
        let (kv, q) = queue();
        for id in ["a", "b", "c"] {
            q.enqueue(job(id, 0)).await.unwrap();
        }
        let key = job_key(&JobId::parse("b").unwrap());
        kv.set(&key, "{not json".into()).await.unwrap();

        let pending = q.pending().await.unwrap();
        assert_eq!(ids(&pending.jobs), ["a"]);
        assert!(matches!(pending.blocked_by, Some(StorageError::Corrupt { key: ref k, .. }) if *k == key));

        let err = q.read_all().await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { key: k, .. } if k == key));

        // Nothing is dropped: the bad record and everything behind it stay queued.
        assert_eq!(kv.get(&key).await.unwrap().as_deref(), Some("{not json"));
        assert_eq!(q.size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn corrupt_index_is_quarantined_and_queue_keeps_working() {
        let (kv, q) = queue();
        kv.set(INDEX_KEY, "{garbage".into()).await.unwrap();

        q.enqueue(job("a", 0)).await.unwrap();
        q.enqueue(job("b", 1)).await.unwrap();

        assert_eq!(ids(&q.read_all().await.unwrap()), ["a", "b"]);
        let quarantined: Vec<String> = kv
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(INDEX_QUARANTINE_PREFIX))
            .collect();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(kv.get(&quarantined[0]).await.unwrap().as_deref(), Some("{garbage"));
    }

    #[tokio::test]
    async fn index_with_unusable_id_is_quarantined() {
        let (kv, q) = queue();
        let raw = json!({"entries": [{"id": "../escape", "created_at": Utc::now()}]});
        kv.set(INDEX_KEY, raw.to_string()).await.unwrap();

        assert_eq!(q.size().await.unwrap(), 0);
        assert!(kv.keys().iter().any(|k| k.starts_with(INDEX_QUARANTINE_PREFIX)));
    }

    #[tokio::test]
    async fn size_ignores_ids_without_record() {
        let (kv, q) = queue();
        for id in ["a", "b", "c"] {
            q.enqueue(job(id, 0)).await.unwrap();
        }
        kv.delete(&job_key(&JobId::parse("c").unwrap())).await.unwrap();

        assert_eq!(q.size().await.unwrap(), 2);
        let meta = q.meta().await.unwrap();
        assert_eq!(meta.size, 2);
        assert_eq!(meta.newest, q.get(&JobId::parse("b").unwrap()).await.unwrap().map(|j| j.created_at));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (kv, q) = queue();
        q.enqueue(job("a", 0)).await.unwrap();
        let id = JobId::parse("a").unwrap();

        q.remove(&id).await.unwrap();
        q.remove(&id).await.unwrap();
        q.remove(&JobId::parse("never").unwrap()).await.unwrap();

        assert_eq!(q.size().await.unwrap(), 0);
        assert_eq!(kv.keys(), [INDEX_KEY]);
    }

    #[tokio::test]
    async fn record_attempt_does_not_resurrect_removed_job() {
        let (kv, q) = queue();
        let mut a = q.enqueue(job("a", 0)).await.unwrap();
        q.remove(&a.id).await.unwrap();

        a.tries = 1;
        assert!(!q.record_attempt(&a).await.unwrap());
        assert_eq!(kv.get(&job_key(&a.id)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn acknowledge_keeps_job_replaced_mid_flight() {
        let (_, q) = queue();
        let in_flight = q.enqueue(job("a", 1)).await.unwrap();
        q.enqueue(job("a", 2)).await.unwrap();

        assert!(!q.acknowledge(&in_flight).await.unwrap());
        let jobs = q.read_all().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload["n"], 2);

        assert!(q.acknowledge(&jobs[0]).await.unwrap());
        assert_eq!(q.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let (kv, q) = queue();
        for id in ["a", "b"] {
            q.enqueue(job(id, 0)).await.unwrap();
        }
        q.clear().await.unwrap();

        assert_eq!(q.size().await.unwrap(), 0);
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn meta_reports_oldest_and_newest() {
        let (_, q) = queue();
        assert_eq!(q.meta().await.unwrap(), QueueMeta::default());

        let a = q.enqueue(job("a", 0)).await.unwrap();
        let b = q.enqueue(job("b", 0)).await.unwrap();
        let meta = q.meta().await.unwrap();

        assert_eq!(meta.size, 2);
        assert_eq!(meta.oldest, Some(a.created_at));
        assert_eq!(meta.newest, Some(b.created_at));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_are_all_kept() {
        let (_, q) = queue();
        let q = Arc::new(q);

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let q = q.clone();
                tokio::spawn(async move { q.enqueue(job(&format!("j{i}"), i)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(q.size().await.unwrap(), 50);
        assert_eq!(q.read_all().await.unwrap().len(), 50);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 32,
                ..ProptestConfig::default()
            })]

            /// Property: whatever subset is removed, the rest keep enqueue order.
            #[test]
            fn removals_preserve_relative_order(
                count in 1usize..20,
                removed in prop::collection::vec(any::<bool>(), 20),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                let (kept, actual) = rt.block_on(async {
                    let (_, q) = queue();
                    let mut kept = Vec::new();
                    for i in 0..count {
                        q.enqueue(job(&format!("j{i}"), i as i64)).await.unwrap();
                    }
                    for i in 0..count {
                        let id = JobId::parse(format!("j{i}")).unwrap();
                        if removed[i] {
                            q.remove(&id).await.unwrap();
                        } else {
                            kept.push(id);
                        }
                    }
                    let actual: Vec<JobId> =
                        q.read_all().await.unwrap().into_iter().map(|j| j.id).collect();
                    (kept, actual)
                });
                prop_assert_eq!(kept, actual);
            }
        }
    }
}
