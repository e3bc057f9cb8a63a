//! The application-facing outbox: queue, coordinator and connectivity in one.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use wardsync_core::{Job, JobId, JobMetadata, NewJob};
use wardsync_queue::{
    DEFAULT_LOG_CAPACITY, KeyValueStore, LogEntry, MemoryLog, PersistentQueue, QueueError, QueueMeta,
    SqliteKv, SqliteLog, StorageError, SyncLog, default_db_path,
};

use crate::auth::TokenProvider;
use crate::backoff::BackoffPolicy;
use crate::config::SyncConfig;
use crate::connectivity::NetworkObserver;
use crate::coordinator::{FlushCoordinator, FlushReport, TriggerSource};
use crate::daemon::{self, DaemonHandle, DaemonOptions};
use crate::submission::{HttpSubmitter, Submitter};

/// Result of [`Outbox::submit_or_enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The job was delivered and has left the queue.
    Sent(Job),
    /// The job is stored and will be delivered by a later flush.
    Queued {
        job: Job,
        /// The flush that was attempted, if the device was online.
        report: Option<FlushReport>,
    },
}

impl Delivery {
    pub fn job(&self) -> &Job {
        match self {
            Delivery::Sent(job) | Delivery::Queued { job, .. } => job,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent(_))
    }
}

/// Durable outbox for clinical bundles.
pub struct Outbox<K, S> {
    queue: Arc<PersistentQueue<K>>,
    coordinator: FlushCoordinator<K, S>,
    network: Arc<dyn NetworkObserver>,
    log: Arc<dyn SyncLog>,
}

impl<K, S> Outbox<K, S>
where
    K: KeyValueStore + 'static,
    S: Submitter + 'static,
{
    /// Outbox whose flush history is kept in memory only.
    pub fn new(kv: K, submitter: S, backoff: BackoffPolicy, network: Arc<dyn NetworkObserver>) -> Self {
        Self::with_log(kv, submitter, backoff, network, Arc::new(MemoryLog::default()))
    }

    pub fn with_log(
        kv: K,
        submitter: S,
        backoff: BackoffPolicy,
        network: Arc<dyn NetworkObserver>,
        log: Arc<dyn SyncLog>,
    ) -> Self {
        let queue = Arc::new(PersistentQueue::new(kv));
        let coordinator = FlushCoordinator::with_log(queue.clone(), submitter, backoff, log.clone());
        Self {
            queue,
            coordinator,
            network,
            log,
        }
    }

    pub fn queue(&self) -> &Arc<PersistentQueue<K>> {
        &self.queue
    }

    pub fn coordinator(&self) -> &FlushCoordinator<K, S> {
        &self.coordinator
    }

    /// Store a bundle for delivery.
    pub async fn enqueue(&self, payload: Value, metadata: JobMetadata) -> Result<Job, QueueError> {
        self.enqueue_job(NewJob {
            metadata,
            ..NewJob::new(payload)
        })
        .await
    }

    pub async fn enqueue_job(&self, job: NewJob) -> Result<Job, QueueError> {
        self.queue.enqueue(job).await
    }

    /// Enqueue, then flush right away when online.
    ///
    /// The job is persisted before any network activity, so nothing is lost
    /// if the process dies mid-request.
    pub async fn submit_or_enqueue(&self, job: NewJob) -> Result<Delivery, QueueError> {
        let job = self.queue.enqueue(job).await?;

        if !self.is_online() {
            tracing::info!(job_id = %job.id, "offline, job queued");
            return Ok(Delivery::Queued { job, report: None });
        }

        let report = self.coordinator.trigger(TriggerSource::Manual).await;
        if self.queue.get(&job.id).await?.is_none() {
            Ok(Delivery::Sent(job))
        } else {
            Ok(Delivery::Queued {
                job,
                report: Some(report),
            })
        }
    }

    pub async fn size(&self) -> Result<usize, StorageError> {
        self.queue.size().await
    }

    pub async fn meta(&self) -> Result<QueueMeta, StorageError> {
        self.queue.meta().await
    }

    /// "Retry now".
    pub async fn trigger_flush(&self) -> FlushReport {
        self.coordinator.trigger_flush().await
    }

    /// Call after the user signed in again following an auth failure.
    pub async fn resume_after_sign_in(&self) -> FlushReport {
        self.coordinator.resume_after_sign_in().await
    }

    pub fn on_sent(&self, hook: impl Fn(&Job) + Send + Sync + 'static) {
        self.coordinator.on_sent(hook);
    }

    /// Recent flush history, newest first.
    pub async fn logs(&self, limit: usize) -> Result<Vec<LogEntry>, StorageError> {
        self.log.recent(limit).await
    }

    pub async fn clear_logs(&self) -> Result<(), StorageError> {
        self.log.clear().await
    }

    /// Discard a queued job (e.g. a draft the user deleted).
    pub async fn remove(&self, id: &JobId) -> Result<(), StorageError> {
        self.queue.remove(id).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.queue.clear().await
    }

    /// Start background flushing driven by this outbox's network observer.
    pub fn start_daemon(&self, options: DaemonOptions) -> DaemonHandle {
        daemon::start_daemon(self.coordinator.clone(), self.network.as_ref(), options)
    }

    fn is_online(&self) -> bool {
        self.network.subscribe().borrow().is_online()
    }
}

impl<T> Outbox<SqliteKv, HttpSubmitter<T>>
where
    T: TokenProvider + 'static,
{
    /// Open the SQLite-backed outbox described by `config`.
    pub async fn open(
        config: &SyncConfig,
        tokens: T,
        network: Arc<dyn NetworkObserver>,
    ) -> anyhow::Result<Self> {
        let path = match &config.db_path {
            Some(path) => path.clone(),
            None => default_db_path()?,
        };
        let kv = SqliteKv::open(&path).await?;
        let log = SqliteLog::attach(&kv, DEFAULT_LOG_CAPACITY).await?;
        let submitter = HttpSubmitter::new(config.base_url.clone(), tokens, config.request_timeout)
            .context("failed to build HTTP client")?;

        tracing::info!(db_path = %path.display(), endpoint = submitter.endpoint(), "outbox opened");
        Ok(Self::with_log(kv, submitter, config.backoff, network, Arc::new(log)))
    }
}
