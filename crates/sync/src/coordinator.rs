//! Flush coordinator: drains the outbox in order, one job at a time.
//!
//! A flush episode reads the queue once and walks it oldest first. Each job is
//! delivered through the backoff policy (only retryable outcomes are retried).
//! A delivered job is removed and the walk continues; anything else stops the
//! episode so that no later job overtakes an earlier one.
//!
//! Triggers that arrive while an episode runs join it instead of starting a
//! second one. The episode runs on its own task, so it completes even if every
//! caller waiting on it goes away.
//!
//! Besides tracing, each episode can be written to a [`SyncLog`]: start, every
//! delivered or duplicate job, the stop reason and the final counts.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use wardsync_core::{Job, JobId};
use wardsync_queue::{KeyValueStore, LogEntry, LogEvent, Pending, PersistentQueue, SyncLog};

use crate::backoff::BackoffPolicy;
use crate::submission::{Outcome, Submitter};

type Episode = Shared<BoxFuture<'static, FlushReport>>;

/// Callback run for every job that left the queue after delivery.
pub type SentHook = Arc<dyn Fn(&Job) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlushState {
    Idle,
    Flushing,
}

/// What asked for a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Startup,
    Connectivity,
    Manual,
    Timer,
}

impl TriggerSource {
    /// Automatic triggers are skipped while sign-in is required.
    pub fn is_automatic(self) -> bool {
        !matches!(self, TriggerSource::Manual)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Startup => "startup",
            TriggerSource::Connectivity => "connectivity",
            TriggerSource::Manual => "manual",
            TriggerSource::Timer => "timer",
        }
    }
}

/// Why an episode ended before the queue was empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The user has to sign in again.
    AuthExpired,
    /// Retries exhausted; the next trigger tries again.
    Retryable { detail: String },
    /// The server rejected a job; it blocks the queue until removed.
    Fatal { job_id: JobId, status: Option<u16> },
    Storage { detail: String },
    /// The flush task itself failed.
    Aborted { detail: String },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::AuthExpired => f.write_str("sign-in required"),
            StopReason::Retryable { detail } => write!(f, "delivery failed: {detail}"),
            StopReason::Fatal {
                job_id,
                status: Some(status),
            } => write!(f, "server rejected job {job_id} (HTTP {status})"),
            StopReason::Fatal { job_id, status: None } => write!(f, "job {job_id} cannot be sent"),
            StopReason::Storage { detail } => write!(f, "storage error: {detail}"),
            StopReason::Aborted { detail } => write!(f, "flush aborted: {detail}"),
        }
    }
}

/// Result of one flush episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub processed: usize,
    pub remaining: usize,
    pub stopped: Option<StopReason>,
}

impl FlushReport {
    pub fn is_drained(&self) -> bool {
        self.stopped.is_none() && self.remaining == 0
    }
}

/// Drives delivery of the queue. Cheap to clone; clones share state.
pub struct FlushCoordinator<K, S> {
    inner: Arc<Inner<K, S>>,
}

impl<K, S> Clone for FlushCoordinator<K, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<K, S> {
    queue: Arc<PersistentQueue<K>>,
    submitter: S,
    backoff: BackoffPolicy,
    in_flight: Mutex<Option<Episode>>,
    auth_blocked: AtomicBool,
    hooks: RwLock<Vec<SentHook>>,
    log: Option<Arc<dyn SyncLog>>,
}

impl<K, S> FlushCoordinator<K, S>
where
    K: KeyValueStore + 'static,
    S: Submitter + 'static,
{
    pub fn new(queue: Arc<PersistentQueue<K>>, submitter: S, backoff: BackoffPolicy) -> Self {
        Self::build(queue, submitter, backoff, None)
    }

    /// Like [`FlushCoordinator::new`], also recording every episode in `log`.
    pub fn with_log(
        queue: Arc<PersistentQueue<K>>,
        submitter: S,
        backoff: BackoffPolicy,
        log: Arc<dyn SyncLog>,
    ) -> Self {
        Self::build(queue, submitter, backoff, Some(log))
    }

    fn build(
        queue: Arc<PersistentQueue<K>>,
        submitter: S,
        backoff: BackoffPolicy,
        log: Option<Arc<dyn SyncLog>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                submitter,
                backoff,
                in_flight: Mutex::new(None),
                auth_blocked: AtomicBool::new(false),
                hooks: RwLock::new(Vec::new()),
                log,
            }),
        }
    }

    pub fn queue(&self) -> &Arc<PersistentQueue<K>> {
        &self.inner.queue
    }

    pub fn state(&self) -> FlushState {
        if lock(&self.inner.in_flight).is_some() {
            FlushState::Flushing
        } else {
            FlushState::Idle
        }
    }

    /// True after the server (or the token source) asked for a new sign-in.
    pub fn is_auth_blocked(&self) -> bool {
        self.inner.auth_blocked.load(Ordering::SeqCst)
    }

    /// Register a callback run once for every delivered job, after removal.
    pub fn on_sent(&self, hook: impl Fn(&Job) + Send + Sync + 'static) {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Flush now on behalf of the user ("retry now").
    pub async fn trigger_flush(&self) -> FlushReport {
        self.trigger(TriggerSource::Manual).await
    }

    /// Start a flush episode, or join the one already running.
    pub async fn trigger(&self, source: TriggerSource) -> FlushReport {
        if source.is_automatic() && self.is_auth_blocked() {
            return self.inner.skipped(source).await;
        }
        self.join_or_start(source).await
    }

    /// Lift the sign-in block and flush.
    pub async fn resume_after_sign_in(&self) -> FlushReport {
        if self.inner.auth_blocked.swap(false, Ordering::SeqCst) {
            tracing::info!("sign-in reported, resuming automatic flushes");
        }
        self.trigger(TriggerSource::Manual).await
    }

    fn join_or_start(&self, source: TriggerSource) -> Episode {
        let mut slot = lock(&self.inner.in_flight);
        if let Some(episode) = slot.as_ref() {
            tracing::debug!(source = ?source, "flush already running, joining it");
            return episode.clone();
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let _reset = ResetOnDrop(&inner.in_flight);
            inner.drain(source).await
        });

        let episode = async move {
            task.await.unwrap_or_else(|err| {
                tracing::error!("flush task failed: {err}");
                FlushReport {
                    processed: 0,
                    remaining: 0,
                    stopped: Some(StopReason::Aborted {
                        detail: err.to_string(),
                    }),
                }
            })
        }
        .boxed()
        .shared();

        *slot = Some(episode.clone());
        episode
    }
}

impl<K, S> Inner<K, S>
where
    K: KeyValueStore,
    S: Submitter,
{
    async fn drain(&self, source: TriggerSource) -> FlushReport {
        let Pending { jobs, blocked_by } = match self.queue.pending().await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::error!(event = "flush.stop", source = ?source, "failed to read outbox: {err}");
                let reason = StopReason::Storage {
                    detail: err.to_string(),
                };
                self.record(LogEntry::new(LogEvent::FlushStop, reason.to_string())).await;
                return FlushReport {
                    processed: 0,
                    remaining: self.queue.size().await.unwrap_or(0),
                    stopped: Some(reason),
                };
            }
        };

        let queued = jobs.len();
        tracing::info!(
            event = "flush.start",
            source = ?source,
            queued,
            blocked = blocked_by.is_some(),
            "flush started"
        );
        self.record(LogEntry::new(
            LogEvent::FlushStart,
            format!("{} flush, {queued} ready", source.as_str()),
        ))
        .await;

        let mut processed = 0;
        let mut stopped = None;
        for mut job in jobs {
            job.tries += 1;
            if let Err(err) = self.queue.record_attempt(&job).await {
                tracing::warn!(job_id = %job.id, "failed to persist attempt count: {err}");
            }

            let outcome = self.deliver(&job).await;
            match self.settle(&job, outcome).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(reason) => {
                    stopped = Some(reason);
                    break;
                }
            }
        }

        // The readable head is through; an undecodable record is next.
        if stopped.is_none() {
            if let Some(err) = blocked_by {
                tracing::error!(event = "flush.stop", "outbox record cannot be decoded: {err}");
                let reason = StopReason::Storage {
                    detail: err.to_string(),
                };
                self.record(LogEntry::new(LogEvent::FlushStop, reason.to_string())).await;
                stopped = Some(reason);
            }
        }

        let remaining = match self.queue.size().await {
            Ok(size) => size,
            Err(_) => queued - processed,
        };
        tracing::info!(
            event = "flush.finish",
            processed,
            remaining,
            stopped = stopped.is_some(),
            "flush finished"
        );
        self.record(LogEntry::new(
            LogEvent::FlushFinish,
            format!("processed {processed}, remaining {remaining}"),
        ))
        .await;

        FlushReport {
            processed,
            remaining,
            stopped,
        }
    }

    async fn deliver(&self, job: &Job) -> Outcome {
        let submitter = &self.submitter;
        self.backoff
            .retry(|attempt| async move {
                tracing::debug!(job_id = %job.id, attempt, tries = job.tries, "submitting job");
                match submitter.submit(job).await {
                    Outcome::Retryable(reason) => Err(reason),
                    outcome => Ok(outcome),
                }
            })
            .await
            .unwrap_or_else(Outcome::Retryable)
    }

    // Ok(removed) lets the walk continue; Err stops the episode.
    async fn settle(&self, job: &Job, outcome: Outcome) -> Result<bool, StopReason> {
        match outcome {
            Outcome::Success { status } => self.delivered(job, status, false).await,
            Outcome::DuplicateSkip { status } => self.delivered(job, status, true).await,
            Outcome::AuthExpired { status } => {
                self.auth_blocked.store(true, Ordering::SeqCst);
                tracing::warn!(
                    event = "flush.stop",
                    job_id = %job.id,
                    status = ?status,
                    "sign-in required, pausing automatic flushes"
                );
                let message = match status {
                    Some(status) => format!("sign-in required (HTTP {status})"),
                    None => "sign-in required (no token)".to_string(),
                };
                self.record(LogEntry::new(LogEvent::FlushStop, message).with_job(&job.id))
                    .await;
                Err(StopReason::AuthExpired)
            }
            Outcome::Retryable(reason) => {
                tracing::warn!(event = "flush.stop", job_id = %job.id, tries = job.tries, "delivery failed: {reason}");
                let reason = StopReason::Retryable {
                    detail: reason.to_string(),
                };
                self.record(LogEntry::new(LogEvent::FlushStop, reason.to_string()).with_job(&job.id))
                    .await;
                Err(reason)
            }
            Outcome::Fatal { status, body } => {
                tracing::error!(
                    event = "flush.stop",
                    job_id = %job.id,
                    status = ?status,
                    body = %body,
                    "server rejected job"
                );
                let reason = StopReason::Fatal {
                    job_id: job.id.clone(),
                    status,
                };
                let message = if body.is_empty() {
                    reason.to_string()
                } else {
                    format!("{reason}: {body}")
                };
                self.record(LogEntry::new(LogEvent::FlushStop, message).with_job(&job.id))
                    .await;
                Err(reason)
            }
        }
    }

    async fn delivered(&self, job: &Job, status: u16, duplicate: bool) -> Result<bool, StopReason> {
        // The server accepted our credentials.
        self.auth_blocked.store(false, Ordering::SeqCst);

        let removed = match self.queue.acknowledge(job).await {
            Ok(removed) => removed,
            Err(err) => {
                tracing::error!(event = "flush.stop", job_id = %job.id, "failed to remove delivered job: {err}");
                let reason = StopReason::Storage {
                    detail: err.to_string(),
                };
                self.record(LogEntry::new(LogEvent::FlushStop, reason.to_string()).with_job(&job.id))
                    .await;
                return Err(reason);
            }
        };

        let entry = if duplicate {
            tracing::info!(event = "flush.job.duplicate", job_id = %job.id, status, "server already had job");
            LogEntry::new(LogEvent::JobDuplicate, format!("HTTP {status}, already on the server"))
        } else {
            tracing::info!(event = "flush.job.sent", job_id = %job.id, status, tries = job.tries, "job delivered");
            LogEntry::new(LogEvent::JobSent, format!("HTTP {status}, attempt {}", job.tries))
        };
        self.record(entry.with_job(&job.id)).await;

        if removed {
            let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner).clone();
            for hook in hooks {
                hook(job);
            }
        }
        Ok(removed)
    }

    // Best effort: a full or broken log never stops delivery.
    async fn record(&self, entry: LogEntry) {
        let Some(log) = &self.log else {
            return;
        };
        if let Err(err) = log.append(entry).await {
            tracing::warn!("failed to write sync log: {err}");
        }
    }

    async fn skipped(&self, source: TriggerSource) -> FlushReport {
        tracing::debug!(source = ?source, "automatic flush skipped until sign-in");
        FlushReport {
            processed: 0,
            remaining: self.queue.size().await.unwrap_or(0),
            stopped: Some(StopReason::AuthExpired),
        }
    }
}

struct ResetOnDrop<'a>(&'a Mutex<Option<Episode>>);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::RetryReason;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use wardsync_core::NewJob;
    use wardsync_queue::store::job_key;
    use wardsync_queue::{MemoryKv, MemoryLog, StorageError};

    /// Answers per job id; the last scripted answer repeats. Unscripted
    /// jobs succeed with 200.
    #[derive(Default)]
    struct ScriptedSubmitter {
        script: std::sync::Mutex<HashMap<String, VecDeque<Outcome>>>,
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedSubmitter {
        fn respond(&self, id: &str, outcomes: impl IntoIterator<Item = Outcome>) {
            self.script
                .lock()
                .unwrap()
                .insert(id.to_string(), outcomes.into_iter().collect());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Submitter for ScriptedSubmitter {
        async fn submit(&self, job: &Job) -> Outcome {
            self.calls.lock().unwrap().push(job.id.to_string());
            let mut script = self.script.lock().unwrap();
            match script.get_mut(job.id.as_str()) {
                Some(answers) if answers.len() > 1 => answers.pop_front().unwrap(),
                Some(answers) => answers.front().cloned().unwrap(),
                None => Outcome::Success { status: 200 },
            }
        }
    }

    /// Blocks every submission until a permit is released.
    struct GatedSubmitter {
        gate: Semaphore,
        calls: AtomicUsize,
    }

    impl GatedSubmitter {
        fn closed() -> Self {
            Self {
                gate: Semaphore::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Submitter for GatedSubmitter {
        async fn submit(&self, _job: &Job) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            Outcome::Success { status: 201 }
        }
    }

    /// Memory store whose reads or writes can be made to fail.
    #[derive(Default)]
    struct FlakyKv {
        inner: MemoryKv,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FlakyKv {
        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("disk unavailable".into()));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("disk full".into()));
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("disk full".into()));
            }
            self.inner.delete(key).await
        }
    }

    async fn queue_with<K: KeyValueStore>(kv: K, ids: &[&str]) -> Arc<PersistentQueue<K>> {
        let queue = Arc::new(PersistentQueue::new(kv));
        for id in ids {
            queue
                .enqueue(NewJob::new(json!({"resourceType": "Bundle", "id": id})).with_id(JobId::parse(*id).unwrap()))
                .await
                .unwrap();
        }
        queue
    }

    async fn queued_ids<K: KeyValueStore>(queue: &PersistentQueue<K>) -> Vec<String> {
        queue
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id.to_string())
            .collect()
    }

    fn id(raw: &str) -> JobId {
        JobId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn stops_at_first_failure_preserving_order() {
        let queue = queue_with(MemoryKv::new(), &["A", "B", "C", "D"]).await;
        let submitter = Arc::new(ScriptedSubmitter::default());
        submitter.respond("A", [Outcome::Success { status: 200 }]);
        submitter.respond("B", [Outcome::DuplicateSkip { status: 412 }]);
        submitter.respond("C", [Outcome::Retryable(RetryReason::Status(500))]);

        let coordinator = FlushCoordinator::new(queue.clone(), submitter.clone(), BackoffPolicy::no_retry());
        let report = coordinator.trigger_flush().await;

        assert_eq!(report.processed, 2);
        assert_eq!(report.remaining, 2);
        assert_eq!(
            report.stopped,
            Some(StopReason::Retryable {
                detail: "HTTP 500".into()
            })
        );
        assert_eq!(submitter.calls(), ["A", "B", "C"]);
        assert_eq!(queued_ids(&queue).await, ["C", "D"]);
    }

    #[tokio::test]
    async fn empty_queue_reports_nothing_to_do() {
        let queue = queue_with(MemoryKv::new(), &[]).await;
        let coordinator = FlushCoordinator::new(queue, ScriptedSubmitter::default(), BackoffPolicy::no_retry());

        let report = coordinator.trigger(TriggerSource::Startup).await;
        assert!(report.is_drained());
        assert_eq!(report.processed, 0);
        assert_eq!(coordinator.state(), FlushState::Idle);
    }

    #[tokio::test]
    async fn concurrent_triggers_share_one_episode() {
        let queue = queue_with(MemoryKv::new(), &["a", "b"]).await;
        let submitter = Arc::new(GatedSubmitter::closed());
        let coordinator = FlushCoordinator::new(queue.clone(), submitter.clone(), BackoffPolicy::no_retry());

        let (first, second, ()) = tokio::join!(
            coordinator.trigger(TriggerSource::Connectivity),
            coordinator.trigger_flush(),
            async { submitter.gate.add_permits(2) },
        );

        assert_eq!(first, second);
        assert_eq!(first.processed, 2);
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.state(), FlushState::Idle);

        // A trigger after the episode ended starts a fresh one.
        let again = coordinator.trigger(TriggerSource::Timer).await;
        assert_eq!(again.processed, 0);
        assert!(again.is_drained());
    }

    #[tokio::test]
    async fn episode_survives_dropped_waiter() {
        let queue = queue_with(MemoryKv::new(), &["a"]).await;
        let submitter = Arc::new(GatedSubmitter::closed());
        let coordinator = FlushCoordinator::new(queue.clone(), submitter.clone(), BackoffPolicy::no_retry());

        let waiter = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.trigger_flush().await }
        });
        while submitter.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        submitter.gate.add_permits(1);

        while coordinator.state() == FlushState::Flushing {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_outcomes_go_through_backoff() {
        let queue = queue_with(MemoryKv::new(), &["a", "b"]).await;
        let submitter = Arc::new(ScriptedSubmitter::default());
        submitter.respond(
            "a",
            [
                Outcome::Retryable(RetryReason::Status(503)),
                Outcome::Retryable(RetryReason::Timeout),
                Outcome::Success { status: 201 },
            ],
        );
        let policy = BackoffPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(1));
        let coordinator = FlushCoordinator::new(queue.clone(), submitter.clone(), policy);

        let report = coordinator.trigger_flush().await;

        assert!(report.is_drained());
        assert_eq!(report.processed, 2);
        assert_eq!(submitter.calls(), ["a", "a", "a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_keep_job_and_count_tries() {
        let queue = queue_with(MemoryKv::new(), &["a"]).await;
        let submitter = Arc::new(ScriptedSubmitter::default());
        submitter.respond("a", [Outcome::Retryable(RetryReason::Timeout)]);
        let policy = BackoffPolicy::exponential(2, Duration::from_millis(10), Duration::from_millis(10));
        let coordinator = FlushCoordinator::new(queue.clone(), submitter.clone(), policy);

        let report = coordinator.trigger_flush().await;
        assert_eq!(
            report.stopped,
            Some(StopReason::Retryable {
                detail: "request timed out".into()
            })
        );
        assert_eq!(submitter.calls().len(), 3);
        assert_eq!(queue.get(&id("a")).await.unwrap().unwrap().tries, 1);

        coordinator.trigger(TriggerSource::Timer).await;
        assert_eq!(queue.get(&id("a")).await.unwrap().unwrap().tries, 2);
    }

    #[tokio::test]
    async fn fatal_job_blocks_the_queue() {
        let queue = queue_with(MemoryKv::new(), &["a", "b", "c"]).await;
        let submitter = Arc::new(ScriptedSubmitter::default());
        submitter.respond(
            "b",
            [Outcome::Fatal {
                status: Some(422),
                body: "invalid bundle".into(),
            }],
        );
        let coordinator = FlushCoordinator::new(queue.clone(), submitter.clone(), BackoffPolicy::default());

        let report = coordinator.trigger_flush().await;

        assert_eq!(report.processed, 1);
        assert_eq!(
            report.stopped,
            Some(StopReason::Fatal {
                job_id: id("b"),
                status: Some(422)
            })
        );
        // Fatal outcomes are never retried.
        assert_eq!(submitter.calls(), ["a", "b"]);
        assert_eq!(queued_ids(&queue).await, ["b", "c"]);
    }

    #[tokio::test]
    async fn auth_expiry_pauses_automatic_triggers_until_sign_in() {
        let queue = queue_with(MemoryKv::new(), &["a"]).await;
        let submitter = Arc::new(ScriptedSubmitter::default());
        submitter.respond(
            "a",
            [
                Outcome::AuthExpired { status: Some(401) },
                Outcome::Success { status: 200 },
            ],
        );
        let coordinator = FlushCoordinator::new(queue.clone(), submitter.clone(), BackoffPolicy::default());

        let report = coordinator.trigger(TriggerSource::Connectivity).await;
        assert_eq!(report.stopped, Some(StopReason::AuthExpired));
        assert_eq!(report.remaining, 1);
        assert!(coordinator.is_auth_blocked());

        let skipped = coordinator.trigger(TriggerSource::Timer).await;
        assert_eq!(skipped.stopped, Some(StopReason::AuthExpired));
        assert_eq!(submitter.calls().len(), 1);

        let resumed = coordinator.resume_after_sign_in().await;
        assert!(resumed.is_drained());
        assert_eq!(resumed.processed, 1);
        assert!(!coordinator.is_auth_blocked());
    }

    #[tokio::test]
    async fn manual_trigger_runs_while_auth_blocked() {
        let queue = queue_with(MemoryKv::new(), &["a"]).await;
        let submitter = Arc::new(ScriptedSubmitter::default());
        submitter.respond(
            "a",
            [
                Outcome::AuthExpired { status: None },
                Outcome::Success { status: 200 },
            ],
        );
        let coordinator = FlushCoordinator::new(queue.clone(), submitter.clone(), BackoffPolicy::default());

        coordinator.trigger(TriggerSource::Startup).await;
        assert!(coordinator.is_auth_blocked());

        let report = coordinator.trigger_flush().await;
        assert_eq!(report.processed, 1);
        assert!(!coordinator.is_auth_blocked());
    }

    #[tokio::test]
    async fn sent_hooks_run_once_per_delivered_job() {
        let queue = queue_with(MemoryKv::new(), &["a", "b"]).await;
        let submitter = Arc::new(ScriptedSubmitter::default());
        submitter.respond("b", [Outcome::DuplicateSkip { status: 409 }]);
        let coordinator = FlushCoordinator::new(queue, submitter, BackoffPolicy::no_retry());

        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        coordinator.on_sent({
            let sent = sent.clone();
            move |job: &Job| sent.lock().unwrap().push(job.id.to_string())
        });

        coordinator.trigger_flush().await;
        assert_eq!(*sent.lock().unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn unreadable_queue_stops_with_storage_error() {
        let kv = Arc::new(FlakyKv::default());
        let queue = queue_with(kv.clone(), &["a"]).await;
        let submitter = Arc::new(ScriptedSubmitter::default());
        let coordinator = FlushCoordinator::new(queue, submitter.clone(), BackoffPolicy::no_retry());

        kv.fail_reads.store(true, Ordering::SeqCst);
        let report = coordinator.trigger_flush().await;

        assert!(matches!(report.stopped, Some(StopReason::Storage { .. })));
        assert!(submitter.calls().is_empty());
    }

    #[tokio::test]
    async fn jobs_ahead_of_corrupt_record_are_delivered() {
        let kv = Arc::new(MemoryKv::new());
        let queue = queue_with(kv.clone(), &["a", "b", "c"]).await;
        kv.set(&job_key(&id("b")), "{truncated".into()).await.unwrap();
        let submitter = Arc::new(ScriptedSubmitter::default());
        let coordinator = FlushCoordinator::new(queue.clone(), submitter.clone(), BackoffPolicy::no_retry());

        let report = coordinator.trigger_flush().await;

        assert_eq!(report.processed, 1);
        assert_eq!(report.remaining, 2);
        assert!(matches!(report.stopped, Some(StopReason::Storage { ref detail }) if detail.contains("jobs/b")));
        assert_eq!(submitter.calls(), ["a"]);
        assert_eq!(kv.get(&job_key(&id("b"))).await.unwrap().as_deref(), Some("{truncated"));
    }

    #[tokio::test]
    async fn episodes_are_recorded_in_the_sync_log() {
        let queue = queue_with(MemoryKv::new(), &["A", "B", "C"]).await;
        let submitter = Arc::new(ScriptedSubmitter::default());
        submitter.respond("B", [Outcome::DuplicateSkip { status: 412 }]);
        submitter.respond("C", [Outcome::Retryable(RetryReason::Status(500))]);
        let log = Arc::new(MemoryLog::default());
        let coordinator = FlushCoordinator::with_log(queue, submitter, BackoffPolicy::no_retry(), log.clone());

        coordinator.trigger(TriggerSource::Timer).await;

        let mut entries = log.recent(10).await.unwrap();
        entries.reverse();
        let lines: Vec<(LogEvent, Option<String>, String)> = entries
            .into_iter()
            .map(|e| (e.event, e.job_id.map(|id| id.to_string()), e.message))
            .collect();
        assert_eq!(
            lines,
            [
                (LogEvent::FlushStart, None, "timer flush, 3 ready".to_string()),
                (LogEvent::JobSent, Some("A".to_string()), "HTTP 200, attempt 1".to_string()),
                (LogEvent::JobDuplicate, Some("B".to_string()), "HTTP 412, already on the server".to_string()),
                (LogEvent::FlushStop, Some("C".to_string()), "delivery failed: HTTP 500".to_string()),
                (LogEvent::FlushFinish, None, "processed 2, remaining 1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_removal_keeps_job_and_stops() {
        let kv = Arc::new(FlakyKv::default());
        let queue = queue_with(kv.clone(), &["a", "b"]).await;
        let submitter = Arc::new(ScriptedSubmitter::default());
        let coordinator = FlushCoordinator::new(queue.clone(), submitter.clone(), BackoffPolicy::no_retry());

        kv.fail_writes.store(true, Ordering::SeqCst);
        let report = coordinator.trigger_flush().await;

        assert_eq!(report.processed, 0);
        assert_eq!(report.remaining, 2);
        assert!(matches!(report.stopped, Some(StopReason::Storage { .. })));
        assert_eq!(submitter.calls(), ["a"]);

        kv.fail_writes.store(false, Ordering::SeqCst);
        assert!(coordinator.trigger_flush().await.is_drained());
    }
}
