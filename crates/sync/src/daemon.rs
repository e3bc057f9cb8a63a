//! Background flushing.
//!
//! The daemon turns connectivity changes and a periodic timer into flush
//! triggers. It never flushes while offline and never runs two episodes at
//! once (the coordinator coalesces overlapping triggers).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use wardsync_queue::KeyValueStore;

use crate::connectivity::{ConnectivityState, NetworkObserver};
use crate::coordinator::{FlushCoordinator, TriggerSource};
use crate::submission::Submitter;

const MIN_TIMER_DELAY: Duration = Duration::from_secs(1);

/// Periodic flush schedule: `interval` plus or minus up to `jitter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTimer {
    pub interval: Duration,
    pub jitter: Duration,
}

impl Default for FlushTimer {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            jitter: Duration::from_secs(3),
        }
    }
}

impl FlushTimer {
    /// Delay until the next tick; never below one second.
    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter_ms = i64::try_from(self.jitter.as_millis()).unwrap_or(i64::MAX);
        let interval_ms = i64::try_from(self.interval.as_millis()).unwrap_or(i64::MAX);
        let offset = if jitter_ms == 0 {
            0
        } else {
            rng.gen_range(-jitter_ms..=jitter_ms)
        };
        let delay = Duration::from_millis(interval_ms.saturating_add(offset).max(0) as u64);
        delay.max(MIN_TIMER_DELAY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonOptions {
    /// Flush right away if the device is online when the daemon starts.
    pub flush_on_startup: bool,
    /// Periodic flushing while online; `None` disables it.
    pub timer: Option<FlushTimer>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            flush_on_startup: true,
            timer: Some(FlushTimer::default()),
        }
    }
}

/// Running daemon. Dropping the handle stops it.
#[derive(Debug)]
pub struct DaemonHandle {
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl DaemonHandle {
    /// Stop listening. A flush already in progress still completes.
    pub fn unsubscribe(&self) {
        self.shutdown.notify_one();
    }

    /// Stop listening and wait for the daemon loop to exit.
    pub async fn stop(mut self) {
        self.unsubscribe();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!("outbox daemon ended abnormally: {err}");
            }
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

/// Spawn the daemon loop for `coordinator`, driven by `observer`.
pub fn start_daemon<K, S>(
    coordinator: FlushCoordinator<K, S>,
    observer: &dyn NetworkObserver,
    options: DaemonOptions,
) -> DaemonHandle
where
    K: KeyValueStore + 'static,
    S: Submitter + 'static,
{
    let shutdown = Arc::new(Notify::new());
    let mut connectivity = observer.subscribe();

    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let mut last = *connectivity.borrow_and_update();
            tracing::info!(state = ?last, "outbox daemon started");

            if options.flush_on_startup && last.is_online() {
                spawn_flush(&coordinator, TriggerSource::Startup);
            }

            let mut next_tick = options.timer.map(|timer| schedule(&timer));
            let mut listening = true;

            loop {
                let deadline = next_tick.unwrap_or_else(Instant::now);
                tokio::select! {
                    _ = shutdown.notified() => break,
                    changed = connectivity.changed(), if listening => {
                        if changed.is_err() {
                            tracing::info!("connectivity source closed");
                            listening = false;
                            continue;
                        }
                        let state = *connectivity.borrow_and_update();
                        if last == ConnectivityState::Offline && state == ConnectivityState::Online {
                            spawn_flush(&coordinator, TriggerSource::Connectivity);
                        }
                        last = state;
                    }
                    _ = tokio::time::sleep_until(deadline), if next_tick.is_some() => {
                        if last.is_online() {
                            spawn_flush(&coordinator, TriggerSource::Timer);
                        }
                        next_tick = options.timer.map(|timer| schedule(&timer));
                    }
                }
            }

            tracing::info!("outbox daemon stopped");
        }
    });

    DaemonHandle {
        shutdown,
        task: Some(task),
    }
}

fn schedule(timer: &FlushTimer) -> Instant {
    Instant::now() + timer.next_delay(&mut rand::thread_rng())
}

fn spawn_flush<K, S>(coordinator: &FlushCoordinator<K, S>, source: TriggerSource)
where
    K: KeyValueStore + 'static,
    S: Submitter + 'static,
{
    let coordinator = coordinator.clone();
    tokio::spawn(async move {
        let report = coordinator.trigger(source).await;
        tracing::debug!(
            source = ?source,
            processed = report.processed,
            remaining = report.remaining,
            "triggered flush finished"
        );
    });
}
