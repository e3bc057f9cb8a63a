//! `wardsync-sync`: delivery of queued clinical bundles.
//!
//! - `backoff`: exponential backoff with full jitter
//! - `submission`: the HTTP call and the classification of its answer
//! - `coordinator`: ordered, coalesced flushing of the outbox
//! - `daemon` / `connectivity`: flush triggers from network changes and a timer
//! - `outbox`: the facade applications use

pub mod auth;
pub mod backoff;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod daemon;
pub mod outbox;
pub mod submission;

pub use auth::{SharedToken, StaticToken, TokenProvider};
pub use backoff::BackoffPolicy;
pub use config::{ConfigError, SyncConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, NetworkObserver};
pub use coordinator::{FlushCoordinator, FlushReport, FlushState, StopReason, TriggerSource};
pub use daemon::{DaemonHandle, DaemonOptions, FlushTimer, start_daemon};
pub use outbox::{Delivery, Outbox};
pub use submission::{HttpSubmitter, Outcome, RetryReason, Submitter, classify_status};
