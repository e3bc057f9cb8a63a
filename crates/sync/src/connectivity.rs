//! Connectivity signal.
//!
//! Detecting the network is the host's job. It reports what it sees through a
//! [`ConnectivityMonitor`] (or its own [`NetworkObserver`]) and the daemon
//! reacts to the transitions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(self) -> bool {
        self == ConnectivityState::Online
    }
}

/// Source of connectivity updates.
pub trait NetworkObserver: Send + Sync {
    /// A receiver holding the current state and notified on every change.
    fn subscribe(&self) -> watch::Receiver<ConnectivityState>;
}

impl<T: NetworkObserver + ?Sized> NetworkObserver for Arc<T> {
    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        (**self).subscribe()
    }
}

/// Connectivity state set by the host application.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Mark the client as online.
    pub fn set_online(&self) {
        self.set(ConnectivityState::Online);
    }

    /// Mark the client as offline.
    pub fn set_offline(&self) {
        self.set(ConnectivityState::Offline);
    }

    /// Publish `state`; subscribers are only woken on an actual change.
    pub fn set(&self, state: ConnectivityState) {
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            tracing::info!(state = ?state, "connectivity changed");
        }
    }
}

impl NetworkObserver for ConnectivityMonitor {
    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}
