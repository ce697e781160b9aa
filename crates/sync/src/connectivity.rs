//! Connectivity state shared by the worker, the orchestrator and the platform
//! layer that observes network changes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// The Remote Service was reachable at last contact.
    Online,
    /// A request or probe failed to reach the Remote Service.
    Offline,
}

/// Cheap-to-clone handle over the current connectivity state.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl Connectivity {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Returns `true` when this call flipped the state.
    pub fn set_online(&self) -> bool {
        self.set(ConnectivityState::Online)
    }

    /// Returns `true` when this call flipped the state.
    pub fn set_offline(&self) -> bool {
        self.set(ConnectivityState::Offline)
    }

    pub fn set(&self, state: ConnectivityState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}
