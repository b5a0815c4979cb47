//! Notification bus for state, health and download events.
use std::sync::{
    Arc, Mutex,
    mpsc::{self, Receiver, SyncSender},
};

use serde::{Deserialize, Serialize};

use crate::state::ServiceState;

/// Events published by the engine to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged { service: String, state: ServiceState },
    HealthChanged { service: String, healthy: bool },
    DownloadProgress { service: String, progress: f64 },
    DownloadFinished { service: String, version: String },
    DownloadFailed { service: String, error: String },
    ChainReset,
}

/// Events a subscriber may leave unread before it is dropped from the bus.
pub const EVENT_BUFFER: usize = 1024;

/// Fan-out of [`EngineEvent`]s over bounded mpsc channels.
///
/// Publishing never blocks. A subscriber whose receiver was dropped, or
/// whose buffer is full, is pruned on the next publish.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<SyncSender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = mpsc::sync_channel(EVENT_BUFFER);
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
