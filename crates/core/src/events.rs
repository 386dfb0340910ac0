//! Lifecycle events for cache observers
//!
//! The facade publishes driver negotiation and auto-clean progress on a
//! broadcast channel. Publishing never blocks and never fails the caller;
//! events sent while nobody is subscribed are dropped.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::trace;

/// Events emitted by a [`crate::Cache`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEvent {
    /// A driver reported itself loadable and is now bound
    DriverLoaded { driver: String },
    /// A candidate driver was skipped during init
    DriverRejected { driver: String, reason: String },
    /// Init exhausted every candidate
    NoDriversAvailable { candidates: Vec<String> },
    /// The auto-clean timer was set (`Some`) or cancelled (`None`)
    AutoCleanScheduled { interval: Option<Duration> },
    /// An auto-clean pass is starting
    AutoCleanStarted,
    /// An auto-clean pass settled, with the error message if it failed
    AutoCleanCompleted { error: Option<String> },
    /// `from_file` read a file from disk rather than serving the cached copy
    FileRead { path: PathBuf, bytes: usize },
}

/// An event together with the time it was published
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: CacheEvent,
    pub timestamp: SystemTime,
}

/// Broadcast emitter shared by every clone of a cache
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: CacheEvent) {
        let envelope = EventEnvelope {
            event,
            timestamp: SystemTime::now(),
        };

        if self.sender.send(envelope).is_err() {
            trace!("no cache event subscribers");
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Get the number of active receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
