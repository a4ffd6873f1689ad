//! Event bus for pipeline notifications
//!
//! Components publish lifecycle changes and fatal errors here; the CLI and
//! tests subscribe.

pub mod types;

pub use types::PipelineEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcasts pipeline events to every subscriber
///
/// Cloning is cheap; clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Receive all future events. A subscriber that falls too far behind
    /// gets `Lagged` and misses some.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
