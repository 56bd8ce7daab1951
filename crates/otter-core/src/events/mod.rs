//! Event fan-out for task runs.
//!
//! The bus wraps a bounded `tokio::sync::broadcast` channel. Publishing is
//! fire-and-forget: a send succeeds whether or not anyone is listening, a
//! subscriber that falls behind loses the oldest messages (it observes a
//! `Lagged` error and keeps receiving), and one subscriber's fate never
//! affects another's. Late subscribers see only future events.

use tokio::sync::broadcast;

use crate::model::TaskEvent;

/// Default per-subscriber buffer depth.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Fan-out delivery structure that streams [`TaskEvent`]s to subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a new subscriber. The receiver sees only events published
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers.
    ///
    /// Returns the number of subscribers the event was delivered to. Zero
    /// subscribers is not an error.
    pub fn publish(&self, event: TaskEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
