//! Broadcast bus for orchestrator domain events.

use dockyard_core::OrchestratorEvent;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

/// Bound of the bus channel; slow subscribers lose the oldest events.
const BUS_CAPACITY: usize = 256;

/// Fan-out channel for [`OrchestratorEvent`]s.
///
/// Publishing never blocks and never fails: events published with no
/// live subscribers are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: OrchestratorEvent) {
        trace!(?event, "Publishing orchestrator event");
        let _ = self.tx.send(event);
    }

    /// Subscribe; only events published after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`, for `select!`-style consumers.
    pub fn stream(&self) -> BroadcastStream<OrchestratorEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
