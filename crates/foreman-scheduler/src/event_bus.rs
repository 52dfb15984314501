//! Broadcast-based event bus for scheduler observability.
//!
//! Wraps `tokio::sync::broadcast` so multiple consumers each receive
//! their own copy of every event. Slow consumers are dropped gracefully
//! via the channel's lag mechanism.

use foreman_core::event::{EventKind, SchedulerEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default channel capacity — large enough to buffer a burst of dispatch
/// events without back-pressuring the tick, small enough to bound memory.
const DEFAULT_CAPACITY: usize = 1024;

/// Central event bus for scheduler observability.
///
/// Clone-friendly via internal `Arc`. All clones share the same
/// underlying broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<SchedulerEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Emit an event to all subscribers. With no subscribers the event is
    /// silently dropped; the bus never blocks the tick.
    pub fn emit(&self, kind: EventKind) {
        let _ = self.tx.send(SchedulerEvent::new(kind));
    }

    /// Subscribe to receive scheduler events. A subscriber that falls
    /// behind by more than the capacity loses the missed events but never
    /// blocks the scheduler.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::job::{JobId, JobStatus};

    #[tokio::test]
    async fn emit_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(EventKind::TickStarted);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, EventKind::TickStarted));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_copy() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(EventKind::JobFinished {
            job_id: JobId(1),
            status: JobStatus::Success,
        });

        assert!(matches!(
            rx1.recv().await.unwrap().kind,
            EventKind::JobFinished { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap().kind,
            EventKind::JobFinished { .. }
        ));
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(EventKind::TickStarted);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
