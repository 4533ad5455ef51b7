use chronicle_core::Event;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// In-process event bus backed by an unbounded channel. Emission never blocks
/// and never fails the emitting stage; consumers treat delivery as
/// at-least-once and keep their handlers idempotent.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    /// A bus plus the receiving end the dispatcher drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event for the dispatcher. A closed bus drops the event with a
    /// warning.
    pub fn emit(&self, event: Event) {
        let topic = event.topic();
        if self.tx.send(event).is_err() {
            warn!(topic, "event bus closed, dropping event");
        } else {
            debug!(topic, "event emitted");
        }
    }
}
