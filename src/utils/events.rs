//! Typed event fan-out between subsystems.
//!
//! Each subsystem owns one `EventHub` per event type. Subscribers register
//! before the subsystem's loops start, so the subscriber set is fixed for
//! the lifetime of the hub and events reach every subscriber in
//! publication order.

use tokio::sync::mpsc;
use tracing::warn;

/// Default mailbox capacity for a subscriber.
const DEFAULT_CAPACITY: usize = 256;

/// Fan-out publisher with a construction-time subscriber set.
pub struct EventHub<E: Clone> {
    subscribers: Vec<mpsc::Sender<E>>,
    name: &'static str,
}

impl<E: Clone> EventHub<E> {
    /// Create an empty hub identified by `name` in log output.
    pub fn new(name: &'static str) -> Self {
        Self {
            subscribers: Vec::new(),
            name,
        }
    }

    /// Register a subscriber and return its receiving end.
    ///
    /// Must be called before the owning subsystem starts publishing.
    pub fn subscribe(&mut self) -> mpsc::Receiver<E> {
        let (tx, rx) = mpsc::channel(DEFAULT_CAPACITY);
        self.subscribers.push(tx);
        rx
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver an event to every live subscriber in registration order.
    ///
    /// A dropped receiver is skipped; a full mailbox applies backpressure
    /// rather than dropping the event, preserving publication order.
    pub async fn publish(&self, event: E) {
        for tx in &self.subscribers {
            if tx.send(event.clone()).await.is_err() {
                warn!(hub = self.name, "event subscriber dropped");
            }
        }
    }
}
