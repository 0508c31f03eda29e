//! In-memory event bus for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, mpsc};

use crate::EventEnvelope;
use crate::bus::{EventBus, EventPublisher, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,
}

/// In-memory topic bus.
///
/// - No IO / no async
/// - Best-effort fan-out per topic
/// - Publishing to a topic nobody listens on succeeds and drops the envelope
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<EventEnvelope>>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .map(|topics| topics.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl EventPublisher for InMemoryEventBus {
    type Error = InMemoryBusError;

    fn publish(&self, envelope: EventEnvelope) -> Result<(), Self::Error> {
        let mut topics = self.topics.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        match topics.get_mut(envelope.topic()) {
            Some(subs) => {
                // Drop any dead subscribers while publishing.
                subs.retain(|tx| tx.send(envelope.clone()).is_ok());
            }
            None => tracing::trace!(topic = envelope.topic(), "no subscribers; envelope dropped"),
        }

        Ok(())
    }
}

impl EventBus for InMemoryEventBus {
    fn subscribe(&self, topic: &str) -> Subscription<EventEnvelope> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut topics) = self.topics.lock() {
            topics.entry(topic.to_string()).or_default().push(tx);
        }

        Subscription::new(rx)
    }
}
