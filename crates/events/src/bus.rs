//! Publishing/subscription abstraction (mechanics only).
//!
//! The reliability layer only ever *publishes*: a redelivery puts the stored
//! envelope back on its topic. Subscribing is what consumers do, so it lives
//! on the wider `EventBus` trait.
//!
//! ## Delivery Guarantees
//!
//! The bus provides **at-least-once delivery**:
//! - Events may be delivered multiple times (a redelivery is exactly that)
//! - Events may be delivered out of order across topics
//! - Consumers must be idempotent (handle duplicates safely)

use std::sync::Arc;
use std::sync::mpsc::Receiver;

use crate::EventEnvelope;

/// A subscription to one topic.
///
/// Designed for single-threaded consumption; hand messages to other threads
/// through a channel if needed.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Puts envelopes on their topic.
///
/// `publish()` can fail (bus full, broker unreachable). Callers decide what a
/// failure means; for a redelivery it is just another failed attempt.
pub trait EventPublisher: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, envelope: EventEnvelope) -> Result<(), Self::Error>;
}

/// Topic-scoped pub/sub.
///
/// Each subscriber of a topic gets a copy of every envelope published on it.
pub trait EventBus: EventPublisher {
    fn subscribe(&self, topic: &str) -> Subscription<EventEnvelope>;
}

impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    type Error = P::Error;

    fn publish(&self, envelope: EventEnvelope) -> Result<(), Self::Error> {
        (**self).publish(envelope)
    }
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn subscribe(&self, topic: &str) -> Subscription<EventEnvelope> {
        (**self).subscribe(topic)
    }
}
