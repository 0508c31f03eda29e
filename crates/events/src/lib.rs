//! Event transport vocabulary: envelopes, publishers, buses and consumers.
//!
//! The reliability layer never interprets event payloads. What it needs from
//! the transport is small: an envelope carrying routing metadata, a way to put
//! an envelope back on its topic, and the consumer contract whose failures it
//! records.

pub mod bus;
pub mod consumer;
pub mod envelope;
pub mod in_memory_bus;

pub use bus::{EventBus, EventPublisher, Subscription};
pub use consumer::EventConsumer;
pub use envelope::EventEnvelope;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
