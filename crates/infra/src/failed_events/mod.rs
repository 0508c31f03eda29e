//! Failed-event reliability layer.
//!
//! A consumer that cannot process an event hands it to the
//! [`RetryOrchestrator`], which persists it as a `PENDING` record with a
//! backoff-computed retry time. The [`SweepScheduler`] periodically claims
//! due records, redelivers them, and reports the outcome back to the
//! orchestrator until each record is either `RESOLVED` or `FAILED`.
//! Operators can inspect, re-arm, resolve, or delete records through the
//! orchestrator at any time.

pub mod capture;
pub mod in_memory;
pub mod orchestrator;
pub mod postgres;
pub mod redelivery;
pub mod scheduler;
pub mod store;

pub use capture::{Dispatch, FailureCapture};
pub use in_memory::InMemoryFailedEventStore;
pub use orchestrator::{DEFAULT_BATCH_SIZE, OrchestratorError, RetryOrchestrator};
pub use postgres::PostgresFailedEventStore;
pub use redelivery::{
    ConsumerRedeliverer, DeliveryError, PublishingRedeliverer, Redeliverer, decode_envelope,
};
pub use scheduler::{SweepConfig, SweepError, SweepReport, SweepScheduler};
pub use store::{FailedEventFilter, FailedEventStats, FailedEventStore, FailedEventStoreError};
