//! `redeliver-core`: domain building blocks of the failed-event reliability layer.
//!
//! This crate contains **pure domain** primitives (no IO, no async): the
//! failed-event record and its status machine, and the backoff policies that
//! drive its retry schedule.

pub mod backoff;
pub mod error;
pub mod failed_event;
pub mod id;

pub use backoff::{
    BackoffConfig, BackoffPolicy, ExponentialBackoff, FixedBackoff, LinearBackoff, should_retry,
};
pub use error::{DomainError, DomainResult};
pub use failed_event::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RESOLUTION, FailedEventRecord, FailedEventStatus, FailureReason,
    Metadata, MetadataValue, NewFailedEvent, SYSTEM_RESOLVER,
};
pub use id::{EventId, FailedEventId};
