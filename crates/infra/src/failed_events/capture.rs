//! Consumer-side failure capture.
//!
//! Wraps an [`EventConsumer`] so that an envelope whose handler returns an
//! error is written to the failed-event store instead of being dropped.

use std::sync::Arc;

use tracing::debug;

use redeliver_core::{FailedEventRecord, FailureReason, MetadataValue};
use redeliver_events::{EventConsumer, EventEnvelope};

use super::orchestrator::{OrchestratorError, RetryOrchestrator};
use super::store::FailedEventStore;

/// Outcome of dispatching one envelope through a [`FailureCapture`].
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Handled,
    Captured(FailedEventRecord),
}

pub struct FailureCapture<C, S> {
    consumer: C,
    orchestrator: Arc<RetryOrchestrator<S>>,
    max_attempts: Option<u32>,
}

impl<C, S> FailureCapture<C, S>
where
    C: EventConsumer,
    S: FailedEventStore,
{
    pub fn new(consumer: C, orchestrator: Arc<RetryOrchestrator<S>>) -> Self {
        Self {
            consumer,
            orchestrator,
            max_attempts: None,
        }
    }

    /// Attempt budget for records captured by this consumer.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Run the handler; on failure, persist the envelope for retry.
    ///
    /// Only an error writing the failure record is returned as `Err`.
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> Result<Dispatch, OrchestratorError> {
        let err = match self.consumer.handle(envelope).await {
            Ok(()) => {
                debug!(consumer = self.consumer.name(), event_id = %envelope.event_id(), "handled");
                return Ok(Dispatch::Handled);
            }
            Err(err) => err,
        };

        let mut new = self.orchestrator.new_failed_event(
            envelope,
            envelope.topic(),
            FailureReason::from(&err),
            self.max_attempts,
        )?;
        new.metadata.insert(
            "consumer".into(),
            MetadataValue::from(self.consumer.name()),
        );

        let record = self.orchestrator.add_failed_payload(new).await?;
        Ok(Dispatch::Captured(record))
    }
}
