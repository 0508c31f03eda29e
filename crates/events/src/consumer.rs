use async_trait::async_trait;

use crate::EventEnvelope;

/// Consumer-side handler for envelopes of one topic.
///
/// Handlers must be idempotent: a failed envelope is redelivered, possibly
/// after a partial first attempt. Returning an error is how a handler reports
/// that the envelope could not be processed; the error (with its context
/// chain) becomes the failure recorded for the event.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Stable consumer name, used in logs and failure metadata.
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<C> EventConsumer for std::sync::Arc<C>
where
    C: EventConsumer + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        (**self).handle(envelope).await
    }
}
