//! Redelivery: how a claimed record's original event is handed back to the system.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use redeliver_core::{FailedEventRecord, FailureReason};
use redeliver_events::{EventConsumer, EventEnvelope, EventPublisher};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("stored event could not be decoded: {0}")]
    Decode(String),
    #[error("no consumer registered for topic {0}")]
    NoConsumer(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("consumer rejected event: {}", .0.message)]
    Rejected(FailureReason),
}

impl DeliveryError {
    /// Failure to store on the record; a consumer's own error is kept as reported.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            DeliveryError::Rejected(reason) => reason.clone(),
            other => FailureReason::new(other.to_string()),
        }
    }
}

/// Delivers one claimed record.
///
/// `Ok(())` means the event was taken care of and the record can be resolved.
#[async_trait]
pub trait Redeliverer: Send + Sync {
    async fn redeliver(&self, record: &FailedEventRecord) -> Result<(), DeliveryError>;
}

#[async_trait]
impl<R> Redeliverer for Arc<R>
where
    R: Redeliverer + ?Sized,
{
    async fn redeliver(&self, record: &FailedEventRecord) -> Result<(), DeliveryError> {
        (**self).redeliver(record).await
    }
}

/// Decode the stored envelope.
pub fn decode_envelope(record: &FailedEventRecord) -> Result<EventEnvelope, DeliveryError> {
    serde_json::from_value(record.original_event.clone())
        .map_err(|e| DeliveryError::Decode(e.to_string()))
}

/// Re-publishes the stored envelope onto the bus.
///
/// Success only means the bus accepted the envelope. If the consumer fails
/// again it is captured as a new failure. `EventPublisher::publish` is
/// synchronous, so it runs on the blocking pool.
#[derive(Debug)]
pub struct PublishingRedeliverer<P> {
    publisher: Arc<P>,
}

impl<P> Clone for PublishingRedeliverer<P> {
    fn clone(&self) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
        }
    }
}

impl<P: EventPublisher + 'static> PublishingRedeliverer<P> {
    pub fn new(publisher: P) -> Self {
        Self {
            publisher: Arc::new(publisher),
        }
    }
}

#[async_trait]
impl<P: EventPublisher + 'static> Redeliverer for PublishingRedeliverer<P> {
    #[instrument(skip_all, fields(failed_event_id = %record.id, topic = %record.topic), err)]
    async fn redeliver(&self, record: &FailedEventRecord) -> Result<(), DeliveryError> {
        let envelope = decode_envelope(record)?;
        let publisher = Arc::clone(&self.publisher);

        tokio::task::spawn_blocking(move || publisher.publish(envelope))
            .await
            .map_err(|e| DeliveryError::Publish(format!("publish task failed: {e}")))?
            .map_err(|e| DeliveryError::Publish(e.to_string()))?;
        debug!(failed_event_id = %record.id, "envelope republished");
        Ok(())
    }
}

/// Hands the stored envelope straight to the consumer registered for the
/// record's topic, so the outcome is the handler's own result.
#[derive(Default)]
pub struct ConsumerRedeliverer {
    consumers: HashMap<String, Arc<dyn EventConsumer>>,
}

impl ConsumerRedeliverer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, topic: impl Into<String>, consumer: Arc<dyn EventConsumer>) -> Self {
        self.consumers.insert(topic.into(), consumer);
        self
    }
}

impl std::fmt::Debug for ConsumerRedeliverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut topics: Vec<_> = self.consumers.keys().collect();
        topics.sort();
        f.debug_struct("ConsumerRedeliverer")
            .field("topics", &topics)
            .finish()
    }
}

#[async_trait]
impl Redeliverer for ConsumerRedeliverer {
    #[instrument(skip_all, fields(failed_event_id = %record.id, topic = %record.topic), err)]
    async fn redeliver(&self, record: &FailedEventRecord) -> Result<(), DeliveryError> {
        let consumer = self
            .consumers
            .get(&record.topic)
            .ok_or_else(|| DeliveryError::NoConsumer(record.topic.clone()))?;
        let envelope = decode_envelope(record)?;

        consumer
            .handle(&envelope)
            .await
            .map_err(|e| DeliveryError::Rejected(FailureReason::from(e)))?;
        debug!(failed_event_id = %record.id, consumer = consumer.name(), "consumer accepted envelope");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use redeliver_core::NewFailedEvent;
    use redeliver_events::{EventBus, InMemoryEventBus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record_for(envelope: &EventEnvelope) -> FailedEventRecord {
        FailedEventRecord::new(
            NewFailedEvent::new(
                serde_json::to_value(envelope).unwrap(),
                envelope.topic(),
                FailureReason::new("boom"),
            ),
            Utc::now(),
        )
        .unwrap()
    }

    struct Flaky {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl EventConsumer for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _envelope: &EventEnvelope) -> anyhow::Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(anyhow::anyhow!("db timeout").context("persisting approval"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishing_redeliverer_republishes_original_envelope() {
        let bus = Arc::new(InMemoryEventBus::new());
        let subscription = bus.subscribe("approvals");
        let envelope = EventEnvelope::new("approvals", "approved", serde_json::json!({ "id": 7 }));

        PublishingRedeliverer::new(bus.clone())
            .redeliver(&record_for(&envelope))
            .await
            .unwrap();

        assert_eq!(subscription.try_recv().unwrap(), envelope);
    }

    /// Blocks inside `publish` until the test releases it.
    struct HeldPublisher {
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl EventPublisher for HeldPublisher {
        type Error = String;

        fn publish(&self, _envelope: EventEnvelope) -> Result<(), String> {
            let release = self.release.lock().map_err(|e| e.to_string())?;
            release
                .recv_timeout(std::time::Duration::from_secs(5))
                .map_err(|e| format!("never released: {e}"))
        }
    }

    #[tokio::test]
    async fn blocking_publish_does_not_stall_the_runtime() {
        let (tx, rx) = std::sync::mpsc::channel();
        let redeliverer = PublishingRedeliverer::new(HeldPublisher {
            release: std::sync::Mutex::new(rx),
        });
        let record = record_for(&EventEnvelope::new("t", "e", serde_json::json!({})));

        // Single-threaded runtime: the release below only runs if publish
        // is off this thread.
        let (delivered, ()) = tokio::join!(redeliverer.redeliver(&record), async move {
            tokio::task::yield_now().await;
            tx.send(()).unwrap();
        });

        assert_eq!(delivered, Ok(()));
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_delivery_error() {
        let mut record = record_for(&EventEnvelope::new("t", "e", serde_json::json!({})));
        record.original_event = serde_json::json!("not an envelope");

        let err = PublishingRedeliverer::new(InMemoryEventBus::new())
            .redeliver(&record)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Decode(_)));
        assert!(err.failure_reason().message.starts_with("stored event could not be decoded"));
    }

    #[tokio::test]
    async fn consumer_redeliverer_reports_handler_outcome() {
        let envelope = EventEnvelope::new("approvals", "approved", serde_json::json!({}));
        let record = record_for(&envelope);
        let redeliverer = ConsumerRedeliverer::new().register(
            "approvals",
            Arc::new(Flaky {
                failures_left: AtomicUsize::new(1),
            }),
        );

        let err = redeliverer.redeliver(&record).await.unwrap_err();
        let reason = err.failure_reason();
        assert_eq!(reason.message, "persisting approval");
        assert!(reason.stack.unwrap().contains("db timeout"));

        assert!(redeliverer.redeliver(&record).await.is_ok());
    }

    #[tokio::test]
    async fn consumer_redeliverer_without_handler_fails() {
        let record = record_for(&EventEnvelope::new("unknown", "e", serde_json::json!({})));

        assert_eq!(
            ConsumerRedeliverer::new().redeliver(&record).await,
            Err(DeliveryError::NoConsumer("unknown".into()))
        );
    }
}
