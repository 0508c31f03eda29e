//! Integration tests for the full failure pipeline.
//!
//! Tests: EventBus → Consumer (fails) → FailureCapture → Store → Sweep → Redelivery
//!
//! Verifies:
//! - A handler failure becomes a PENDING record carrying the original envelope
//! - Sweeps retry with backoff until the handler succeeds or the budget is spent
//! - Operators can re-arm an exhausted record and it is swept again

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use redeliver_core::{FailedEventStatus, FixedBackoff};
    use redeliver_events::{EventBus, EventConsumer, EventEnvelope, InMemoryEventBus};

    use crate::failed_events::{
        ConsumerRedeliverer, Dispatch, FailedEventFilter, FailureCapture, InMemoryFailedEventStore,
        PublishingRedeliverer, RetryOrchestrator, SweepConfig, SweepScheduler,
    };

    const TOPIC: &str = "reservations.approved";

    /// Fails its first `failures` calls, then succeeds.
    struct ApprovalProjector {
        failures: usize,
        calls: AtomicUsize,
    }

    impl ApprovalProjector {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EventConsumer for ApprovalProjector {
        fn name(&self) -> &str {
            "approval-projector"
        }

        async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!(
                    "reservation {} not found (call {})",
                    envelope.payload()["reservationId"],
                    call + 1
                );
            }
            Ok(())
        }
    }

    fn approval() -> EventEnvelope {
        EventEnvelope::new(
            TOPIC,
            "reservation.approved",
            serde_json::json!({ "reservationId": "r-42" }),
        )
        .with_service("approval-service")
        .with_correlation_id("req-7")
    }

    /// Zero backoff so every sweep sees the record as due.
    fn orchestrator() -> Arc<RetryOrchestrator<Arc<InMemoryFailedEventStore>>> {
        Arc::new(RetryOrchestrator::with_policy(
            InMemoryFailedEventStore::arc(),
            Arc::new(FixedBackoff::new(Duration::ZERO)),
        ))
    }

    #[tokio::test]
    async fn captured_failure_is_retried_until_handler_succeeds() {
        let orch = orchestrator();
        let projector = ApprovalProjector::failing(2);
        let capture = FailureCapture::new(projector.clone(), orch.clone());
        let scheduler = SweepScheduler::new(
            orch.clone(),
            ConsumerRedeliverer::new().register(TOPIC, projector.clone()),
            SweepConfig::default(),
        );

        // Live delivery fails (call 1).
        let Dispatch::Captured(record) = capture.dispatch(&approval()).await.unwrap() else {
            panic!("expected the failure to be captured");
        };
        assert_eq!(record.status, FailedEventStatus::Pending);
        assert!(record.error.contains("call 1"));

        // First sweep fails again (call 2) and reschedules.
        let report = scheduler.process_retries().await.unwrap();
        assert_eq!(report.rescheduled, 1);
        let stored = orch.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FailedEventStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.error.contains("call 2"));

        // Second sweep succeeds (call 3).
        let report = scheduler.process_retries().await.unwrap();
        assert_eq!(report.delivered, 1);
        let stored = orch.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FailedEventStatus::Resolved);
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.resolution.as_deref(), Some("Retry successful"));
        assert_eq!(projector.calls.load(Ordering::SeqCst), 3);

        let stats = orch.get_stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.resolved, 1);
    }

    #[tokio::test]
    async fn exhausted_record_can_be_rearmed_by_an_operator() {
        let orch = orchestrator();
        let projector = ApprovalProjector::failing(4);
        let capture = FailureCapture::new(projector.clone(), orch.clone()).with_max_attempts(2);
        let scheduler = SweepScheduler::new(
            orch.clone(),
            ConsumerRedeliverer::new().register(TOPIC, projector.clone()),
            SweepConfig::default(),
        );

        let Dispatch::Captured(record) = capture.dispatch(&approval()).await.unwrap() else {
            panic!("expected the failure to be captured");
        };

        scheduler.process_retries().await.unwrap();
        let report = scheduler.process_retries().await.unwrap();
        assert_eq!(report.exhausted, 1);

        let failed = orch
            .find(&FailedEventFilter::default().with_status(FailedEventStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, record.id);
        assert!(failed[0].error.contains("call 3"));

        // Nothing is due while the record is FAILED.
        assert_eq!(scheduler.process_retries().await.unwrap().candidates, 0);

        orch.retry_manually(record.id).await.unwrap();
        scheduler.process_retries().await.unwrap(); // call 4 fails
        let report = scheduler.process_retries().await.unwrap(); // call 5 succeeds
        assert_eq!(report.delivered, 1);

        let stored = orch.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FailedEventStatus::Resolved);
        assert_eq!(stored.attempt_count, 2);
    }

    #[tokio::test]
    async fn republished_envelope_reaches_bus_subscribers_unchanged() {
        let orch = orchestrator();
        let bus = Arc::new(InMemoryEventBus::new());
        let subscription = bus.subscribe(TOPIC);
        let scheduler = SweepScheduler::new(
            orch.clone(),
            PublishingRedeliverer::new(bus.clone()),
            SweepConfig::default(),
        );

        let original = approval();
        let record = orch
            .add_failed_event(
                &original,
                TOPIC,
                anyhow::anyhow!("projection store offline").into(),
                None,
            )
            .await
            .unwrap();

        let before = Utc::now();
        let report = scheduler.process_retries().await.unwrap();
        assert_eq!(report.delivered, 1);

        let redelivered = subscription.try_recv().unwrap();
        assert_eq!(redelivered, original);
        assert_eq!(redelivered.correlation_id(), Some("req-7"));

        let stored = orch.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FailedEventStatus::Resolved);
        assert!(stored.resolved_at.unwrap() >= before);
    }
}
