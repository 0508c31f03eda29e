//! Retry orchestration: the only component that mutates failed-event records.
//!
//! Every automatic or manual lifecycle transition goes through
//! [`RetryOrchestrator`]. It reads the record, applies the transition on the
//! domain type, and writes it back. It never delivers events itself; the
//! sweep scheduler drives delivery and reports outcomes back here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use redeliver_core::{
    BackoffPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RESOLUTION, DomainError, ExponentialBackoff,
    FailedEventId, FailedEventRecord, FailedEventStatus, FailureReason, MetadataValue,
    NewFailedEvent, SYSTEM_RESOLVER, should_retry,
};
use redeliver_events::EventEnvelope;

use super::store::{FailedEventFilter, FailedEventStats, FailedEventStore, FailedEventStoreError};

/// Default number of due records handed to one sweep.
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed event not found: {0}")]
    NotFound(FailedEventId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] FailedEventStoreError),
    #[error("event could not be serialized for storage: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, OrchestratorError::Store(e) if e.is_authentication())
    }

    /// The store is unreachable or misbehaving, as opposed to one record being rejected.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, OrchestratorError::Store(e) if e.is_infrastructure())
    }
}

pub struct RetryOrchestrator<S> {
    store: S,
    policy: Arc<dyn BackoffPolicy>,
    topic_policies: HashMap<String, Arc<dyn BackoffPolicy>>,
    batch_size: usize,
    default_max_attempts: u32,
}

impl<S> std::fmt::Debug for RetryOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("policy", &self.policy)
            .field("topic_policies", &self.topic_policies)
            .field("batch_size", &self.batch_size)
            .field("default_max_attempts", &self.default_max_attempts)
            .finish_non_exhaustive()
    }
}

impl<S: FailedEventStore> RetryOrchestrator<S> {
    /// Orchestrator with the default exponential policy (1s, x2, capped at 60s).
    pub fn new(store: S) -> Self {
        Self::with_policy(store, Arc::new(ExponentialBackoff::default()))
    }

    pub fn with_policy(store: S, policy: Arc<dyn BackoffPolicy>) -> Self {
        Self {
            store,
            policy,
            topic_policies: HashMap::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Use `policy` instead of the default for records on `topic`.
    pub fn with_topic_policy(mut self, topic: impl Into<String>, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.topic_policies.insert(topic.into(), policy);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Attempt budget for captures that do not name one. Clamped to at least 1.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Policy in effect for `topic`.
    pub fn policy_for(&self, topic: &str) -> &dyn BackoffPolicy {
        &**self.topic_policies.get(topic).unwrap_or(&self.policy)
    }

    /// Build the record input for a failed envelope without persisting it.
    ///
    /// The full envelope is kept as `original_event`; its id, timestamps and
    /// metadata are also copied into the record metadata for querying.
    pub fn new_failed_event(
        &self,
        event: &EventEnvelope,
        topic: &str,
        error: FailureReason,
        max_attempts: Option<u32>,
    ) -> Result<NewFailedEvent, OrchestratorError> {
        let original_event = serde_json::to_value(event)
            .map_err(|e| OrchestratorError::Serialization(e.to_string()))?;

        let mut new = NewFailedEvent::new(original_event, topic, error)
            .with_event_type(event.event_type())
            .with_max_attempts(max_attempts.unwrap_or(self.default_max_attempts));
        if let Some(service) = event.service() {
            new = new.with_service(service);
        }

        new.metadata.extend(event.metadata().clone());
        new.metadata.insert(
            "eventId".into(),
            MetadataValue::from(event.event_id().to_string()),
        );
        new.metadata
            .insert("occurredAt".into(), MetadataValue::from(event.occurred_at()));
        if let Some(correlation_id) = event.correlation_id() {
            new.metadata
                .insert("correlationId".into(), MetadataValue::from(correlation_id));
        }
        Ok(new)
    }

    /// Record an envelope whose processing failed. First retry is due after `delay(0)`.
    #[instrument(
        skip_all,
        fields(topic = %topic, event_type = %event.event_type()),
        err
    )]
    pub async fn add_failed_event(
        &self,
        event: &EventEnvelope,
        topic: &str,
        error: FailureReason,
        max_attempts: Option<u32>,
    ) -> Result<FailedEventRecord, OrchestratorError> {
        let new = self.new_failed_event(event, topic, error, max_attempts)?;
        self.add_failed_payload(new).await
    }

    /// Record an arbitrary failed payload.
    pub async fn add_failed_payload(
        &self,
        new: NewFailedEvent,
    ) -> Result<FailedEventRecord, OrchestratorError> {
        let next_retry_at = self.policy_for(&new.topic).next_retry_at(0);
        let record = FailedEventRecord::new(new, next_retry_at)?;
        let record = self.store.create(record).await?;

        warn!(
            failed_event_id = %record.id,
            topic = %record.topic,
            service = record.service.as_deref().unwrap_or("-"),
            event_type = record.event_type.as_deref().unwrap_or("-"),
            error = %record.error,
            next_retry_at = %next_retry_at,
            "event processing failed; scheduled for retry"
        );
        Ok(record)
    }

    /// Retryable records that are due now, earliest first, at most one batch.
    pub async fn get_due_for_retry(&self) -> Result<Vec<FailedEventRecord>, OrchestratorError> {
        Ok(self.store.find_due(Utc::now(), self.batch_size).await?)
    }

    /// Claim a record for a delivery attempt: `RETRYING`, attempt count + 1.
    ///
    /// Returns `None` when the record is gone, terminal, or was claimed by a
    /// concurrent sweep in the meantime. A retryable record whose budget is
    /// already spent (a previous attempt was interrupted) is closed as `FAILED`.
    #[instrument(skip_all, fields(failed_event_id = %id), err)]
    pub async fn mark_retrying(
        &self,
        id: FailedEventId,
    ) -> Result<Option<FailedEventRecord>, OrchestratorError> {
        let Some(mut record) = self.store.find_by_id(id).await? else {
            warn!(failed_event_id = %id, "failed event vanished before retry");
            return Ok(None);
        };
        let (expected_status, expected_attempts) = (record.status, record.attempt_count);
        let now = Utc::now();

        if record.status.is_retryable() && record.attempts_exhausted() {
            let last_error = FailureReason {
                message: record.error.clone(),
                stack: record.error_stack.clone(),
            };
            record.mark_exhausted(last_error, now)?;
            if self
                .store
                .update_if(&record, expected_status, expected_attempts)
                .await?
            {
                warn!(
                    failed_event_id = %id,
                    attempts = record.attempt_count,
                    "attempt budget already spent; marked failed"
                );
            }
            return Ok(None);
        }

        if record.mark_retrying(now).is_err() {
            debug!(failed_event_id = %id, status = %record.status, "not retryable; skipping");
            return Ok(None);
        }

        if !self
            .store
            .update_if(&record, expected_status, expected_attempts)
            .await?
        {
            debug!(failed_event_id = %id, "claimed concurrently; skipping");
            return Ok(None);
        }

        debug!(
            failed_event_id = %id,
            attempt = record.attempt_count,
            max_attempts = record.max_attempts,
            "retry attempt started"
        );
        Ok(Some(record))
    }

    /// Close a record after a successful redelivery.
    ///
    /// `resolution` defaults to "Retry successful"; the resolver is "system".
    #[instrument(skip_all, fields(failed_event_id = %id), err)]
    pub async fn mark_retry_success(
        &self,
        id: FailedEventId,
        resolution: Option<&str>,
    ) -> Result<Option<FailedEventRecord>, OrchestratorError> {
        let Some(mut record) = self.store.find_by_id(id).await? else {
            warn!(failed_event_id = %id, "failed event vanished before success was recorded");
            return Ok(None);
        };
        if record.status == FailedEventStatus::Resolved {
            debug!(failed_event_id = %id, "already resolved");
            return Ok(Some(record));
        }

        record.mark_resolved(
            SYSTEM_RESOLVER,
            resolution.unwrap_or(DEFAULT_RESOLUTION),
            Utc::now(),
        )?;
        if !self.write_back(&record).await? {
            return Ok(None);
        }

        info!(
            failed_event_id = %id,
            topic = %record.topic,
            attempts = record.attempt_count,
            "failed event redelivered"
        );
        Ok(Some(record))
    }

    /// Record a failed redelivery: reschedule with backoff, or `FAILED` when
    /// the policy allows no further attempt.
    #[instrument(skip_all, fields(failed_event_id = %id), err)]
    pub async fn mark_retry_failure(
        &self,
        id: FailedEventId,
        error: FailureReason,
    ) -> Result<Option<FailedEventRecord>, OrchestratorError> {
        let Some(mut record) = self.store.find_by_id(id).await? else {
            warn!(failed_event_id = %id, "failed event vanished before failure was recorded");
            return Ok(None);
        };
        if record.status == FailedEventStatus::Resolved {
            debug!(failed_event_id = %id, "already resolved; ignoring late failure");
            return Ok(Some(record));
        }

        let now = Utc::now();
        if should_retry(&record) {
            let next_retry_at = self
                .policy_for(&record.topic)
                .next_retry_at_from(now, record.attempt_count);
            record.schedule_retry(error, next_retry_at, now)?;
            debug!(
                failed_event_id = %id,
                attempt = record.attempt_count,
                next_retry_at = %next_retry_at,
                "retry failed; rescheduled"
            );
        } else {
            record.mark_exhausted(error, now)?;
            warn!(
                failed_event_id = %id,
                topic = %record.topic,
                attempts = record.attempt_count,
                error = %record.error,
                "retry attempts exhausted; manual intervention required"
            );
        }

        if !self.write_back(&record).await? {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Operator override: reset the attempt counter and make the record due now.
    #[instrument(skip_all, fields(failed_event_id = %id), err)]
    pub async fn retry_manually(&self, id: FailedEventId) -> Result<FailedEventRecord, OrchestratorError> {
        let mut record = self.require(id).await?;
        record.reset_for_manual_retry(Utc::now())?;
        self.update_existing(&record).await?;

        info!(failed_event_id = %id, topic = %record.topic, "manual retry requested");
        Ok(record)
    }

    #[instrument(skip_all, fields(failed_event_id = %id, resolved_by = %resolved_by), err)]
    pub async fn resolve_manually(
        &self,
        id: FailedEventId,
        resolved_by: &str,
        resolution: &str,
    ) -> Result<FailedEventRecord, OrchestratorError> {
        let mut record = self.require(id).await?;
        record.mark_resolved(resolved_by, resolution, Utc::now())?;
        self.update_existing(&record).await?;

        info!(failed_event_id = %id, resolved_by, "failed event resolved manually");
        Ok(record)
    }

    /// Hard-delete a record.
    #[instrument(skip_all, fields(failed_event_id = %id), err)]
    pub async fn remove(&self, id: FailedEventId) -> Result<(), OrchestratorError> {
        if !self.store.delete(id).await? {
            return Err(OrchestratorError::NotFound(id));
        }
        info!(failed_event_id = %id, "failed event removed");
        Ok(())
    }

    pub async fn find(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEventRecord>, OrchestratorError> {
        Ok(self.store.find(filter).await?)
    }

    pub async fn find_by_id(&self, id: FailedEventId) -> Result<Option<FailedEventRecord>, OrchestratorError> {
        Ok(self.store.find_by_id(id).await?)
    }

    pub async fn get_stats(&self) -> Result<FailedEventStats, OrchestratorError> {
        Ok(self.store.stats().await?)
    }

    /// Probe the backing store.
    pub async fn ping(&self) -> Result<(), OrchestratorError> {
        Ok(self.store.ping().await?)
    }

    async fn require(&self, id: FailedEventId) -> Result<FailedEventRecord, OrchestratorError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))
    }

    async fn update_existing(&self, record: &FailedEventRecord) -> Result<(), OrchestratorError> {
        match self.store.update(record).await {
            Err(FailedEventStoreError::NotFound(id)) => Err(OrchestratorError::NotFound(id)),
            other => Ok(other?),
        }
    }

    /// Update used by the automatic path: a record deleted mid-attempt is not an error.
    async fn write_back(&self, record: &FailedEventRecord) -> Result<bool, OrchestratorError> {
        match self.store.update(record).await {
            Ok(()) => Ok(true),
            Err(FailedEventStoreError::NotFound(id)) => {
                warn!(failed_event_id = %id, "failed event removed during retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failed_events::InMemoryFailedEventStore;
    use chrono::{DateTime, Duration};
    use redeliver_core::FixedBackoff;

    fn envelope() -> EventEnvelope {
        EventEnvelope::new(
            "reservations.approved",
            "reservation.approved",
            serde_json::json!({ "reservationId": "r-1" }),
        )
        .with_service("approval-service")
        .with_correlation_id("corr-1")
        .with_metadata("tenant", "acme")
    }

    fn orchestrator() -> RetryOrchestrator<Arc<InMemoryFailedEventStore>> {
        RetryOrchestrator::new(InMemoryFailedEventStore::arc())
    }

    fn assert_within(actual: DateTime<Utc>, before: DateTime<Utc>, after: DateTime<Utc>, delay_ms: i64) {
        let d = Duration::milliseconds(delay_ms);
        assert!(actual >= before + d, "{actual} earlier than {}", before + d);
        assert!(actual <= after + d, "{actual} later than {}", after + d);
    }

    #[tokio::test]
    async fn add_failed_event_schedules_first_retry() {
        let orch = orchestrator();
        let event = envelope();

        let before = Utc::now();
        let record = orch
            .add_failed_event(&event, "reservations.approved", FailureReason::new("db down"), None)
            .await
            .unwrap();
        let after = Utc::now();

        assert_eq!(record.status, FailedEventStatus::Pending);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.max_attempts, 3);
        assert_eq!(record.error, "db down");
        assert_eq!(record.service.as_deref(), Some("approval-service"));
        assert_eq!(record.event_type.as_deref(), Some("reservation.approved"));
        assert_within(record.next_retry_at.unwrap(), before, after, 1_000);

        assert_eq!(
            record.metadata["eventId"],
            MetadataValue::from(event.event_id().to_string())
        );
        assert_eq!(record.metadata["correlationId"], MetadataValue::from("corr-1"));
        assert_eq!(record.metadata["tenant"], MetadataValue::from("acme"));

        let stored_envelope: EventEnvelope =
            serde_json::from_value(record.original_event.clone()).unwrap();
        assert_eq!(stored_envelope, event);
    }

    #[tokio::test]
    async fn add_failed_event_honours_explicit_budget() {
        let orch = orchestrator().with_default_max_attempts(7);

        let record = orch
            .add_failed_event(&envelope(), "t", FailureReason::new("e"), Some(5))
            .await
            .unwrap();
        assert_eq!(record.max_attempts, 5);

        let record = orch
            .add_failed_event(&envelope(), "t", FailureReason::new("e"), None)
            .await
            .unwrap();
        assert_eq!(record.max_attempts, 7);

        let rejected = orch
            .add_failed_event(&envelope(), "t", FailureReason::new("e"), Some(0))
            .await;
        assert!(matches!(rejected, Err(OrchestratorError::Domain(_))));
    }

    #[tokio::test]
    async fn retry_lifecycle_backs_off_then_fails() {
        let orch = orchestrator();
        let record = orch
            .add_failed_event(&envelope(), "t", FailureReason::new("first"), None)
            .await
            .unwrap();

        // Attempt 1 fails: next delay is delay(1) = 2s.
        let claimed = orch.mark_retrying(record.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, FailedEventStatus::Retrying);
        assert_eq!(claimed.attempt_count, 1);

        let before = Utc::now();
        let updated = orch
            .mark_retry_failure(record.id, FailureReason::new("second"))
            .await
            .unwrap()
            .unwrap();
        let after = Utc::now();
        assert_eq!(updated.status, FailedEventStatus::Pending);
        assert_eq!(updated.error, "second");
        assert_within(updated.next_retry_at.unwrap(), before, after, 2_000);

        // Attempt 2 fails: delay(2) = 4s.
        orch.mark_retrying(record.id).await.unwrap().unwrap();
        let before = Utc::now();
        let updated = orch
            .mark_retry_failure(record.id, FailureReason::new("third"))
            .await
            .unwrap()
            .unwrap();
        let after = Utc::now();
        assert_within(updated.next_retry_at.unwrap(), before, after, 4_000);

        // Attempt 3 fails: budget spent.
        orch.mark_retrying(record.id).await.unwrap().unwrap();
        let updated = orch
            .mark_retry_failure(
                record.id,
                FailureReason::new("final").with_stack("at handler"),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, FailedEventStatus::Failed);
        assert_eq!(updated.attempt_count, 3);
        assert_eq!(updated.error, "final");
        assert_eq!(updated.error_stack.as_deref(), Some("at handler"));
        assert_eq!(updated.next_retry_at, None);

        // Terminal: neither sweeps nor claims touch it again.
        assert!(orch.get_due_for_retry().await.unwrap().is_empty());
        assert!(orch.mark_retrying(record.id).await.unwrap().is_none());
    }

    /// One hour per attempt already made.
    #[derive(Debug)]
    struct HourPerAttempt;

    impl BackoffPolicy for HourPerAttempt {
        fn delay(&self, attempt_count: u32) -> std::time::Duration {
            std::time::Duration::from_secs(3_600 * u64::from(attempt_count))
        }
    }

    #[tokio::test]
    async fn custom_policy_shapes_delay_but_budget_decides_exhaustion() {
        let orch = RetryOrchestrator::with_policy(InMemoryFailedEventStore::arc(), Arc::new(HourPerAttempt));
        let record = orch
            .add_failed_event(&envelope(), "t", FailureReason::new("first"), Some(3))
            .await
            .unwrap();

        for attempt in 1..=2u32 {
            orch.mark_retrying(record.id).await.unwrap().unwrap();
            let before = Utc::now();
            let updated = orch
                .mark_retry_failure(record.id, FailureReason::new("again"))
                .await
                .unwrap()
                .unwrap();
            let after = Utc::now();
            assert_eq!(updated.status, FailedEventStatus::Pending);
            assert_eq!(updated.attempt_count, attempt);
            assert_within(updated.next_retry_at.unwrap(), before, after, 3_600_000 * i64::from(attempt));
        }

        orch.mark_retrying(record.id).await.unwrap().unwrap();
        let updated = orch
            .mark_retry_failure(record.id, FailureReason::new("last"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, FailedEventStatus::Failed);
        assert_eq!(updated.attempt_count, 3);
    }

    #[tokio::test]
    async fn resolved_record_with_stale_schedule_is_not_due() {
        let orch = orchestrator();
        let record = orch
            .add_failed_event(&envelope(), "t", FailureReason::new("e"), None)
            .await
            .unwrap();

        let mut stored = orch.find_by_id(record.id).await.unwrap().unwrap();
        stored.status = FailedEventStatus::Resolved;
        stored.next_retry_at = Some(Utc::now() - Duration::hours(1));
        orch.store().update(&stored).await.unwrap();

        assert!(orch.get_due_for_retry().await.unwrap().is_empty());
        assert!(orch.mark_retrying(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn success_resolves_as_system() {
        let orch = orchestrator();
        let record = orch
            .add_failed_event(&envelope(), "t", FailureReason::new("e"), None)
            .await
            .unwrap();

        orch.mark_retrying(record.id).await.unwrap().unwrap();
        let resolved = orch
            .mark_retry_success(record.id, None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.status, FailedEventStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("system"));
        assert_eq!(resolved.resolution.as_deref(), Some("Retry successful"));
        assert!(resolved.resolved_at.is_some());
        assert_eq!(resolved.next_retry_at, None);

        // A late failure report does not reopen it.
        let after = orch
            .mark_retry_failure(record.id, FailureReason::new("late"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, FailedEventStatus::Resolved);
    }

    #[tokio::test]
    async fn missing_records_are_logged_not_errors_on_the_automatic_path() {
        let orch = orchestrator();
        let id = FailedEventId::new();

        assert!(orch.mark_retrying(id).await.unwrap().is_none());
        assert!(orch.mark_retry_success(id, None).await.unwrap().is_none());
        assert!(
            orch.mark_retry_failure(id, FailureReason::new("e"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn interrupted_final_attempt_is_closed_as_failed() {
        let orch = orchestrator();
        let record = orch
            .add_failed_event(&envelope(), "t", FailureReason::new("e"), Some(1))
            .await
            .unwrap();

        // Claimed, then the process died before reporting an outcome.
        orch.mark_retrying(record.id).await.unwrap().unwrap();

        assert!(orch.mark_retrying(record.id).await.unwrap().is_none());
        let stored = orch.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FailedEventStatus::Failed);
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn manual_retry_revives_failed_record() {
        let orch = orchestrator();
        let record = orch
            .add_failed_event(&envelope(), "t", FailureReason::new("e"), Some(1))
            .await
            .unwrap();
        orch.mark_retrying(record.id).await.unwrap().unwrap();
        let failed = orch
            .mark_retry_failure(record.id, FailureReason::new("e"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, FailedEventStatus::Failed);

        let before = Utc::now();
        let revived = orch.retry_manually(record.id).await.unwrap();
        assert_eq!(revived.status, FailedEventStatus::Pending);
        assert_eq!(revived.attempt_count, 0);
        assert!(revived.next_retry_at.unwrap() >= before);

        let due = orch.get_due_for_retry().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, record.id);
    }

    #[tokio::test]
    async fn manual_resolve_and_remove() {
        let orch = orchestrator();
        let record = orch
            .add_failed_event(&envelope(), "t", FailureReason::new("e"), None)
            .await
            .unwrap();

        let resolved = orch
            .resolve_manually(record.id, "ops@example.com", "replayed by hand")
            .await
            .unwrap();
        assert_eq!(resolved.status, FailedEventStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("ops@example.com"));
        assert_eq!(resolved.resolution.as_deref(), Some("replayed by hand"));

        assert!(matches!(
            orch.resolve_manually(record.id, "ops", "again").await,
            Err(OrchestratorError::Domain(DomainError::InvalidTransition(_)))
        ));
        assert!(matches!(
            orch.retry_manually(record.id).await,
            Err(OrchestratorError::Domain(DomainError::InvalidTransition(_)))
        ));

        orch.remove(record.id).await.unwrap();
        assert!(matches!(
            orch.remove(record.id).await,
            Err(OrchestratorError::NotFound(id)) if id == record.id
        ));
        assert!(matches!(
            orch.retry_manually(record.id).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn topic_policy_overrides_default() {
        let orch = orchestrator().with_topic_policy(
            "slow",
            Arc::new(FixedBackoff::new(std::time::Duration::from_secs(30))),
        );

        let before = Utc::now();
        let slow = orch
            .add_failed_event(&envelope(), "slow", FailureReason::new("e"), None)
            .await
            .unwrap();
        let fast = orch
            .add_failed_event(&envelope(), "fast", FailureReason::new("e"), None)
            .await
            .unwrap();
        let after = Utc::now();

        assert_within(slow.next_retry_at.unwrap(), before, after, 30_000);
        assert_within(fast.next_retry_at.unwrap(), before, after, 1_000);
    }

    #[tokio::test]
    async fn due_batch_is_bounded() {
        let orch = RetryOrchestrator::with_policy(
            InMemoryFailedEventStore::arc(),
            Arc::new(FixedBackoff::new(std::time::Duration::ZERO)),
        )
        .with_batch_size(2);

        for _ in 0..3 {
            orch.add_failed_event(&envelope(), "t", FailureReason::new("e"), None)
                .await
                .unwrap();
        }

        assert_eq!(orch.get_due_for_retry().await.unwrap().len(), 2);
        let stats = orch.get_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.by_service["approval-service"], 3);
    }
}
