//! Failed-event persistence boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use redeliver_core::{FailedEventId, FailedEventRecord, FailedEventStatus};

/// Failed-event store abstraction.
///
/// The store is the single source of truth between sweeps; nothing is queued
/// in memory. Implementations must be safe to share across tasks.
///
/// `update` is a plain by-id write. `update_if` is the conditional form used
/// to claim a record: it only writes when the stored status and attempt count
/// still match what the caller read.
#[async_trait]
pub trait FailedEventStore: Send + Sync {
    /// Persist a new record.
    async fn create(&self, record: FailedEventRecord) -> Result<FailedEventRecord, FailedEventStoreError>;

    /// Get a record by ID.
    async fn find_by_id(&self, id: FailedEventId) -> Result<Option<FailedEventRecord>, FailedEventStoreError>;

    /// List records matching `filter`, newest first, bounded by the filter limit.
    async fn find(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEventRecord>, FailedEventStoreError>;

    /// Retryable records with `next_retry_at <= now`, earliest due first.
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FailedEventRecord>, FailedEventStoreError>;

    /// Overwrite a record. Fails with `NotFound` when it no longer exists.
    async fn update(&self, record: &FailedEventRecord) -> Result<(), FailedEventStoreError>;

    /// Overwrite a record only if its stored status and attempt count match.
    ///
    /// Returns `false` when the guard did not match or the record is gone.
    async fn update_if(
        &self,
        record: &FailedEventRecord,
        expected_status: FailedEventStatus,
        expected_attempt_count: u32,
    ) -> Result<bool, FailedEventStoreError>;

    /// Hard-delete a record. Returns whether it existed.
    async fn delete(&self, id: FailedEventId) -> Result<bool, FailedEventStoreError>;

    /// Aggregate counters over all records.
    async fn stats(&self) -> Result<FailedEventStats, FailedEventStoreError>;

    /// Cheap connectivity/authentication probe.
    async fn ping(&self) -> Result<(), FailedEventStoreError>;
}

/// Failed-event store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailedEventStoreError {
    #[error("failed event not found: {0}")]
    NotFound(FailedEventId),
    #[error("failed event already exists: {0}")]
    AlreadyExists(FailedEventId),
    #[error("store rejected authentication: {0}")]
    Authentication(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("record (de)serialization failed: {0}")]
    Serialization(String),
}

impl FailedEventStoreError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, FailedEventStoreError::Authentication(_))
    }

    /// The store itself is unreachable or misbehaving (not a property of one record).
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            FailedEventStoreError::Authentication(_)
                | FailedEventStoreError::Unavailable(_)
                | FailedEventStoreError::Storage(_)
        )
    }
}

/// Filter criteria for operator queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEventFilter {
    pub status: Option<FailedEventStatus>,
    pub topic: Option<String>,
    pub service: Option<String>,
    pub event_type: Option<String>,
    /// Records created at or after this time.
    pub created_after: Option<DateTime<Utc>>,
    /// Records created at or before this time.
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl FailedEventFilter {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 1000;

    pub fn with_status(mut self, status: FailedEventStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Limit actually applied: defaults to 50, capped at 1000.
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .min(Self::MAX_LIMIT)
    }

    pub fn matches(&self, record: &FailedEventRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.topic.as_deref().is_none_or(|t| record.topic == t)
            && self
                .service
                .as_deref()
                .is_none_or(|s| record.service.as_deref() == Some(s))
            && self
                .event_type
                .as_deref()
                .is_none_or(|e| record.event_type.as_deref() == Some(e))
            && self.created_after.is_none_or(|at| record.created_at >= at)
            && self.created_before.is_none_or(|at| record.created_at <= at)
    }
}

/// Aggregate counters over failed events.
///
/// `pending + retrying + failed + resolved == total` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEventStats {
    pub total: u64,
    pub pending: u64,
    pub retrying: u64,
    pub failed: u64,
    pub resolved: u64,
    pub by_topic: BTreeMap<String, u64>,
    pub by_service: BTreeMap<String, u64>,
    pub by_event_type: BTreeMap<String, u64>,
}

impl FailedEventStats {
    /// Count one record.
    pub fn add(&mut self, record: &FailedEventRecord) {
        self.add_status(record.status, 1);
        *self.by_topic.entry(record.topic.clone()).or_default() += 1;
        if let Some(service) = &record.service {
            *self.by_service.entry(service.clone()).or_default() += 1;
        }
        if let Some(event_type) = &record.event_type {
            *self.by_event_type.entry(event_type.clone()).or_default() += 1;
        }
    }

    /// Count `n` records with `status` (used by grouped SQL aggregates).
    pub fn add_status(&mut self, status: FailedEventStatus, n: u64) {
        self.total += n;
        match status {
            FailedEventStatus::Pending => self.pending += n,
            FailedEventStatus::Retrying => self.retrying += n,
            FailedEventStatus::Failed => self.failed += n,
            FailedEventStatus::Resolved => self.resolved += n,
        }
    }
}

#[async_trait]
impl<S> FailedEventStore for Arc<S>
where
    S: FailedEventStore + ?Sized,
{
    async fn create(&self, record: FailedEventRecord) -> Result<FailedEventRecord, FailedEventStoreError> {
        (**self).create(record).await
    }

    async fn find_by_id(&self, id: FailedEventId) -> Result<Option<FailedEventRecord>, FailedEventStoreError> {
        (**self).find_by_id(id).await
    }

    async fn find(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEventRecord>, FailedEventStoreError> {
        (**self).find(filter).await
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FailedEventRecord>, FailedEventStoreError> {
        (**self).find_due(now, limit).await
    }

    async fn update(&self, record: &FailedEventRecord) -> Result<(), FailedEventStoreError> {
        (**self).update(record).await
    }

    async fn update_if(
        &self,
        record: &FailedEventRecord,
        expected_status: FailedEventStatus,
        expected_attempt_count: u32,
    ) -> Result<bool, FailedEventStoreError> {
        (**self)
            .update_if(record, expected_status, expected_attempt_count)
            .await
    }

    async fn delete(&self, id: FailedEventId) -> Result<bool, FailedEventStoreError> {
        (**self).delete(id).await
    }

    async fn stats(&self) -> Result<FailedEventStats, FailedEventStoreError> {
        (**self).stats().await
    }

    async fn ping(&self) -> Result<(), FailedEventStoreError> {
        (**self).ping().await
    }
}
