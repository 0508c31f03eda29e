//! The failed-event record and its status machine.
//!
//! A `FailedEventRecord` is the durable unit of work of the reliability layer:
//! the original event (opaque), the last failure, attempt bookkeeping and a
//! status. Field names serialize in camelCase; this is the persisted shape
//! operator dashboards read, so it must stay stable.
//!
//! Transitions:
//!
//! ```text
//!            add
//!             │
//!             ▼        mark_retrying         success
//!         PENDING ───────────────────▶ RETRYING ───────▶ RESOLVED
//!           ▲  ▲                         │  │                ▲
//!           │  └──── failure (retries) ──┘  │                │
//!           │                               │ failure        │ resolve
//!  retry    │                               ▼ (exhausted)    │ manually
//!  manually └────────────────────────── FAILED ──────────────┘
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::FailedEventId;

/// Resolution recorded when an automatic redelivery succeeds without an explicit note.
pub const DEFAULT_RESOLUTION: &str = "Retry successful";

/// `resolved_by` recorded for automatic resolutions.
pub const SYSTEM_RESOLVER: &str = "system";

/// Default ceiling for redelivery attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Failed-event status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailedEventStatus {
    /// Waiting for its `next_retry_at`.
    Pending,
    /// Claimed by a sweep; redelivery in progress (or interrupted).
    Retrying,
    /// Attempts exhausted; needs an operator.
    Failed,
    /// Delivered or closed by an operator.
    Resolved,
}

impl FailedEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedEventStatus::Pending => "PENDING",
            FailedEventStatus::Retrying => "RETRYING",
            FailedEventStatus::Failed => "FAILED",
            FailedEventStatus::Resolved => "RESOLVED",
        }
    }

    /// Statuses the sweep may pick up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailedEventStatus::Pending | FailedEventStatus::Retrying)
    }
}

impl core::fmt::Display for FailedEventStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for FailedEventStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(FailedEventStatus::Pending),
            "RETRYING" => Ok(FailedEventStatus::Retrying),
            "FAILED" => Ok(FailedEventStatus::Failed),
            "RESOLVED" => Ok(FailedEventStatus::Resolved),
            other => Err(DomainError::validation(format!("unknown status: {other}"))),
        }
    }
}

/// Primitive value allowed in the metadata bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for MetadataValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::String(value.to_rfc3339())
    }
}

/// Correlation ids, original timestamps and similar.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Human-readable message plus diagnostic trace of a processing failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub message: String,
    pub stack: Option<String>,
}

impl FailureReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Capture an error and its `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = vec![err.to_string()];
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        let stack = (chain.len() > 1).then(|| chain.join("\n  caused by: "));
        Self {
            message: err.to_string(),
            stack,
        }
    }
}

impl From<&anyhow::Error> for FailureReason {
    fn from(err: &anyhow::Error) -> Self {
        // `{:?}` renders the context chain and, when captured, the backtrace.
        Self {
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
        }
    }
}

impl From<anyhow::Error> for FailureReason {
    fn from(err: anyhow::Error) -> Self {
        Self::from(&err)
    }
}

/// Input for creating a record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFailedEvent {
    pub original_event: JsonValue,
    pub topic: String,
    pub service: Option<String>,
    pub event_type: Option<String>,
    pub error: FailureReason,
    pub max_attempts: u32,
    pub metadata: Metadata,
}

impl NewFailedEvent {
    pub fn new(original_event: JsonValue, topic: impl Into<String>, error: FailureReason) -> Self {
        Self {
            original_event,
            topic: topic.into(),
            service: None,
            event_type: None,
            error,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            metadata: Metadata::new(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Durable record of an event that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEventRecord {
    pub id: FailedEventId,
    /// Envelope as received. Never interpreted by this layer.
    pub original_event: JsonValue,
    pub topic: String,
    pub service: Option<String>,
    pub event_type: Option<String>,
    pub error: String,
    pub error_stack: Option<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub status: FailedEventStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FailedEventRecord {
    /// Create a `PENDING` record with `attempt_count = 0`.
    pub fn new(new: NewFailedEvent, next_retry_at: DateTime<Utc>) -> DomainResult<Self> {
        if new.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if new.topic.trim().is_empty() {
            return Err(DomainError::validation("topic must not be empty"));
        }

        let now = Utc::now();
        Ok(Self {
            id: FailedEventId::new(),
            original_event: new.original_event,
            topic: new.topic,
            service: new.service,
            event_type: new.event_type,
            error: new.error.message,
            error_stack: new.error.stack,
            attempt_count: 0,
            max_attempts: new.max_attempts,
            status: FailedEventStatus::Pending,
            next_retry_at: Some(next_retry_at),
            metadata: new.metadata,
            resolved_at: None,
            resolved_by: None,
            resolution: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Retryable status and `next_retry_at <= now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_retryable() && self.next_retry_at.is_some_and(|at| at <= now)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// `PENDING|RETRYING -> RETRYING`, counting the attempt up front so an
    /// interrupted delivery still shows as attempted.
    pub fn mark_retrying(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.is_retryable() {
            return Err(self.transition_error("mark retrying"));
        }
        if self.attempts_exhausted() {
            return Err(DomainError::invalid_transition(format!(
                "record {} already used {}/{} attempts",
                self.id, self.attempt_count, self.max_attempts
            )));
        }
        self.status = FailedEventStatus::Retrying;
        self.attempt_count += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Failed attempt with retries left: back to `PENDING` at `next_retry_at`.
    pub fn schedule_retry(
        &mut self,
        error: FailureReason,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status == FailedEventStatus::Resolved {
            return Err(self.transition_error("reschedule"));
        }
        self.status = FailedEventStatus::Pending;
        self.next_retry_at = Some(next_retry_at);
        self.set_error(error);
        self.updated_at = now;
        Ok(())
    }

    /// Failed attempt with no retries left: `FAILED`, keeping the final error.
    pub fn mark_exhausted(&mut self, error: FailureReason, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status == FailedEventStatus::Resolved {
            return Err(self.transition_error("mark failed"));
        }
        if !self.attempts_exhausted() {
            return Err(DomainError::invalid_transition(format!(
                "record {} still has attempts left ({}/{})",
                self.id, self.attempt_count, self.max_attempts
            )));
        }
        self.status = FailedEventStatus::Failed;
        self.next_retry_at = None;
        self.set_error(error);
        self.updated_at = now;
        Ok(())
    }

    /// Any non-resolved status -> `RESOLVED`.
    pub fn mark_resolved(
        &mut self,
        resolved_by: impl Into<String>,
        resolution: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status == FailedEventStatus::Resolved {
            return Err(self.transition_error("resolve"));
        }
        self.status = FailedEventStatus::Resolved;
        self.next_retry_at = None;
        self.resolved_at = Some(now);
        self.resolved_by = Some(resolved_by.into());
        self.resolution = Some(resolution.into());
        self.updated_at = now;
        Ok(())
    }

    /// Operator override: reset the attempt counter and make the record due now.
    ///
    /// This is the only way out of `FAILED` back into automatic retries.
    pub fn reset_for_manual_retry(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status == FailedEventStatus::Resolved {
            return Err(self.transition_error("retry"));
        }
        self.status = FailedEventStatus::Pending;
        self.attempt_count = 0;
        self.next_retry_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Check the record-level invariants.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if self.attempt_count > self.max_attempts {
            return Err(DomainError::validation(format!(
                "attempt_count {} exceeds max_attempts {}",
                self.attempt_count, self.max_attempts
            )));
        }
        match self.status {
            FailedEventStatus::Failed if !self.attempts_exhausted() => Err(
                DomainError::validation("FAILED record still has attempts left"),
            ),
            FailedEventStatus::Resolved if self.resolved_at.is_none() => {
                Err(DomainError::validation("RESOLVED record has no resolved_at"))
            }
            FailedEventStatus::Pending | FailedEventStatus::Retrying
                if self.next_retry_at.is_none() =>
            {
                Err(DomainError::validation("retryable record has no next_retry_at"))
            }
            _ => Ok(()),
        }
    }

    fn set_error(&mut self, error: FailureReason) {
        self.error = error.message;
        self.error_stack = error.stack;
    }

    fn transition_error(&self, action: &str) -> DomainError {
        DomainError::invalid_transition(format!(
            "cannot {action} record {} in status {}",
            self.id, self.status
        ))
    }
}
