use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use redeliver_core::{EventId, Metadata, MetadataValue};

/// Envelope for an event travelling on the bus.
///
/// This is the unit a consumer receives and the unit the reliability layer
/// stores (as an opaque document) when the consumer fails.
///
/// Notes:
/// - `topic` is the logical channel the event was published on.
/// - `service` / `event_type` are routing metadata used for filtering and stats.
/// - `payload` is domain-specific and never inspected here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    event_id: EventId,
    topic: String,
    service: Option<String>,
    event_type: String,
    occurred_at: DateTime<Utc>,
    correlation_id: Option<String>,
    #[serde(default)]
    metadata: Metadata,
    payload: JsonValue,
}

impl EventEnvelope {
    pub fn new(topic: impl Into<String>, event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event_id: EventId::new(),
            topic: topic.into(),
            service: None,
            event_type: event_type.into(),
            occurred_at: Utc::now(),
            correlation_id: None,
            metadata: Metadata::new(),
            payload,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }
}
