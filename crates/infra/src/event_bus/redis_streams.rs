//! Redis Streams publisher for redelivered events.
//!
//! Each envelope is appended with XADD to `{prefix}:{topic}`, so consumers
//! reading a topic's stream with their usual consumer group pick the
//! redelivery up like any other event.
//!
//! ## Entry fields
//!
//! - `event_id`, `event_type`, `occurred_at`: copied from the envelope
//! - `service`: present when the envelope names one
//! - `envelope`: the full envelope as JSON

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, instrument};

use redeliver_events::{EventEnvelope, EventPublisher};

/// Default stream key prefix.
pub const DEFAULT_STREAM_PREFIX: &str = "redeliver:events";

/// Default connect/read/write timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocking XADD publisher.
///
/// Holds one connection, opened on first publish and dropped after any
/// failure so the next publish reconnects. Every socket operation is bounded
/// by the configured timeout. Call it from a blocking context
/// (`spawn_blocking`), never directly on an async worker.
#[derive(Clone)]
pub struct RedisStreamsPublisher {
    client: Arc<redis::Client>,
    conn: Arc<Mutex<Option<redis::Connection>>>,
    stream_prefix: String,
    max_len: Option<usize>,
    timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RedisStreamsPublisher {
    /// Create a publisher. No connection is made until the first publish.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_prefix` - stream key prefix (default: "redeliver:events")
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_prefix: Option<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            conn: Arc::new(Mutex::new(None)),
            stream_prefix: stream_prefix.unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string()),
            max_len: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Trim each stream to roughly `max_len` entries (`MAXLEN ~`).
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Bound connect, read and write. Zero is treated as one millisecond.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn stream_key(&self, topic: &str) -> String {
        stream_key(&self.stream_prefix, topic)
    }

    fn lock_conn(&self) -> MutexGuard<'_, Option<redis::Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self) -> Result<redis::Connection, RedisStreamsError> {
        let conn = self
            .client
            .get_connection_with_timeout(self.timeout)
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        conn.set_read_timeout(Some(self.timeout))
            .and_then(|()| conn.set_write_timeout(Some(self.timeout)))
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        debug!(stream_prefix = %self.stream_prefix, "redis connection opened");
        Ok(conn)
    }

    fn xadd(&self, envelope: &EventEnvelope, body: &str) -> redis::Cmd {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(envelope.topic()));
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*") // Auto-generate entry ID
            .arg("event_id")
            .arg(envelope.event_id().to_string())
            .arg("event_type")
            .arg(envelope.event_type())
            .arg("occurred_at")
            .arg(envelope.occurred_at().to_rfc3339());
        if let Some(service) = envelope.service() {
            cmd.arg("service").arg(service);
        }
        cmd.arg("envelope").arg(body);
        cmd
    }
}

impl std::fmt::Debug for RedisStreamsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsPublisher")
            .field("stream_prefix", &self.stream_prefix)
            .field("max_len", &self.max_len)
            .field("timeout", &self.timeout)
            .field("connected", &self.lock_conn().is_some())
            .finish()
    }
}

impl EventPublisher for RedisStreamsPublisher {
    type Error = RedisStreamsError;

    #[instrument(
        skip(self, envelope),
        fields(
            topic = %envelope.topic(),
            event_id = %envelope.event_id(),
            event_type = %envelope.event_type()
        ),
        err
    )]
    fn publish(&self, envelope: EventEnvelope) -> Result<(), RedisStreamsError> {
        let body = serde_json::to_string(&envelope)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let cmd = self.xadd(&envelope, &body);

        let mut slot = self.lock_conn();
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.connect()?,
        };

        let _: String = cmd
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {}", e)))?;
        *slot = Some(conn);
        Ok(())
    }
}

fn stream_key(prefix: &str, topic: &str) -> String {
    format!("{prefix}:{topic}")
}
