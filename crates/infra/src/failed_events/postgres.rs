//! Postgres-backed failed-event store.
//!
//! One row per record in `failed_events` (see `migrations/`). The original
//! event and metadata are JSONB; status is stored as its upper-case name.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | FailedEventStoreError |
//! |------------|----------------------|-----------------------|
//! | Database (invalid password) | `28P01` | `Authentication` |
//! | Database (invalid authorization) | `28000` | `Authentication` |
//! | Database (unique violation) | `23505` | `AlreadyExists` (on create) |
//! | Database (other) | Any other | `Storage` |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Unavailable` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//! | Other | N/A | `Storage` |
//!
//! The sweep treats `Authentication` as fatal and disables itself.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{instrument, warn, Span};

use redeliver_core::{FailedEventId, FailedEventRecord, FailedEventStatus, Metadata};

use super::store::{FailedEventFilter, FailedEventStats, FailedEventStore, FailedEventStoreError};

/// Schema for the `failed_events` table.
pub const SCHEMA_SQL: &str = include_str!("../../migrations/0001_create_failed_events.sql");

const SELECT_COLUMNS: &str = r#"
    id, original_event, topic, service, event_type, error, error_stack,
    attempt_count, max_attempts, status, next_retry_at, metadata,
    resolved_at, resolved_by, resolution, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresFailedEventStore {
    pool: Arc<PgPool>,
}

impl PostgresFailedEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), FailedEventStoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn write(
        &self,
        operation: &str,
        record: &FailedEventRecord,
        guard: Option<(FailedEventStatus, u32)>,
    ) -> Result<u64, FailedEventStoreError> {
        let metadata = metadata_to_json(&record.metadata)?;
        let mut sql = String::from(
            r#"
            UPDATE failed_events SET
                original_event = $2,
                topic = $3,
                service = $4,
                event_type = $5,
                error = $6,
                error_stack = $7,
                attempt_count = $8,
                max_attempts = $9,
                status = $10,
                next_retry_at = $11,
                metadata = $12,
                resolved_at = $13,
                resolved_by = $14,
                resolution = $15,
                updated_at = $16
            WHERE id = $1
            "#,
        );
        if guard.is_some() {
            sql.push_str(" AND status = $17 AND attempt_count = $18");
        }

        let mut query = sqlx::query(&sql)
            .bind(record.id.as_uuid())
            .bind(&record.original_event)
            .bind(&record.topic)
            .bind(&record.service)
            .bind(&record.event_type)
            .bind(&record.error)
            .bind(&record.error_stack)
            .bind(to_i32(record.attempt_count))
            .bind(to_i32(record.max_attempts))
            .bind(record.status.as_str())
            .bind(record.next_retry_at)
            .bind(metadata)
            .bind(record.resolved_at)
            .bind(&record.resolved_by)
            .bind(&record.resolution)
            .bind(record.updated_at);
        if let Some((status, attempt_count)) = guard {
            query = query.bind(status.as_str()).bind(to_i32(attempt_count));
        }

        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl FailedEventStore for PostgresFailedEventStore {
    #[instrument(
        skip(self, record),
        fields(failed_event_id = %record.id, topic = %record.topic),
        err
    )]
    async fn create(&self, record: FailedEventRecord) -> Result<FailedEventRecord, FailedEventStoreError> {
        let metadata = metadata_to_json(&record.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO failed_events (
                id, original_event, topic, service, event_type, error, error_stack,
                attempt_count, max_attempts, status, next_retry_at, metadata,
                resolved_at, resolved_by, resolution, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.original_event)
        .bind(&record.topic)
        .bind(&record.service)
        .bind(&record.event_type)
        .bind(&record.error)
        .bind(&record.error_stack)
        .bind(to_i32(record.attempt_count))
        .bind(to_i32(record.max_attempts))
        .bind(record.status.as_str())
        .bind(record.next_retry_at)
        .bind(metadata)
        .bind(record.resolved_at)
        .bind(&record.resolved_by)
        .bind(&record.resolution)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                FailedEventStoreError::AlreadyExists(record.id)
            } else {
                map_sqlx_error("create", e)
            }
        })?;

        Ok(record)
    }

    #[instrument(skip(self), fields(failed_event_id = %id), err)]
    async fn find_by_id(&self, id: FailedEventId) -> Result<Option<FailedEventRecord>, FailedEventStoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM failed_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(skip(self), fields(record_count = tracing::field::Empty), err)]
    async fn find(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEventRecord>, FailedEventStoreError> {
        // NULL parameters disable their predicate.
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM failed_events
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR topic = $2)
              AND ($3::TEXT IS NULL OR service = $3)
              AND ($4::TEXT IS NULL OR event_type = $4)
              AND ($5::TIMESTAMPTZ IS NULL OR created_at >= $5)
              AND ($6::TIMESTAMPTZ IS NULL OR created_at <= $6)
            ORDER BY created_at DESC, id DESC
            LIMIT $7
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(&filter.topic)
            .bind(&filter.service)
            .bind(&filter.event_type)
            .bind(filter.created_after)
            .bind(filter.created_before)
            .bind(i64::from(filter.effective_limit()))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;

        let records = rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()?;
        Span::current().record("record_count", records.len());
        Ok(records)
    }

    #[instrument(skip(self), fields(record_count = tracing::field::Empty), err)]
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FailedEventRecord>, FailedEventStoreError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM failed_events
            WHERE status IN ('PENDING', 'RETRYING')
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_due", e))?;

        let records = skip_undecodable(rows.iter().map(decode_row))?;
        Span::current().record("record_count", records.len());
        Ok(records)
    }

    #[instrument(skip(self, record), fields(failed_event_id = %record.id, status = %record.status), err)]
    async fn update(&self, record: &FailedEventRecord) -> Result<(), FailedEventStoreError> {
        match self.write("update", record, None).await? {
            0 => Err(FailedEventStoreError::NotFound(record.id)),
            _ => Ok(()),
        }
    }

    #[instrument(
        skip(self, record),
        fields(failed_event_id = %record.id, status = %record.status),
        err
    )]
    async fn update_if(
        &self,
        record: &FailedEventRecord,
        expected_status: FailedEventStatus,
        expected_attempt_count: u32,
    ) -> Result<bool, FailedEventStoreError> {
        let affected = self
            .write(
                "update_if",
                record,
                Some((expected_status, expected_attempt_count)),
            )
            .await?;
        Ok(affected > 0)
    }

    #[instrument(skip(self), fields(failed_event_id = %id), err)]
    async fn delete(&self, id: FailedEventId) -> Result<bool, FailedEventStoreError> {
        let result = sqlx::query("DELETE FROM failed_events WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<FailedEventStats, FailedEventStoreError> {
        let mut stats = FailedEventStats::default();

        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM failed_events GROUP BY status")
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("stats", e))?;
        for (status, count) in by_status {
            let status: FailedEventStatus = status
                .parse()
                .map_err(|e| FailedEventStoreError::Serialization(format!("{e}")))?;
            stats.add_status(status, to_u64(count));
        }

        for (column, target) in [
            ("topic", &mut stats.by_topic),
            ("service", &mut stats.by_service),
            ("event_type", &mut stats.by_event_type),
        ] {
            let sql = format!(
                "SELECT {column}, COUNT(*) FROM failed_events \
                 WHERE {column} IS NOT NULL GROUP BY {column}"
            );
            let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("stats", e))?;
            target.extend(rows.into_iter().map(|(key, count)| (key, to_u64(count))));
        }

        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn ping(&self) -> Result<(), FailedEventStoreError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn metadata_to_json(metadata: &Metadata) -> Result<serde_json::Value, FailedEventStoreError> {
    serde_json::to_value(metadata).map_err(|e| FailedEventStoreError::Serialization(e.to_string()))
}

/// Keep the sweep going past rows that no longer decode; they stay in the
/// table for an operator to inspect or remove.
fn skip_undecodable(
    rows: impl Iterator<Item = Result<FailedEventRecord, FailedEventStoreError>>,
) -> Result<Vec<FailedEventRecord>, FailedEventStoreError> {
    let mut records = Vec::new();
    for row in rows {
        match row {
            Ok(record) => records.push(record),
            Err(FailedEventStoreError::Serialization(reason)) => {
                warn!(%reason, "skipping undecodable failed_events row");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

fn decode_row(row: &PgRow) -> Result<FailedEventRecord, FailedEventStoreError> {
    FailedEventRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_row", e))?
        .try_into()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> FailedEventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // invalid_password, invalid_authorization_specification
                Some("28P01") | Some("28000") => FailedEventStoreError::Authentication(msg),
                _ => FailedEventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => FailedEventStoreError::Unavailable(
            format!("connection pool unavailable in {operation}: {err}"),
        ),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            FailedEventStoreError::Unavailable(format!("connection error in {operation}: {err}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            FailedEventStoreError::Serialization(format!("row decode failed in {operation}: {err}"))
        }
        _ => FailedEventStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

// SQLx row types

#[derive(Debug)]
struct FailedEventRow {
    id: uuid::Uuid,
    original_event: serde_json::Value,
    topic: String,
    service: Option<String>,
    event_type: Option<String>,
    error: String,
    error_stack: Option<String>,
    attempt_count: i32,
    max_attempts: i32,
    status: String,
    next_retry_at: Option<DateTime<Utc>>,
    metadata: serde_json::Value,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<String>,
    resolution: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for FailedEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(FailedEventRow {
            id: row.try_get("id")?,
            original_event: row.try_get("original_event")?,
            topic: row.try_get("topic")?,
            service: row.try_get("service")?,
            event_type: row.try_get("event_type")?,
            error: row.try_get("error")?,
            error_stack: row.try_get("error_stack")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            status: row.try_get("status")?,
            next_retry_at: row.try_get("next_retry_at")?,
            metadata: row.try_get("metadata")?,
            resolved_at: row.try_get("resolved_at")?,
            resolved_by: row.try_get("resolved_by")?,
            resolution: row.try_get("resolution")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<FailedEventRow> for FailedEventRecord {
    type Error = FailedEventStoreError;

    fn try_from(row: FailedEventRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<FailedEventStatus>().map_err(|e| {
            FailedEventStoreError::Serialization(format!("row {}: {e}", row.id))
        })?;
        let metadata: Metadata = if row.metadata.is_null() {
            Metadata::new()
        } else {
            serde_json::from_value(row.metadata).map_err(|e| {
                FailedEventStoreError::Serialization(format!("row {} metadata: {e}", row.id))
            })?
        };
        let count = |n: i32, column: &str| {
            u32::try_from(n).map_err(|_| {
                FailedEventStoreError::Serialization(format!("row {}: negative {column}", row.id))
            })
        };

        Ok(FailedEventRecord {
            id: FailedEventId::from_uuid(row.id),
            original_event: row.original_event,
            topic: row.topic,
            service: row.service,
            event_type: row.event_type,
            error: row.error,
            error_stack: row.error_stack,
            attempt_count: count(row.attempt_count, "attempt_count")?,
            max_attempts: count(row.max_attempts, "max_attempts")?,
            status,
            next_retry_at: row.next_retry_at,
            metadata,
            resolved_at: row.resolved_at,
            resolved_by: row.resolved_by,
            resolution: row.resolution,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
