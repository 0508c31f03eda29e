//! In-memory failed-event store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use redeliver_core::{FailedEventId, FailedEventRecord, FailedEventStatus};

use super::store::{FailedEventFilter, FailedEventStats, FailedEventStore, FailedEventStoreError};

#[derive(Debug, Default)]
pub struct InMemoryFailedEventStore {
    records: RwLock<HashMap<FailedEventId, FailedEventRecord>>,
}

impl InMemoryFailedEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(
        &self,
    ) -> Result<RwLockReadGuard<'_, HashMap<FailedEventId, FailedEventRecord>>, FailedEventStoreError>
    {
        self.records
            .read()
            .map_err(|_| FailedEventStoreError::Storage("in-memory store lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<FailedEventId, FailedEventRecord>>, FailedEventStoreError>
    {
        self.records
            .write()
            .map_err(|_| FailedEventStoreError::Storage("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl FailedEventStore for InMemoryFailedEventStore {
    async fn create(&self, record: FailedEventRecord) -> Result<FailedEventRecord, FailedEventStoreError> {
        let mut records = self.write()?;
        if records.contains_key(&record.id) {
            return Err(FailedEventStoreError::AlreadyExists(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: FailedEventId) -> Result<Option<FailedEventRecord>, FailedEventStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn find(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEventRecord>, FailedEventStoreError> {
        let records = self.read()?;
        let mut result: Vec<_> = records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        // Newest first; ids are v7 so they break ties in creation order.
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(filter.effective_limit() as usize);
        Ok(result)
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FailedEventRecord>, FailedEventStoreError> {
        let records = self.read()?;
        let mut due: Vec<_> = records.values().filter(|r| r.is_due(now)).cloned().collect();

        due.sort_by_key(|r| (r.next_retry_at, r.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn update(&self, record: &FailedEventRecord) -> Result<(), FailedEventStoreError> {
        let mut records = self.write()?;
        match records.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(FailedEventStoreError::NotFound(record.id)),
        }
    }

    async fn update_if(
        &self,
        record: &FailedEventRecord,
        expected_status: FailedEventStatus,
        expected_attempt_count: u32,
    ) -> Result<bool, FailedEventStoreError> {
        let mut records = self.write()?;
        match records.get_mut(&record.id) {
            Some(stored)
                if stored.status == expected_status
                    && stored.attempt_count == expected_attempt_count =>
            {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: FailedEventId) -> Result<bool, FailedEventStoreError> {
        Ok(self.write()?.remove(&id).is_some())
    }

    async fn stats(&self) -> Result<FailedEventStats, FailedEventStoreError> {
        let records = self.read()?;
        let mut stats = FailedEventStats::default();
        for record in records.values() {
            stats.add(record);
        }
        Ok(stats)
    }

    async fn ping(&self) -> Result<(), FailedEventStoreError> {
        self.read().map(|_| ())
    }
}
