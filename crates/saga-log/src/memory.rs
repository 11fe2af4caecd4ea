use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    MessageId, Result, SagaId, SagaLogError, SagaLogQuery, SagaRecord, Version,
    store::{ProcessedMessageStore, SagaLogStore},
};

#[derive(Debug, Default)]
struct Records {
    by_id: HashMap<SagaId, (u64, SagaRecord)>,
    next_seq: u64,
}

/// In-memory saga log for tests and local development.
///
/// Provides the same interface and versioning rules as the PostgreSQL
/// implementation.
#[derive(Clone, Default)]
pub struct InMemorySagaLogStore {
    records: Arc<RwLock<Records>>,
    processed: Arc<RwLock<HashSet<(String, MessageId)>>>,
    fail_on_update: Arc<AtomicBool>,
}

impl InMemorySagaLogStore {
    /// Creates a new empty in-memory saga log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.records.read().await.by_id.len()
    }

    /// Makes every subsequent `update` fail with `Unavailable`.
    pub fn set_fail_on_update(&self, fail: bool) {
        self.fail_on_update.store(fail, Ordering::SeqCst);
    }

    /// Clears all records and processed-message claims.
    pub async fn clear(&self) {
        let mut records = self.records.write().await;
        records.by_id.clear();
        records.next_seq = 0;
        self.processed.write().await.clear();
    }
}

#[async_trait]
impl SagaLogStore for InMemorySagaLogStore {
    async fn insert(&self, mut record: SagaRecord) -> Result<()> {
        record.version = Version::first();
        let mut records = self.records.write().await;
        if records.by_id.contains_key(&record.id) {
            return Err(SagaLogError::AlreadyExists(record.id));
        }

        let seq = records.next_seq;
        records.next_seq += 1;
        records.by_id.insert(record.id, (seq, record));
        Ok(())
    }

    async fn update(&self, mut record: SagaRecord, expected: Version) -> Result<Version> {
        if self.fail_on_update.load(Ordering::SeqCst) {
            return Err(SagaLogError::Unavailable(
                "in-memory store configured to fail updates".to_string(),
            ));
        }

        let mut records = self.records.write().await;
        let (_, stored) = records
            .by_id
            .get_mut(&record.id)
            .ok_or(SagaLogError::NotFound(record.id))?;

        if stored.version != expected {
            metrics::counter!("saga_log_write_conflicts_total", "backend" => "memory")
                .increment(1);
            tracing::debug!(
                saga_id = %record.id,
                expected = expected.as_i64(),
                actual = stored.version.as_i64(),
                "stale saga write rejected"
            );
            return Err(SagaLogError::ConcurrencyConflict {
                saga_id: record.id,
                expected,
                actual: stored.version,
            });
        }

        let next = expected.next();
        record.version = next;
        // id, type and creation time are immutable once inserted
        record.saga_type = stored.saga_type.clone();
        record.created_at = stored.created_at;
        *stored = record;
        Ok(next)
    }

    async fn get(&self, id: SagaId) -> Result<Option<SagaRecord>> {
        let records = self.records.read().await;
        Ok(records.by_id.get(&id).map(|(_, record)| record.clone()))
    }

    async fn query(&self, query: SagaLogQuery) -> Result<Vec<SagaRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records
            .by_id
            .values()
            .filter(|(_, r)| query.matches(&r.saga_type, &r.status))
            .collect();

        matching.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| seq_b.cmp(seq_a))
        });

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);

        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn count_by_status(&self) -> Result<BTreeMap<String, u64>> {
        let records = self.records.read().await;
        let mut counts = BTreeMap::new();
        for (_, record) in records.by_id.values() {
            *counts.entry(record.status.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn count_by_type(&self) -> Result<BTreeMap<String, u64>> {
        let records = self.records.read().await;
        let mut counts = BTreeMap::new();
        for (_, record) in records.by_id.values() {
            *counts.entry(record.saga_type.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ProcessedMessageStore for InMemorySagaLogStore {
    async fn claim(&self, consumer: &str, message_id: &MessageId) -> Result<bool> {
        let mut processed = self.processed.write().await;
        Ok(processed.insert((consumer.to_string(), message_id.clone())))
    }

    async fn release(&self, consumer: &str, message_id: &MessageId) -> Result<()> {
        let mut processed = self.processed.write().await;
        processed.remove(&(consumer.to_string(), message_id.clone()));
        Ok(())
    }
}
