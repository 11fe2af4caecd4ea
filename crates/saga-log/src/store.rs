use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{MessageId, Result, SagaId, SagaLogQuery, SagaRecord, Version};

/// Core trait for saga log implementations.
///
/// The log holds one record per saga instance. All implementations must be
/// thread-safe (Send + Sync); writes for different saga ids never contend.
#[async_trait]
pub trait SagaLogStore: Send + Sync {
    /// Inserts a new record at version 1, whatever `record.version` holds.
    ///
    /// Fails with `AlreadyExists` if a record with the same id is present.
    async fn insert(&self, record: SagaRecord) -> Result<()>;

    /// Replaces a record, provided the stored version equals `expected`.
    ///
    /// The whole record is written as one unit. On success the stored
    /// version is `expected.next()`, which is also returned. Fails with
    /// `NotFound` if the record does not exist and `ConcurrencyConflict` if
    /// another writer got there first.
    async fn update(&self, record: SagaRecord, expected: Version) -> Result<Version>;

    /// Retrieves a record by id.
    async fn get(&self, id: SagaId) -> Result<Option<SagaRecord>>;

    /// Retrieves records matching a query, newest first.
    async fn query(&self, query: SagaLogQuery) -> Result<Vec<SagaRecord>>;

    /// Counts records grouped by status.
    async fn count_by_status(&self) -> Result<BTreeMap<String, u64>>;

    /// Counts records grouped by saga type.
    async fn count_by_type(&self) -> Result<BTreeMap<String, u64>>;

    /// Verifies the backend is reachable.
    async fn ping(&self) -> Result<()>;
}

#[async_trait]
impl<T: SagaLogStore + ?Sized> SagaLogStore for Arc<T> {
    async fn insert(&self, record: SagaRecord) -> Result<()> {
        (**self).insert(record).await
    }

    async fn update(&self, record: SagaRecord, expected: Version) -> Result<Version> {
        (**self).update(record, expected).await
    }

    async fn get(&self, id: SagaId) -> Result<Option<SagaRecord>> {
        (**self).get(id).await
    }

    async fn query(&self, query: SagaLogQuery) -> Result<Vec<SagaRecord>> {
        (**self).query(query).await
    }

    async fn count_by_status(&self) -> Result<BTreeMap<String, u64>> {
        (**self).count_by_status().await
    }

    async fn count_by_type(&self) -> Result<BTreeMap<String, u64>> {
        (**self).count_by_type().await
    }

    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }
}

/// Consumer-side deduplication of integration messages.
///
/// A message is claimed before it is handled. Claiming is atomic, so two
/// concurrent deliveries of the same message id cannot both succeed.
#[async_trait]
pub trait ProcessedMessageStore: Send + Sync {
    /// Claims a message for a consumer.
    ///
    /// Returns `true` if this call recorded the claim, `false` if the
    /// message had already been claimed.
    async fn claim(&self, consumer: &str, message_id: &MessageId) -> Result<bool>;

    /// Releases a claim so a redelivery can be handled again.
    async fn release(&self, consumer: &str, message_id: &MessageId) -> Result<()>;
}

#[async_trait]
impl<T: ProcessedMessageStore + ?Sized> ProcessedMessageStore for Arc<T> {
    async fn claim(&self, consumer: &str, message_id: &MessageId) -> Result<bool> {
        (**self).claim(consumer, message_id).await
    }

    async fn release(&self, consumer: &str, message_id: &MessageId) -> Result<()> {
        (**self).release(consumer, message_id).await
    }
}
