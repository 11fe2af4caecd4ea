//! Read-only views over the saga log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::SagaId;
use saga_log::{SagaLogQuery, SagaLogStore};
use serde::Serialize;

use crate::error::{Result, SagaError};
use crate::instance::SagaInstance;
use crate::state::SagaStatus;

/// Default page size for listings.
pub const DEFAULT_LIMIT: usize = 50;
/// Largest page size a listing may request.
pub const MAX_LIMIT: usize = 500;

/// Filter for listing sagas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaFilter {
    pub status: Option<SagaStatus>,
    pub saga_type: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SagaFilter {
    fn default() -> Self {
        Self {
            status: None,
            saga_type: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl SagaFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: SagaStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    /// Sets the page size, clamped to `1..=MAX_LIMIT`.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.clamp(1, MAX_LIMIT);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn to_query(&self) -> SagaLogQuery {
        let mut query = SagaLogQuery::new().limit(self.limit).offset(self.offset);
        if let Some(status) = self.status {
            query = query.status(status.as_str());
        }
        if let Some(ref saga_type) = self.saga_type {
            query = query.saga_type(saga_type.clone());
        }
        query
    }
}

/// Listing entry for one saga.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaSummary {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub correlation_id: Option<String>,
    pub steps_completed: usize,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&SagaInstance> for SagaSummary {
    fn from(saga: &SagaInstance) -> Self {
        Self {
            saga_id: saga.id(),
            saga_type: saga.saga_type().to_string(),
            status: saga.status(),
            correlation_id: saga.correlation_id().map(str::to_string),
            steps_completed: saga.completed_step_count(),
            failure_reason: saga.failure_reason().map(str::to_string),
            created_at: saga.created_at(),
            updated_at: saga.updated_at(),
        }
    }
}

/// Saga counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SagaStatistics {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
}

/// Status and query service. Every read goes to the store.
#[derive(Clone)]
pub struct SagaQueryService<S> {
    store: S,
}

impl<S: SagaLogStore> SagaQueryService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Lists sagas newest first.
    pub async fn list(&self, filter: &SagaFilter) -> Result<Vec<SagaSummary>> {
        let records = self.store.query(filter.to_query()).await?;
        records
            .into_iter()
            .map(|record| SagaInstance::from_record(record).map(|saga| SagaSummary::from(&saga)))
            .collect()
    }

    /// Returns the full instance, including step and attempt logs.
    pub async fn get(&self, id: SagaId) -> Result<SagaInstance> {
        let record = self.store.get(id).await?.ok_or(SagaError::NotFound(id))?;
        SagaInstance::from_record(record)
    }

    /// Counts sagas by status and by type. Every status appears, zero or not.
    pub async fn statistics(&self) -> Result<SagaStatistics> {
        let mut by_status: BTreeMap<String, u64> = SagaStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for (status, count) in self.store.count_by_status().await? {
            *by_status.entry(status).or_insert(0) += count;
        }
        let by_type = self.store.count_by_type().await?;

        Ok(SagaStatistics {
            total: by_status.values().sum(),
            by_status,
            by_type,
        })
    }

    /// Verifies the store is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await?;
        Ok(())
    }
}
