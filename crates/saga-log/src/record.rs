use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SagaId;

/// Version number of a saga record, used for optimistic concurrency control.
///
/// A record is inserted at version 1 and every successful update bumps the
/// version by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the version (0) of a record that does not exist yet.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version (1) of a freshly inserted record.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// One durable row of the saga log.
///
/// `saga_type`, `status` and `created_at` are broken out so backends can
/// filter and order without parsing the document. The document holds the
/// complete saga instance (steps, attempt logs, context).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    /// The saga this record belongs to.
    pub id: SagaId,

    /// Which step-definition template drives the saga.
    pub saga_type: String,

    /// Current lifecycle status, as its wire name (e.g. `"RUNNING"`).
    pub status: String,

    /// Correlation id propagated to remote services and logs.
    pub correlation_id: Option<String>,

    /// Version after the last successful write.
    pub version: Version,

    /// When the saga was created.
    pub created_at: DateTime<Utc>,

    /// When the saga last changed state.
    pub updated_at: DateTime<Utc>,

    /// The serialized saga instance.
    pub document: serde_json::Value,
}

impl SagaRecord {
    /// Creates a record at version 1, ready to be inserted.
    pub fn new(
        id: SagaId,
        saga_type: impl Into<String>,
        status: impl Into<String>,
        correlation_id: Option<String>,
        created_at: DateTime<Utc>,
        document: serde_json::Value,
    ) -> Self {
        Self {
            id,
            saga_type: saga_type.into(),
            status: status.into(),
            correlation_id,
            version: Version::first(),
            created_at,
            updated_at: created_at,
            document,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
    }

    #[test]
    fn version_initial_and_first() {
        assert_eq!(Version::initial().as_i64(), 0);
        assert_eq!(Version::first().as_i64(), 1);
        assert_eq!(Version::initial().next(), Version::first());
    }

    #[test]
    fn new_record_starts_at_first_version() {
        let now = Utc::now();
        let record = SagaRecord::new(
            SagaId::new(),
            "complete-affiliate-registration",
            "PENDING",
            None,
            now,
            serde_json::json!({}),
        );

        assert_eq!(record.version, Version::first());
        assert_eq!(record.created_at, record.updated_at);
        assert_eq!(record.status, "PENDING");
    }
}
