use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when interacting with the saga log.
#[derive(Debug, Error)]
pub enum SagaLogError {
    /// A concurrent writer updated the record first.
    /// The expected version did not match the stored version.
    #[error("Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// A record with this id already exists.
    #[error("Saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// The saga was not found in the log.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The backend refused the write (used by test doubles and unavailable backends).
    #[error("Saga log unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga log operations.
pub type Result<T> = std::result::Result<T, SagaLogError>;
